//! Minimal status page
//!
//! A human-readable view of the current enumeration for support purposes.
//! No scripts, no external assets; everything else about the daemon is
//! reachable over the POST API.

use super::api::{ApiError, AppState};
use axum::extract::State;
use axum::response::Html;
use protocol::DeviceType;

pub async fn page(State(state): State<AppState>) -> Result<Html<String>, ApiError> {
    let entries = state.core.enumerate().await?;

    let mut rows = String::new();
    for entry in &entries {
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{:04x}:{:04x}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            entry.path,
            entry.vendor,
            entry.product,
            type_label(entry.device_type),
            entry.session.as_deref().unwrap_or("-"),
            entry.debug_session.as_deref().unwrap_or("-"),
        ));
    }

    let html = format!(
        "<!DOCTYPE html>\n<html><head><title>hwbridge status</title></head><body>\n\
         <h1>hwbridge</h1>\n\
         <p>version {}</p>\n\
         <p>{} device(s) connected</p>\n\
         <table border=\"1\">\n\
         <tr><th>id</th><th>device</th><th>type</th><th>session</th><th>debug session</th></tr>\n\
         {rows}</table>\n\
         </body></html>\n",
        state.version,
        entries.len(),
    );
    Ok(Html(html))
}

fn type_label(device_type: DeviceType) -> &'static str {
    match device_type {
        DeviceType::ClassicHid => "classic (HID)",
        DeviceType::ClassicWebusb => "classic",
        DeviceType::ClassicWebusbBoot => "classic bootloader",
        DeviceType::NextGen => "next-gen",
        DeviceType::NextGenBoot => "next-gen bootloader",
        DeviceType::Emulator => "emulator",
    }
}
