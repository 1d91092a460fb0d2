//! Origin validation
//!
//! Browser requests must carry `Origin`; anything not on the allowlist is
//! rejected outright. Non-browser clients (no `Origin` header) pass, the
//! loopback bind is their protection. `localhost:[58]xxx` eases local
//! development.

use axum::extract::Request;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

static ALLOWED_ORIGINS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^https://([A-Za-z0-9_-]+\.)*trezor\.io$",
        r"^https?://localhost:[58][0-9]{3}$",
        r"^https://([A-Za-z0-9_-]+\.)*sldev\.cz$",
        r"^https?://([A-Za-z0-9_-]+\.)*trezoriovpjcahpzkrewelclulmszwbqpzmzgub37gbcjlvluxtruqad\.onion$",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("static origin pattern"))
    .collect()
});

const ALLOW_HEADERS: &str = "Accept, Accept-Language, Content-Language, Origin, Content-Type";
const ALLOW_METHODS: &str = "POST, OPTIONS";

pub fn origin_allowed(origin: &str) -> bool {
    ALLOWED_ORIGINS.iter().any(|re| re.is_match(origin))
}

/// Middleware enforcing the origin policy and answering preflights.
pub async fn enforce(req: Request, next: Next) -> Response {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    if let Some(origin) = &origin {
        if !origin_allowed(origin) {
            debug!(origin, "origin rejected");
            return StatusCode::FORBIDDEN.into_response();
        }
    }

    if req.method() == Method::OPTIONS {
        let mut response = StatusCode::OK.into_response();
        let headers = response.headers_mut();
        if let Some(value) = origin.as_deref().and_then(|o| HeaderValue::from_str(o).ok()) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOW_HEADERS),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOW_METHODS),
        );
        return response;
    }

    let mut response = next.run(req).await;
    if let Some(value) = origin.as_deref().and_then(|o| HeaderValue::from_str(o).ok()) {
        response
            .headers_mut()
            .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_domains_allowed() {
        assert!(origin_allowed("https://trezor.io"));
        assert!(origin_allowed("https://wallet.trezor.io"));
        assert!(origin_allowed("https://deep.sub.trezor.io"));
        assert!(origin_allowed("https://beta.sldev.cz"));
        assert!(origin_allowed(
            "http://trezoriovpjcahpzkrewelclulmszwbqpzmzgub37gbcjlvluxtruqad.onion"
        ));
    }

    #[test]
    fn test_localhost_dev_ports_allowed() {
        assert!(origin_allowed("http://localhost:8000"));
        assert!(origin_allowed("https://localhost:5999"));
        assert!(!origin_allowed("http://localhost:3000"));
        assert!(!origin_allowed("http://localhost:80000"));
    }

    #[test]
    fn test_lookalikes_rejected() {
        assert!(!origin_allowed("http://trezor.io"));
        assert!(!origin_allowed("https://trezor.io.evil.com"));
        assert!(!origin_allowed("https://eviltrezor.io"));
        assert!(!origin_allowed("https://example.com"));
        assert!(!origin_allowed("null"));
    }
}
