//! Framed message I/O over a device handle

use super::error::Result;
use protocol::wire;
use protocol::{Deframer, Message, REPORT_LEN};
use transport::Device;

/// Write one message as zero-padded reports.
pub fn write_message(device: &dyn Device, msg: &Message) -> Result<()> {
    for report in wire::pack(msg.kind, &msg.data) {
        device.write(&report)?;
    }
    Ok(())
}

/// Read one framed message, skipping stale reports left in the bus.
pub fn read_message(device: &dyn Device) -> Result<Message> {
    let mut deframer = Deframer::new();
    let mut buf = [0u8; REPORT_LEN];
    loop {
        let n = device.read(&mut buf)?;
        if let Some(msg) = deframer.push(&buf[..n])? {
            return Ok(msg);
        }
    }
}
