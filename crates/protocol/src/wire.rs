//! Message framing over fixed 64-byte reports and the outer bridge form
//!
//! # Wire form (USB boundary)
//!
//! ```text
//! first report:        3F 23 23 [kind: u16 BE] [size: u32 BE] [payload: 55 bytes]
//! continuation report: 3F [payload: 63 bytes]
//! ```
//!
//! The final report is zero-padded to 64 bytes. Readers skip inbound reports
//! until one carries the full `? # #` magic; stale frames from an earlier,
//! abandoned exchange can be left sitting in the bus.
//!
//! # Outer form (HTTP boundary)
//!
//! ```text
//! [kind: u16 BE] [size: u32 BE] [payload]
//! ```
//!
//! The total length must equal `6 + size`.

use crate::error::{ProtocolError, Result};
use crate::types::Message;

/// Size of one device report.
pub const REPORT_LEN: usize = 64;

const REP_MARKER: u8 = b'?';
const REP_MAGIC: u8 = b'#';
const HEADER_LEN: usize = 9;
const OUTER_HEADER_LEN: usize = 6;

/// Payload bytes carried by the first report.
pub const FIRST_CHUNK: usize = REPORT_LEN - HEADER_LEN;
/// Payload bytes carried by each continuation report.
pub const NEXT_CHUNK: usize = REPORT_LEN - 1;

/// One fixed-size device report.
pub type Report = [u8; REPORT_LEN];

/// Pack a message into zero-padded 64-byte reports.
pub fn pack(kind: u16, data: &[u8]) -> Vec<Report> {
    let mut reports = Vec::with_capacity(1 + data.len() / NEXT_CHUNK);

    let mut rep: Report = [0; REPORT_LEN];
    rep[0] = REP_MARKER;
    rep[1] = REP_MAGIC;
    rep[2] = REP_MAGIC;
    rep[3..5].copy_from_slice(&kind.to_be_bytes());
    rep[5..9].copy_from_slice(&(data.len() as u32).to_be_bytes());

    let mut written = 0;
    let mut offset = HEADER_LEN;
    while written < data.len() {
        let n = (REPORT_LEN - offset).min(data.len() - written);
        rep[offset..offset + n].copy_from_slice(&data[written..written + n]);
        written += n;
        offset += n;
        if offset == REPORT_LEN {
            reports.push(rep);
            rep = [0; REPORT_LEN];
            rep[0] = REP_MARKER;
            offset = 1;
        }
    }
    if offset != 1 {
        reports.push(rep);
    }
    reports
}

/// Incremental report parser.
///
/// Push reports as they arrive; the completed message is returned once the
/// advertised size has been read. Reports seen before the header magic are
/// silently skipped.
#[derive(Debug, Default)]
pub struct Deframer {
    synced: bool,
    kind: u16,
    size: usize,
    data: Vec<u8>,
}

impl Deframer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one inbound report.
    ///
    /// Returns `Ok(None)` while more reports are needed. After the message
    /// completes the deframer resets and can parse the next one.
    pub fn push(&mut self, rep: &[u8]) -> Result<Option<Message>> {
        if !self.synced {
            if rep.len() < HEADER_LEN
                || rep[0] != REP_MARKER
                || rep[1] != REP_MAGIC
                || rep[2] != REP_MAGIC
            {
                // previous message left in the bus, skip
                return Ok(None);
            }
            self.synced = true;
            self.kind = u16::from_be_bytes([rep[3], rep[4]]);
            self.size = u32::from_be_bytes([rep[5], rep[6], rep[7], rep[8]]) as usize;
            self.data = Vec::with_capacity(self.size.min(1 << 20));
            self.data.extend_from_slice(&rep[HEADER_LEN..]);
        } else {
            if rep.is_empty() || rep[0] != REP_MARKER {
                return Err(ProtocolError::MalformedWireFormat);
            }
            self.data.extend_from_slice(&rep[1..]);
        }

        if self.data.len() >= self.size {
            self.data.truncate(self.size);
            let msg = Message {
                kind: self.kind,
                data: std::mem::take(&mut self.data),
            };
            self.synced = false;
            return Ok(Some(msg));
        }
        Ok(None)
    }
}

/// Parse a complete sequence of reports into a message.
pub fn unpack(reports: &[Report]) -> Result<Message> {
    let mut deframer = Deframer::new();
    for rep in reports {
        if let Some(msg) = deframer.push(rep)? {
            return Ok(msg);
        }
    }
    Err(ProtocolError::MalformedWireFormat)
}

/// Encode a message into the outer bridge form.
pub fn to_outer(msg: &Message) -> Vec<u8> {
    let mut out = Vec::with_capacity(OUTER_HEADER_LEN + msg.data.len());
    out.extend_from_slice(&msg.kind.to_be_bytes());
    out.extend_from_slice(&(msg.data.len() as u32).to_be_bytes());
    out.extend_from_slice(&msg.data);
    out
}

/// Decode a message from the outer bridge form.
pub fn from_outer(body: &[u8]) -> Result<Message> {
    if body.len() < OUTER_HEADER_LEN {
        return Err(ProtocolError::MalformedData);
    }
    let kind = u16::from_be_bytes([body[0], body[1]]);
    let size = u32::from_be_bytes([body[2], body[3], body[4], body[5]]) as usize;
    let data = &body[OUTER_HEADER_LEN..];
    if data.len() != size {
        return Err(ProtocolError::MalformedData);
    }
    Ok(Message {
        kind,
        data: data.to_vec(),
    })
}

/// Decode the outer form and run a payload validator on the result.
///
/// Any validator rejection is reported as malformed data; the payload itself
/// is otherwise never inspected.
pub fn from_outer_validated(body: &[u8], validate: impl FnOnce(&[u8]) -> bool) -> Result<Message> {
    let msg = from_outer(body)?;
    if !validate(&msg.data) {
        return Err(ProtocolError::MalformedData);
    }
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_outer_roundtrip() {
        for len in [0, 1, 6, 55, 64 * 1024] {
            let msg = Message {
                kind: 0xABCD,
                data: payload(len),
            };
            let outer = to_outer(&msg);
            assert_eq!(outer.len(), 6 + len);
            assert_eq!(from_outer(&outer).unwrap(), msg);
        }
    }

    #[test]
    fn test_outer_rejects_short_body() {
        assert_eq!(from_outer(&[0, 1, 0, 0]), Err(ProtocolError::MalformedData));
    }

    #[test]
    fn test_outer_rejects_length_mismatch() {
        // header says 2 payload bytes, body carries 3
        let body = [0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0xAA, 0xBB, 0xCC];
        assert_eq!(from_outer(&body), Err(ProtocolError::MalformedData));
    }

    #[test]
    fn test_validator_rejection_is_malformed_data() {
        let msg = Message {
            kind: 1,
            data: vec![0xFF],
        };
        let outer = to_outer(&msg);
        assert_eq!(
            from_outer_validated(&outer, |_| false),
            Err(ProtocolError::MalformedData)
        );
        assert_eq!(from_outer_validated(&outer, |_| true).unwrap(), msg);
    }

    #[test]
    fn test_pack_first_report_layout() {
        // 55 payload bytes fit the first report exactly
        let reports = pack(0x1234, &payload(55));
        assert_eq!(reports.len(), 1);
        let rep = &reports[0];
        assert_eq!(&rep[..9], &[0x3F, 0x23, 0x23, 0x12, 0x34, 0x00, 0x00, 0x00, 0x37]);
        assert_eq!(&rep[9..], payload(55).as_slice());
    }

    #[test]
    fn test_pack_empty_payload_is_single_padded_report() {
        let reports = pack(0x0001, &[]);
        assert_eq!(reports.len(), 1);
        assert_eq!(&reports[0][..9], &[0x3F, 0x23, 0x23, 0x00, 0x01, 0, 0, 0, 0]);
        assert!(reports[0][9..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_pack_second_report_layout() {
        // the 56th byte spills into a continuation report
        let data = payload(56);
        let reports = pack(0x1234, &data);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1][0], 0x3F);
        assert_eq!(reports[1][1], data[55]);
        assert!(reports[1][2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_pack_report_counts() {
        for (len, want) in [(0, 1), (1, 1), (55, 1), (56, 2), (118, 2), (119, 3)] {
            assert_eq!(pack(0, &payload(len)).len(), want, "payload len {}", len);
        }
    }

    #[test]
    fn test_wire_roundtrip_boundaries() {
        for len in [0, 1, 55, 56, 63, 64, 8192] {
            let msg = Message {
                kind: 0x7F01,
                data: payload(len),
            };
            let reports = pack(msg.kind, &msg.data);
            assert_eq!(unpack(&reports).unwrap(), msg, "payload len {}", len);
        }
    }

    #[test]
    fn test_deframer_skips_stale_reports() {
        let mut stale: Report = [0; REPORT_LEN];
        stale[0] = 0x3F; // marker but no magic
        let garbage: Report = [0xAA; REPORT_LEN];

        let msg = Message {
            kind: 3,
            data: payload(100),
        };
        let mut reports = vec![stale, garbage];
        reports.extend(pack(msg.kind, &msg.data));
        assert_eq!(unpack(&reports).unwrap(), msg);
    }

    #[test]
    fn test_deframer_rejects_unmarked_continuation() {
        let mut reports = pack(9, &payload(200));
        reports[1][0] = 0x00;
        assert_eq!(unpack(&reports), Err(ProtocolError::MalformedWireFormat));
    }

    #[test]
    fn test_deframer_resets_after_message() {
        let first = Message {
            kind: 1,
            data: payload(10),
        };
        let second = Message {
            kind: 2,
            data: payload(70),
        };
        let mut deframer = Deframer::new();
        let mut out = Vec::new();
        for rep in pack(first.kind, &first.data)
            .iter()
            .chain(pack(second.kind, &second.data).iter())
        {
            if let Some(msg) = deframer.push(rep).unwrap() {
                out.push(msg);
            }
        }
        assert_eq!(out, vec![first, second]);
    }
}
