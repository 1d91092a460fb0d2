//! UDP emulator transport
//!
//! Device emulators listen on loopback UDP ports and speak the same
//! 64-byte report protocol as the hardware. A configured port pair maps to
//! one emulated device; the debug interface, when configured, is a second
//! port. Native paths are `udp-<normal-port>`.

use crate::device::{Backend, Device, DeviceInfo};
use crate::error::{Result, TransportError};
use protocol::DeviceType;
use std::io::ErrorKind;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const UDP_PREFIX: &str = "udp-";
const EMULATOR_HOST: &str = "127.0.0.1";

const PING: &[u8] = b"PINGPING";
const PONG: &[u8] = b"PONGPONG";
const PING_TIMEOUT: Duration = Duration::from_millis(500);

/// Poll slice of the read loop; closing a handle unblocks a pending read
/// within roughly one slice.
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// One configured emulator: normal port plus optional debug port (0 = none).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub normal: u16,
    pub debug: u16,
}

/// UDP emulator backend over a fixed set of configured port pairs.
pub struct UdpEmulator {
    pairs: Vec<PortPair>,
}

impl UdpEmulator {
    pub fn new(pairs: Vec<PortPair>) -> Self {
        Self { pairs }
    }

    /// An emulator is "plugged in" when it answers the ping exchange.
    fn ping(port: u16) -> bool {
        let Ok(socket) = UdpSocket::bind((EMULATOR_HOST, 0)) else {
            return false;
        };
        if socket.connect((EMULATOR_HOST, port)).is_err() {
            return false;
        }
        if socket.set_read_timeout(Some(PING_TIMEOUT)).is_err() {
            return false;
        }
        if socket.send(PING).is_err() {
            return false;
        }
        let mut buf = [0u8; 8];
        match socket.recv(&mut buf) {
            Ok(n) => &buf[..n] == PONG,
            Err(_) => false,
        }
    }
}

impl Backend for UdpEmulator {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        let mut infos = Vec::new();
        for pair in &self.pairs {
            if Self::ping(pair.normal) {
                infos.push(DeviceInfo {
                    path: format!("{}{}", UDP_PREFIX, pair.normal),
                    vendor_id: 0,
                    product_id: 0,
                    device_type: DeviceType::Emulator,
                    debug: pair.debug != 0,
                });
            }
        }
        Ok(infos)
    }

    fn owns(&self, path: &str) -> bool {
        path.starts_with(UDP_PREFIX)
    }

    fn connect(&self, path: &str, debug: bool, _reset: bool) -> Result<Arc<dyn Device>> {
        let port: u16 = path
            .strip_prefix(UDP_PREFIX)
            .and_then(|p| p.parse().ok())
            .ok_or(TransportError::NotFound)?;
        let pair = self
            .pairs
            .iter()
            .find(|pair| pair.normal == port)
            .ok_or(TransportError::NotFound)?;

        let target = if debug {
            if pair.debug == 0 {
                return Err(TransportError::NoDebugLink);
            }
            pair.debug
        } else {
            pair.normal
        };
        debug!(port = target, "dialing emulator");
        UdpDevice::dial(target)
    }
}

struct UdpDevice {
    socket: UdpSocket,
    closed: AtomicBool,
}

impl UdpDevice {
    fn dial(port: u16) -> Result<Arc<dyn Device>> {
        let socket = UdpSocket::bind((EMULATOR_HOST, 0))?;
        socket.connect((EMULATOR_HOST, port))?;
        socket.set_read_timeout(Some(POLL_TIMEOUT))?;
        Ok(Arc::new(UdpDevice {
            socket,
            closed: AtomicBool::new(false),
        }))
    }
}

impl Device for UdpDevice {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::ClosedDevice);
            }
            match self.socket.recv(buf) {
                Ok(n) => return Ok(n),
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    continue
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ClosedDevice);
        }
        Ok(self.socket.send(buf)?)
    }

    fn close(&self, _disconnected: bool) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// Bind an emulator stub that answers pings and echoes reports.
    fn spawn_emulator_stub() -> u16 {
        let socket = UdpSocket::bind((EMULATOR_HOST, 0)).unwrap();
        let port = socket.local_addr().unwrap().port();
        thread::spawn(move || {
            let mut buf = [0u8; 64];
            while let Ok((n, peer)) = socket.recv_from(&mut buf) {
                if &buf[..n] == PING {
                    let _ = socket.send_to(PONG, peer);
                } else {
                    let _ = socket.send_to(&buf[..n], peer);
                }
            }
        });
        port
    }

    #[test]
    fn test_enumerate_pings_configured_ports() {
        let live = spawn_emulator_stub();
        let dead = {
            // allocate a port nothing listens on afterwards
            let socket = UdpSocket::bind((EMULATOR_HOST, 0)).unwrap();
            socket.local_addr().unwrap().port()
        };

        let backend = UdpEmulator::new(vec![
            PortPair {
                normal: live,
                debug: 9999,
            },
            PortPair {
                normal: dead,
                debug: 0,
            },
        ]);
        let infos = backend.enumerate().unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].path, format!("udp-{live}"));
        assert_eq!(infos[0].device_type, DeviceType::Emulator);
        assert!(infos[0].debug);
    }

    #[test]
    fn test_connect_and_echo() {
        let port = spawn_emulator_stub();
        let backend = UdpEmulator::new(vec![PortPair {
            normal: port,
            debug: 0,
        }]);

        let dev = backend.connect(&format!("udp-{port}"), false, false).unwrap();
        let report = [0x3F; 64];
        dev.write(&report).unwrap();
        let mut buf = [0u8; 64];
        let n = dev.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &report[..]);
    }

    #[test]
    fn test_debug_connect_requires_debug_port() {
        let port = spawn_emulator_stub();
        let backend = UdpEmulator::new(vec![PortPair {
            normal: port,
            debug: 0,
        }]);
        let err = backend
            .connect(&format!("udp-{port}"), true, false)
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::NoDebugLink));
    }

    #[test]
    fn test_close_unblocks_read() {
        let port = spawn_emulator_stub();
        let backend = UdpEmulator::new(vec![PortPair {
            normal: port,
            debug: 0,
        }]);
        let dev = backend.connect(&format!("udp-{port}"), false, false).unwrap();

        let reader = {
            let dev = Arc::clone(&dev);
            thread::spawn(move || {
                let mut buf = [0u8; 64];
                dev.read(&mut buf)
            })
        };
        thread::sleep(Duration::from_millis(20));
        dev.close(false).unwrap();
        let err = reader.join().unwrap().unwrap_err();
        assert!(matches!(err, TransportError::ClosedDevice));
    }
}
