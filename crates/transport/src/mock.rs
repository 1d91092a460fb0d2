//! Scripted in-memory backend for tests
//!
//! Mock devices echo every complete framed message they receive, so a
//! read-write call round-trips without scripting. Reads block on a condvar
//! until a report is queued, the handle is closed, or the scripted device
//! "disconnects", which makes the mock good enough to exercise the
//! cancellation and hot-unplug paths.

use crate::device::{Backend, Device, DeviceInfo};
use crate::error::{Result, TransportError};
use protocol::wire;
use protocol::{Deframer, DeviceType, REPORT_LEN};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Default)]
struct MockState {
    devices: BTreeMap<String, MockEntry>,
}

#[derive(Default)]
struct MockEntry {
    debug_link: bool,
    fail_connects: u32,
    connects: u32,
    resets: Vec<bool>,
    handles: Vec<Arc<MockDevice>>,
}

/// Scripted backend; hand out [`MockController`]s to drive it from tests.
#[derive(Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

/// Test-side handle for attaching, detaching and scripting mock devices.
#[derive(Clone)]
pub struct MockController {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn controller(&self) -> MockController {
        MockController {
            state: Arc::clone(&self.state),
        }
    }
}

impl MockController {
    /// Make a device appear on the bus.
    pub fn add_device(&self, path: &str, debug_link: bool) {
        let mut state = self.state.lock().unwrap();
        state.devices.insert(
            path.to_string(),
            MockEntry {
                debug_link,
                ..MockEntry::default()
            },
        );
    }

    /// Simulate unplugging: the device stops enumerating and every open
    /// handle starts failing with a disconnect error.
    pub fn remove_device(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.devices.remove(path) {
            for handle in entry.handles {
                handle.mark_disconnected();
            }
        }
    }

    /// Queue a framed reply on every open handle of `path`.
    pub fn push_reply(&self, path: &str, kind: u16, data: &[u8]) {
        let state = self.state.lock().unwrap();
        if let Some(entry) = state.devices.get(path) {
            for handle in &entry.handles {
                handle.queue_reports(&wire::pack(kind, data));
            }
        }
    }

    /// Make the next `n` connects to `path` fail.
    pub fn fail_connects(&self, path: &str, n: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.devices.get_mut(path) {
            entry.fail_connects = n;
        }
    }

    /// How many times `path` was successfully connected.
    pub fn connect_count(&self, path: &str) -> u32 {
        let state = self.state.lock().unwrap();
        state.devices.get(path).map(|e| e.connects).unwrap_or(0)
    }

    /// The `reset` flag of each successful connect to `path`, in order.
    pub fn connect_resets(&self, path: &str) -> Vec<bool> {
        let state = self.state.lock().unwrap();
        state
            .devices
            .get(path)
            .map(|e| e.resets.clone())
            .unwrap_or_default()
    }
}

impl Backend for MockBackend {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .devices
            .iter()
            .map(|(path, entry)| DeviceInfo {
                path: path.clone(),
                vendor_id: protocol::VENDOR_NEXTGEN,
                product_id: protocol::PRODUCT_NEXTGEN_FIRMWARE,
                device_type: DeviceType::NextGen,
                debug: entry.debug_link,
            })
            .collect())
    }

    fn owns(&self, path: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.devices.contains_key(path)
    }

    fn connect(&self, path: &str, debug: bool, reset: bool) -> Result<Arc<dyn Device>> {
        let mut state = self.state.lock().unwrap();
        let entry = state.devices.get_mut(path).ok_or(TransportError::NotFound)?;
        if debug && !entry.debug_link {
            return Err(TransportError::NoDebugLink);
        }
        if entry.fail_connects > 0 {
            entry.fail_connects -= 1;
            return Err(TransportError::Io(std::io::Error::other(
                "scripted connect failure",
            )));
        }
        entry.connects += 1;
        entry.resets.push(reset);
        let device = Arc::new(MockDevice::default());
        entry.handles.push(Arc::clone(&device));
        Ok(device)
    }
}

#[derive(Default)]
struct MockDeviceState {
    read_queue: VecDeque<Vec<u8>>,
    deframer: Deframer,
    closed: bool,
    disconnected: bool,
}

/// One open handle on a mock device.
#[derive(Default)]
pub struct MockDevice {
    state: Mutex<MockDeviceState>,
    wakeup: Condvar,
}

impl MockDevice {
    fn mark_disconnected(&self) {
        self.state.lock().unwrap().disconnected = true;
        self.wakeup.notify_all();
    }

    fn queue_reports(&self, reports: &[protocol::Report]) {
        let mut state = self.state.lock().unwrap();
        for rep in reports {
            state.read_queue.push_back(rep.to_vec());
        }
        drop(state);
        self.wakeup.notify_all();
    }
}

impl Device for MockDevice {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.disconnected {
                return Err(TransportError::Disconnected);
            }
            if state.closed {
                return Err(TransportError::ClosedDevice);
            }
            if let Some(rep) = state.read_queue.pop_front() {
                let n = rep.len().min(buf.len());
                buf[..n].copy_from_slice(&rep[..n]);
                return Ok(n);
            }
            state = self.wakeup.wait_timeout(state, WAIT_SLICE).unwrap().0;
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.disconnected {
            return Err(TransportError::Disconnected);
        }
        if state.closed {
            return Err(TransportError::ClosedDevice);
        }
        // echo complete messages back as the scripted reply
        if let Ok(Some(msg)) = state.deframer.push(&buf[..buf.len().min(REPORT_LEN)]) {
            for rep in wire::pack(msg.kind, &msg.data) {
                state.read_queue.push_back(rep.to_vec());
            }
            self.wakeup.notify_all();
        }
        Ok(buf.len())
    }

    fn close(&self, _disconnected: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.wakeup.notify_all();
        Ok(())
    }
}
