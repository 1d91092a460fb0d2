//! Session table
//!
//! A session is a client's exclusive claim on one device interface. The two
//! maps (normal and debug) are guarded together by the core's sessions
//! mutex; a device may host one session in each without conflict.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use transport::Device;

/// One live session.
pub struct Session {
    /// Public device id this session holds.
    pub device_path: String,
    pub id: String,
    pub device: Arc<dyn Device>,
    /// Raised by CAS for the duration of one call; lives outside the
    /// sessions mutex so a long transfer does not serialize the table.
    pub in_flight: Arc<AtomicBool>,
}

#[derive(Default)]
pub struct SessionTable {
    normal: HashMap<String, Session>,
    debug: HashMap<String, Session>,
    latest_id: u64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, debug: bool) -> &HashMap<String, Session> {
        if debug {
            &self.debug
        } else {
            &self.normal
        }
    }

    fn map_mut(&mut self, debug: bool) -> &mut HashMap<String, Session> {
        if debug {
            &mut self.debug
        } else {
            &mut self.normal
        }
    }

    pub fn get(&self, id: &str, debug: bool) -> Option<&Session> {
        self.map(debug).get(id)
    }

    /// Linear scan for the session holding a device, if any.
    pub fn find_by_device(&self, device_path: &str, debug: bool) -> Option<&Session> {
        self.map(debug).values().find(|s| s.device_path == device_path)
    }

    pub fn insert(&mut self, debug: bool, session: Session) {
        self.map_mut(debug).insert(session.id.clone(), session);
    }

    pub fn remove(&mut self, id: &str, debug: bool) -> Option<Session> {
        self.map_mut(debug).remove(id)
    }

    /// Session ids of devices no longer present in `device_paths`.
    pub fn disconnected_ids(&self, device_paths: &[&str], debug: bool) -> Vec<String> {
        self.map(debug)
            .values()
            .filter(|s| !device_paths.contains(&s.device_path.as_str()))
            .map(|s| s.id.clone())
            .collect()
    }

    /// Mint the next session id; never reused within a run.
    pub fn mint_id(&mut self, debug: bool) -> String {
        self.latest_id += 1;
        if debug {
            format!("debug{}", self.latest_id)
        } else {
            self.latest_id.to_string()
        }
    }
}
