//! Device registry
//!
//! Backend-native paths are unstable across reconnects and differ per
//! backend, so clients never see them. The registry assigns each
//! continuously-enumerated device a short decimal public id and owns the
//! bidirectional `{public id <-> native path}` mapping. An id is retired
//! when its device stops enumerating; a replugged device gets a fresh id.

use std::collections::{BTreeMap, HashMap};
use transport::DeviceInfo;

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    /// public id -> backend-native path
    paths: BTreeMap<u32, String>,
    next_id: u32,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile the mapping against one backend enumeration.
    ///
    /// Unknown native paths get fresh ids; mapped ids whose paths are no
    /// longer observed are retired (the caller force-releases their
    /// sessions). Returns the infos with `path` rewritten to the public id,
    /// sorted ascending by path. The ordering is part of the contract:
    /// change detection compares sorted sequences.
    pub fn reconcile(&mut self, mut observed: Vec<DeviceInfo>) -> Vec<DeviceInfo> {
        for dev in &observed {
            if !self.paths.values().any(|native| *native == dev.path) {
                self.next_id += 1;
                self.paths.insert(self.next_id, dev.path.clone());
            }
        }
        self.paths
            .retain(|_, native| observed.iter().any(|dev| dev.path == *native));

        let reverse: HashMap<&str, String> = self
            .paths
            .iter()
            .map(|(id, native)| (native.as_str(), id.to_string()))
            .collect();
        for dev in &mut observed {
            if let Some(public) = reverse.get(dev.path.as_str()) {
                dev.path = public.clone();
            }
        }
        observed.sort_by(|a, b| a.path.cmp(&b.path));
        observed
    }

    /// Resolve a public id back to the backend-native path.
    pub fn native_path(&self, public: &str) -> Option<&str> {
        let id: u32 = public.parse().ok()?;
        self.paths.get(&id).map(String::as_str)
    }
}
