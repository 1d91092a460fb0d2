//! Wire-visible protocol types

use serde::{Deserialize, Serialize};

/// Vendor id of classic devices enumerated over HID.
pub const VENDOR_CLASSIC: u16 = 0x534c;
/// Product id of classic firmware on the HID vendor id.
pub const PRODUCT_CLASSIC_FIRMWARE: u16 = 0x0001;
/// Vendor id shared by WebUSB-class firmware and bootloaders.
pub const VENDOR_NEXTGEN: u16 = 0x1209;
/// Bootloader product id on the WebUSB vendor id.
pub const PRODUCT_NEXTGEN_BOOTLOADER: u16 = 0x53c0;
/// Firmware product id on the WebUSB vendor id.
pub const PRODUCT_NEXTGEN_FIRMWARE: u16 = 0x53c1;

/// Hardware flavor of an enumerated device.
///
/// Carried internally (the status page shows it) but never serialized to
/// clients; the change notifier zeroes it before comparing enumerations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// Classic device on the HID interface
    #[default]
    ClassicHid,
    /// Classic device running WebUSB-capable firmware
    ClassicWebusb,
    /// Classic device in a WebUSB-capable bootloader
    ClassicWebusbBoot,
    /// Next-generation device firmware
    NextGen,
    /// Next-generation device bootloader
    NextGenBoot,
    /// UDP emulator
    Emulator,
}

/// One device in an enumeration, as serialized to clients.
///
/// `path` is the registry-assigned public id, not a backend-native path.
/// `session` and `debug_session` are the ids of the sessions currently
/// holding the device's normal and debug interfaces, if any.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnumerateEntry {
    pub path: String,
    pub vendor: u16,
    pub product: u16,
    #[serde(skip)]
    pub device_type: DeviceType,
    pub debug: bool,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(rename = "debugSession", default)]
    pub debug_session: Option<String>,
}

/// A protocol message crossing the device boundary. The payload is opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: u16,
    pub data: Vec<u8>,
}

/// Reply body of the version endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
}

/// Reply body of a successful acquire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_json_shape() {
        let entry = EnumerateEntry {
            path: "1".to_string(),
            vendor: VENDOR_NEXTGEN,
            product: PRODUCT_NEXTGEN_FIRMWARE,
            device_type: DeviceType::NextGen,
            debug: true,
            session: Some("5".to_string()),
            debug_session: None,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "path": "1",
                "vendor": 0x1209,
                "product": 0x53c1,
                "debug": true,
                "session": "5",
                "debugSession": null,
            })
        );
    }

    #[test]
    fn test_entry_json_roundtrip_drops_device_type() {
        let entry = EnumerateEntry {
            path: "2".to_string(),
            vendor: 0,
            product: 0,
            device_type: DeviceType::Emulator,
            debug: false,
            session: None,
            debug_session: None,
        };
        let json = serde_json::to_string(&entry).unwrap();
        let back: EnumerateEntry = serde_json::from_str(&json).unwrap();
        // device_type is not part of the wire form
        assert_eq!(back.device_type, DeviceType::default());
        assert_eq!(back.path, "2");
    }
}
