//! libusb-backed transport
//!
//! Native paths are the hex-encoded port-number chain prefixed with `lib`,
//! which stays stable for a device as long as it remains plugged into the
//! same physical port. Matching is by the known vendor/product ids plus a
//! vendor-specific interface 0; the debug capability is detected from the
//! config descriptor at enumeration time.

use crate::device::{Backend, Device, DeviceInfo};
use crate::error::{Result, TransportError};
use protocol::{
    DeviceType, PRODUCT_CLASSIC_FIRMWARE, PRODUCT_NEXTGEN_BOOTLOADER, PRODUCT_NEXTGEN_FIRMWARE,
    VENDOR_CLASSIC, VENDOR_NEXTGEN,
};
use rusb::constants::LIBUSB_CLASS_VENDOR_SPEC;
use rusb::{Context, DeviceDescriptor, DeviceHandle, UsbContext};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

const LIBUSB_PREFIX: &str = "lib";
const USB_CONFIG_NUM: u8 = 1;

/// Per-attempt timeout of the transfer poll loop. Closing a handle unblocks
/// a pending read within roughly one slice.
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Clone, Copy)]
struct IfaceData {
    number: u8,
    ep_in: u8,
    ep_out: u8,
}

const NORMAL_IFACE: IfaceData = IfaceData {
    number: 0,
    ep_in: 0x81,
    ep_out: 0x01,
};

const DEBUG_IFACE: IfaceData = IfaceData {
    number: 1,
    ep_in: 0x82,
    ep_out: 0x02,
};

/// libusb backend over a shared [`rusb::Context`].
pub struct LibUsb {
    context: Context,
    /// Detach the kernel driver before claiming (Linux).
    detach: bool,
}

impl LibUsb {
    pub fn new(detach: bool) -> Result<Self> {
        Ok(Self {
            context: Context::new()?,
            detach,
        })
    }
}

impl Backend for LibUsb {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        let mut infos = Vec::new();
        for dev in self.context.devices()?.iter() {
            let desc = match dev.device_descriptor() {
                Ok(desc) => desc,
                Err(err) => {
                    debug!("skipping device without descriptor: {err}");
                    continue;
                }
            };
            let Some(device_type) = match_device(&dev, &desc) else {
                continue;
            };
            infos.push(DeviceInfo {
                path: port_path(&dev),
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
                device_type,
                debug: detect_debug(&dev),
            });
        }
        Ok(infos)
    }

    fn owns(&self, path: &str) -> bool {
        path.starts_with(LIBUSB_PREFIX)
    }

    fn connect(&self, path: &str, debug: bool, reset: bool) -> Result<Arc<dyn Device>> {
        for dev in self.context.devices()?.iter() {
            let Ok(desc) = dev.device_descriptor() else {
                continue;
            };
            if match_device(&dev, &desc).is_some() && port_path(&dev) == path {
                return self.open(&dev, debug, reset);
            }
        }
        Err(TransportError::NotFound)
    }
}

impl LibUsb {
    fn open(&self, dev: &rusb::Device<Context>, debug: bool, reset: bool) -> Result<Arc<dyn Device>> {
        let mut handle = dev.open()?;

        if reset {
            if let Err(err) = handle.reset() {
                // do not abort, some firmwares come back slowly from reset
                warn!("device reset failed: {err}");
            }
        }

        match handle.active_configuration() {
            Ok(current) if current == USB_CONFIG_NUM => {}
            _ => {
                if let Err(err) = handle.set_active_configuration(USB_CONFIG_NUM) {
                    warn!("setting configuration failed: {err}");
                }
            }
        }

        let iface = if debug { DEBUG_IFACE } else { NORMAL_IFACE };

        let mut attach = false;
        if self.detach {
            if handle.kernel_driver_active(iface.number)? {
                debug!(interface = iface.number, "detaching kernel driver");
                handle.detach_kernel_driver(iface.number)?;
                attach = true;
            }
        }

        handle.claim_interface(iface.number)?;

        Ok(Arc::new(LibUsbDevice {
            handle: Mutex::new(handle),
            iface,
            attach,
            closed: AtomicBool::new(false),
        }))
    }
}

fn match_device(dev: &rusb::Device<Context>, desc: &DeviceDescriptor) -> Option<DeviceType> {
    let device_type = match_type(desc)?;

    // interface 0 must exist and be vendor-specific; HID-class interface 0
    // means the device is driven by a platform HID stack instead
    let config = dev.active_config_descriptor().ok()?;
    let iface0 = config
        .interfaces()
        .find(|i| i.number() == NORMAL_IFACE.number)?;
    let vendor_specific = iface0
        .descriptors()
        .any(|alt| alt.class_code() == LIBUSB_CLASS_VENDOR_SPEC);
    let is_classic_hid = device_type == DeviceType::ClassicHid;
    if vendor_specific || is_classic_hid {
        Some(device_type)
    } else {
        None
    }
}

fn match_type(desc: &DeviceDescriptor) -> Option<DeviceType> {
    let vid = desc.vendor_id();
    let pid = desc.product_id();

    if vid == VENDOR_CLASSIC && pid == PRODUCT_CLASSIC_FIRMWARE {
        return Some(DeviceType::ClassicHid);
    }
    if vid != VENDOR_NEXTGEN {
        return None;
    }
    // classic hardware on the WebUSB vendor id reports device version 1.x
    let classic = desc.device_version().major() == 1;
    match pid {
        PRODUCT_NEXTGEN_BOOTLOADER if classic => Some(DeviceType::ClassicWebusbBoot),
        PRODUCT_NEXTGEN_BOOTLOADER => Some(DeviceType::NextGenBoot),
        PRODUCT_NEXTGEN_FIRMWARE if classic => Some(DeviceType::ClassicWebusb),
        PRODUCT_NEXTGEN_FIRMWARE => Some(DeviceType::NextGen),
        _ => None,
    }
}

fn port_path(dev: &rusb::Device<Context>) -> String {
    let ports = dev.port_numbers().unwrap_or_default();
    format!("{}{}{}", LIBUSB_PREFIX, dev.bus_number(), hex::encode(ports))
}

fn detect_debug(dev: &rusb::Device<Context>) -> bool {
    let Ok(config) = dev.config_descriptor(0) else {
        return false;
    };
    for iface in config.interfaces() {
        for alt in iface.descriptors() {
            if alt.interface_number() == DEBUG_IFACE.number
                && alt.setting_number() == 0
                && alt.class_code() == LIBUSB_CLASS_VENDOR_SPEC
                && alt.num_endpoints() == 2
            {
                let addrs: Vec<u8> = alt.endpoint_descriptors().map(|ep| ep.address()).collect();
                if addrs.contains(&DEBUG_IFACE.ep_in) && addrs.contains(&DEBUG_IFACE.ep_out) {
                    return true;
                }
            }
        }
    }
    false
}

/// An open libusb device, claimed on one interface.
///
/// The handle sits behind a mutex because interrupt transfers on one handle
/// must not interleave; the poll loop locks per 50 ms slice, so close gets
/// its turn within one slice.
struct LibUsbDevice {
    handle: Mutex<DeviceHandle<Context>>,
    iface: IfaceData,
    /// Reattach the kernel driver on close.
    attach: bool,
    closed: AtomicBool,
}

impl LibUsbDevice {
    fn is_disconnect(err: &rusb::Error) -> bool {
        // disconnecting should produce NoDevice only, but in practice Io,
        // Pipe and Other show up as well
        matches!(
            err,
            rusb::Error::NoDevice | rusb::Error::Io | rusb::Error::Pipe | rusb::Error::Other
        )
    }
}

impl Device for LibUsbDevice {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::ClosedDevice);
            }
            let result = {
                let handle = self.handle.lock().unwrap();
                handle.read_interrupt(self.iface.ep_in, buf, POLL_TIMEOUT)
            };
            match result {
                // empty reports show up occasionally, skip them
                Ok(0) => continue,
                Ok(n) => return Ok(n),
                Err(rusb::Error::Timeout) => continue,
                Err(err) if Self::is_disconnect(&err) => {
                    debug!("read failed, device probably disconnected: {err}");
                    return Err(TransportError::Disconnected);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::ClosedDevice);
            }
            let result = {
                let handle = self.handle.lock().unwrap();
                handle.write_interrupt(self.iface.ep_out, buf, POLL_TIMEOUT)
            };
            match result {
                Ok(n) => return Ok(n),
                Err(rusb::Error::Timeout) => continue,
                Err(err) if Self::is_disconnect(&err) => {
                    debug!("write failed, device probably disconnected: {err}");
                    return Err(TransportError::Disconnected);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn close(&self, disconnected: bool) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);

        // an in-flight transfer finishes its slice before this lock is
        // granted, and the poll loop exits on the closed flag
        let mut handle = self.handle.lock().unwrap();

        if !disconnected {
            // drain residual reports so the next claimant starts clean;
            // reading a vanished device is unreliable, hence the skip
            let mut buf = [0u8; 64];
            while handle
                .read_interrupt(self.iface.ep_in, &mut buf, POLL_TIMEOUT)
                .is_ok()
            {}
        }

        if let Err(err) = handle.release_interface(self.iface.number) {
            // it is just a release, the handle is going away regardless
            debug!("releasing interface failed: {err}");
        }
        if self.attach {
            if let Err(err) = handle.attach_kernel_driver(self.iface.number) {
                debug!("reattaching kernel driver failed: {err}");
            }
        }
        Ok(())
    }
}
