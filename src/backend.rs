//! Host HID access
//!
//! The session never talks to `hidapi` directly. It goes through [`HidBackend`]
//! and [`HidHandle`] so that enumeration, open, write and close can be
//! replaced by [`mock::MockBackend`] in tests.

use std::ffi::CString;
use std::fmt;

use hidapi::{DeviceInfo, HidApi, HidDevice};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("HID API error: {0}")]
    HidApi(#[from] hidapi::HidError),

    #[error("{0}")]
    Other(String),
}

/// How writes are retried when the host HID stack rejects a report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteQuirk {
    /// Retry once with a single 0x00 byte in front of the report. Some host
    /// stacks want a padding report-id byte even though the report already
    /// starts with its id.
    #[default]
    LeadingZeroRetry,
    /// Never retry
    None,
}

/// Metadata for one enumerated HID interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    /// USB interface number, -1 when the transport has none (Bluetooth)
    pub interface_number: i32,
    /// Opaque platform path used to open the interface
    pub path: CString,
    pub usage_page: u16,
    pub product: Option<String>,
    pub serial: Option<String>,
}

impl DeviceDescriptor {
    pub fn new(vendor_id: u16, product_id: u16, interface_number: i32, path: CString) -> Self {
        Self {
            vendor_id,
            product_id,
            interface_number,
            path,
            usage_page: 0,
            product: None,
            serial: None,
        }
    }

    /// Lossy, printable form of the path
    pub fn display_path(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }
}

impl From<&DeviceInfo> for DeviceDescriptor {
    fn from(info: &DeviceInfo) -> Self {
        Self {
            vendor_id: info.vendor_id(),
            product_id: info.product_id(),
            interface_number: info.interface_number(),
            path: info.path().to_owned(),
            usage_page: info.usage_page(),
            product: info.product_string().map(str::to_string),
            serial: info.serial_number().map(str::to_string),
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VID:0x{:04X} PID:0x{:04X} interface {} usage_page=0x{:04X} - {}",
            self.vendor_id,
            self.product_id,
            self.interface_number,
            self.usage_page,
            self.product.as_deref().unwrap_or("Unknown")
        )
    }
}

/// An open HID interface
pub trait HidHandle: Send {
    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), BackendError>;

    /// Write one output report, returning the number of bytes written
    fn write(&mut self, data: &[u8]) -> Result<usize, BackendError>;

    fn product_string(&self) -> Option<String> {
        None
    }

    /// Release the interface
    fn close(self: Box<Self>);
}

/// Enumeration and open capability of the host platform
pub trait HidBackend {
    /// Every HID interface currently visible, freshly enumerated
    fn devices(&mut self) -> Result<Vec<DeviceDescriptor>, BackendError>;

    /// Interfaces matching the given ids, in enumeration order
    fn enumerate(
        &mut self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Vec<DeviceDescriptor>, BackendError> {
        Ok(self
            .devices()?
            .into_iter()
            .filter(|d| d.matches(vendor_id, product_id))
            .collect())
    }

    fn open(&mut self, descriptor: &DeviceDescriptor) -> Result<Box<dyn HidHandle>, BackendError>;

    /// Write workaround to apply on this platform
    fn write_quirk(&self) -> WriteQuirk {
        WriteQuirk::LeadingZeroRetry
    }
}

/// Backend over the system `hidapi` library
pub struct HidapiBackend {
    api: HidApi,
    quirk: WriteQuirk,
}

impl HidapiBackend {
    pub fn new() -> Result<Self, BackendError> {
        Ok(Self {
            api: HidApi::new()?,
            quirk: WriteQuirk::default(),
        })
    }

    pub fn with_quirk(mut self, quirk: WriteQuirk) -> Self {
        self.quirk = quirk;
        self
    }
}

impl HidBackend for HidapiBackend {
    fn devices(&mut self) -> Result<Vec<DeviceDescriptor>, BackendError> {
        self.api.refresh_devices()?;
        let devices: Vec<DeviceDescriptor> =
            self.api.device_list().map(DeviceDescriptor::from).collect();
        debug!("Enumerated {} HID interfaces", devices.len());
        Ok(devices)
    }

    fn open(&mut self, descriptor: &DeviceDescriptor) -> Result<Box<dyn HidHandle>, BackendError> {
        let device = self.api.open_path(&descriptor.path)?;
        Ok(Box::new(HidapiHandle { device }))
    }

    fn write_quirk(&self) -> WriteQuirk {
        self.quirk
    }
}

struct HidapiHandle {
    device: HidDevice,
}

impl HidHandle for HidapiHandle {
    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), BackendError> {
        self.device.set_blocking_mode(!nonblocking)?;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, BackendError> {
        trace!("hid write {} bytes", data.len());
        Ok(self.device.write(data)?)
    }

    fn product_string(&self) -> Option<String> {
        self.device.get_product_string().ok().flatten()
    }

    fn close(self: Box<Self>) {
        // HidDevice closes on drop
        drop(self);
    }
}

/// In-memory backend recording everything written to it
pub mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct MockState {
        writes: Vec<Vec<u8>>,
        failing_writes: usize,
        fail_all_writes: bool,
        opened: Vec<CString>,
        closes: usize,
        enumerations: usize,
    }

    /// Shared view into a [`MockBackend`], kept by tests after the backend
    /// has been moved into a session
    #[derive(Debug, Clone, Default)]
    pub struct MockProbe(Arc<Mutex<MockState>>);

    impl MockProbe {
        fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
            let mut state = self.0.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut state)
        }

        /// Every successful write, in order
        pub fn writes(&self) -> Vec<Vec<u8>> {
            self.with(|s| s.writes.clone())
        }

        pub fn write_count(&self) -> usize {
            self.with(|s| s.writes.len())
        }

        pub fn last_write(&self) -> Option<Vec<u8>> {
            self.with(|s| s.writes.last().cloned())
        }

        /// Fail the next `n` write attempts
        pub fn fail_next_writes(&self, n: usize) {
            self.with(|s| s.failing_writes = n);
        }

        pub fn fail_all_writes(&self, fail: bool) {
            self.with(|s| s.fail_all_writes = fail);
        }

        pub fn opened_paths(&self) -> Vec<CString> {
            self.with(|s| s.opened.clone())
        }

        pub fn closes(&self) -> usize {
            self.with(|s| s.closes)
        }

        /// Handles opened and not yet closed
        pub fn open_handles(&self) -> usize {
            self.with(|s| s.opened.len() - s.closes)
        }

        pub fn enumerations(&self) -> usize {
            self.with(|s| s.enumerations)
        }
    }

    /// Descriptor with a synthetic path
    pub fn descriptor(
        vendor_id: u16,
        product_id: u16,
        interface_number: i32,
        path: &str,
    ) -> DeviceDescriptor {
        let path = CString::new(path).unwrap_or_default();
        DeviceDescriptor::new(vendor_id, product_id, interface_number, path)
    }

    #[derive(Debug, Default)]
    pub struct MockBackend {
        descriptors: Vec<DeviceDescriptor>,
        probe: MockProbe,
        quirk: WriteQuirk,
        fail_open: bool,
        fail_nonblocking: bool,
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_descriptor(mut self, descriptor: DeviceDescriptor) -> Self {
            self.descriptors.push(descriptor);
            self
        }

        pub fn with_quirk(mut self, quirk: WriteQuirk) -> Self {
            self.quirk = quirk;
            self
        }

        /// Every open fails, like a device node without read/write access
        pub fn failing_open(mut self) -> Self {
            self.fail_open = true;
            self
        }

        pub fn failing_nonblocking(mut self) -> Self {
            self.fail_nonblocking = true;
            self
        }

        pub fn probe(&self) -> MockProbe {
            self.probe.clone()
        }
    }

    impl HidBackend for MockBackend {
        fn devices(&mut self) -> Result<Vec<DeviceDescriptor>, BackendError> {
            self.probe.with(|s| s.enumerations += 1);
            Ok(self.descriptors.clone())
        }

        fn open(
            &mut self,
            descriptor: &DeviceDescriptor,
        ) -> Result<Box<dyn HidHandle>, BackendError> {
            if self.fail_open {
                return Err(BackendError::Other("Permission denied".to_string()));
            }
            self.probe
                .with(|s| s.opened.push(descriptor.path.clone()));
            Ok(Box::new(MockHandle {
                probe: self.probe.clone(),
                fail_nonblocking: self.fail_nonblocking,
            }))
        }

        fn write_quirk(&self) -> WriteQuirk {
            self.quirk
        }
    }

    pub struct MockHandle {
        probe: MockProbe,
        fail_nonblocking: bool,
    }

    impl HidHandle for MockHandle {
        fn set_nonblocking(&mut self, _nonblocking: bool) -> Result<(), BackendError> {
            if self.fail_nonblocking {
                return Err(BackendError::Other("ioctl failed".to_string()));
            }
            Ok(())
        }

        fn write(&mut self, data: &[u8]) -> Result<usize, BackendError> {
            self.probe.with(|s| {
                if s.fail_all_writes {
                    return Err(BackendError::Other("Mock write failure".to_string()));
                }
                if s.failing_writes > 0 {
                    s.failing_writes -= 1;
                    return Err(BackendError::Other("Mock write failure".to_string()));
                }
                s.writes.push(data.to_vec());
                Ok(data.len())
            })
        }

        fn product_string(&self) -> Option<String> {
            Some("Mock Controller".to_string())
        }

        fn close(self: Box<Self>) {
            self.probe.with(|s| s.closes += 1);
        }
    }
}
