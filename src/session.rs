//! Controller session
//!
//! Owns the open HID handle and the command sequence counter. A session is
//! either disconnected or holds exactly one open interface; the handle and
//! the counter are created together on connect and dropped together on
//! disconnect.

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::backend::{BackendError, DeviceDescriptor, HidBackend, HidHandle, WriteQuirk};
use crate::protocol::{self, Intensity, VibrationCommand, COMMAND_LEN};

/// Turtle Beach vendor ID
pub const TURTLE_BEACH_VENDOR_ID: u16 = 0x10F5;
/// Turtle Beach Xbox controller product ID
pub const TURTLE_BEACH_PRODUCT_ID: u16 = 0x7018;
/// Microsoft vendor ID, used by Xbox-compatible pads
pub const MICROSOFT_VENDOR_ID: u16 = 0x045E;

/// Interface number preferred for commands
pub const COMMAND_INTERFACE: i32 = 0;

#[derive(Error, Debug)]
pub enum VibrationError {
    #[error("No controller found (VID:0x{vendor_id:04X} PID:0x{product_id:04X})")]
    NotFound { vendor_id: u16, product_id: u16 },

    #[error("Failed to open {path}: {source}\n{hint}")]
    Open {
        path: String,
        #[source]
        source: BackendError,
        hint: String,
    },

    #[error("Write failed: {primary}{}", retry_note(.retry))]
    WriteFailure {
        primary: BackendError,
        retry: Option<BackendError>,
    },

    #[error("Controller not connected")]
    NotConnected,

    #[error("HID enumeration failed: {0}")]
    Enumerate(#[source] BackendError),

    #[error("Interrupted")]
    Interrupted,
}

fn retry_note(retry: &Option<BackendError>) -> String {
    match retry {
        Some(e) => format!(" (padded retry: {})", e),
        None => String::new(),
    }
}

/// Remediation shown when a device node cannot be opened
pub fn permission_hint(vendor_id: u16, product_id: u16) -> String {
    format!(
        "The device node needs read/write permission for your user. On Linux add a udev rule such as\n  \
         SUBSYSTEM==\"hidraw\", ATTRS{{idVendor}}==\"{:04x}\", ATTRS{{idProduct}}==\"{:04x}\", MODE=\"0666\"\n\
         to /etc/udev/rules.d/, run `sudo udevadm control --reload-rules && sudo udevadm trigger`, \
         then unplug and replug the controller.",
        vendor_id, product_id
    )
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    /// Only observable while `connect` runs
    Connecting,
    Connected,
}

/// Pick the interface to send commands to.
///
/// Interface 0 carries commands on the controllers seen so far, so it is
/// preferred; when several descriptors report interface 0 the last one
/// enumerated wins. Without an interface 0 the first descriptor is used.
/// This is a heuristic, not something the protocol guarantees.
pub fn select_interface(candidates: &[DeviceDescriptor]) -> Option<&DeviceDescriptor> {
    candidates
        .iter()
        .rev()
        .find(|d| d.interface_number == COMMAND_INTERFACE)
        .or_else(|| candidates.first())
}

struct Connection {
    handle: Box<dyn HidHandle>,
    descriptor: DeviceDescriptor,
    sequence: u8,
}

/// Vibration session with one controller
pub struct ControllerSession<B: HidBackend> {
    backend: B,
    state: SessionState,
    connection: Option<Connection>,
}

impl<B: HidBackend> ControllerSession<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: SessionState::Disconnected,
            connection: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Sequence number the next command will carry
    pub fn sequence(&self) -> Option<u8> {
        self.connection.as_ref().map(|c| c.sequence)
    }

    /// Interface the session is talking to
    pub fn descriptor(&self) -> Option<&DeviceDescriptor> {
        self.connection.as_ref().map(|c| &c.descriptor)
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Find and open the controller with the given ids.
    ///
    /// An existing connection is closed first, so reconnecting always starts
    /// again at sequence 0.
    pub fn connect(&mut self, vendor_id: u16, product_id: u16) -> Result<(), VibrationError> {
        if self.is_connected() {
            debug!("Reconnecting, closing current interface first");
            self.disconnect();
        }

        self.state = SessionState::Connecting;
        match self.open_connection(vendor_id, product_id) {
            Ok(connection) => {
                self.connection = Some(connection);
                self.state = SessionState::Connected;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    fn open_connection(
        &mut self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Connection, VibrationError> {
        let candidates = self
            .backend
            .enumerate(vendor_id, product_id)
            .map_err(VibrationError::Enumerate)?;

        for d in &candidates {
            info!(
                "Interface {}: usage_page=0x{:04X}",
                d.interface_number, d.usage_page
            );
        }

        let target = select_interface(&candidates)
            .cloned()
            .ok_or(VibrationError::NotFound {
                vendor_id,
                product_id,
            })?;

        let open_error = |source: BackendError| VibrationError::Open {
            path: target.display_path(),
            source,
            hint: permission_hint(vendor_id, product_id),
        };

        let mut handle = self.backend.open(&target).map_err(open_error)?;
        if let Err(e) = handle.set_nonblocking(true) {
            handle.close();
            return Err(open_error(e));
        }

        let product = handle
            .product_string()
            .or_else(|| target.product.clone())
            .unwrap_or_else(|| "controller".to_string());
        info!(
            "Connected: {} (interface {}, {})",
            product,
            target.interface_number,
            target.display_path()
        );

        Ok(Connection {
            handle,
            descriptor: target,
            sequence: 0,
        })
    }

    /// Write a command to the open interface.
    ///
    /// Returns `Ok(false)` when the write and its retry both failed; only a
    /// missing connection is an error.
    pub fn send(&mut self, command: VibrationCommand) -> Result<bool, VibrationError> {
        let quirk = self.backend.write_quirk();
        let connection = self
            .connection
            .as_mut()
            .ok_or(VibrationError::NotConnected)?;

        trace!("-> {}", command);
        match write_command(connection.handle.as_mut(), &command, quirk) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("{}", e);
                Ok(false)
            }
        }
    }

    /// Drive the motors. Intensities are clamped to 0-100.
    pub fn vibrate(&mut self, left: i32, right: i32, left_trigger: i32, right_trigger: i32) -> bool {
        let Some(connection) = self.connection.as_mut() else {
            warn!("{}", VibrationError::NotConnected);
            return false;
        };

        let command =
            protocol::encode(connection.sequence, left_trigger, right_trigger, left, right);
        connection.sequence = connection.sequence.wrapping_add(1);

        self.send(command).unwrap_or(false)
    }

    /// Stop every motor
    pub fn stop(&mut self) -> bool {
        let off = Intensity::OFF.value() as i32;
        self.vibrate(off, off, off, off)
    }

    /// Stop the motors and release the interface. Does nothing when already
    /// disconnected.
    pub fn disconnect(&mut self) {
        if !self.is_connected() {
            return;
        }

        if !self.stop() {
            warn!("Could not stop motors before disconnecting");
        }

        if let Some(connection) = self.connection.take() {
            connection.handle.close();
            info!("Disconnected");
        }
        self.state = SessionState::Disconnected;
    }
}

impl<B: HidBackend> Drop for ControllerSession<B> {
    fn drop(&mut self) {
        // Never leave the motors running
        self.disconnect();
    }
}

fn write_command(
    handle: &mut dyn HidHandle,
    command: &VibrationCommand,
    quirk: WriteQuirk,
) -> Result<(), VibrationError> {
    let primary = match handle.write(command.as_bytes()) {
        Ok(_) => return Ok(()),
        Err(e) => e,
    };

    if quirk == WriteQuirk::None {
        return Err(VibrationError::WriteFailure {
            primary,
            retry: None,
        });
    }

    debug!("Write failed ({}), retrying with leading zero byte", primary);
    let mut padded = [0u8; COMMAND_LEN + 1];
    padded[1..].copy_from_slice(command.as_bytes());

    handle
        .write(&padded)
        .map(|_| ())
        .map_err(|retry| VibrationError::WriteFailure {
            primary,
            retry: Some(retry),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{descriptor, MockBackend, MockProbe};

    const VID: u16 = TURTLE_BEACH_VENDOR_ID;
    const PID: u16 = TURTLE_BEACH_PRODUCT_ID;

    fn connected() -> (ControllerSession<MockBackend>, MockProbe) {
        let backend = MockBackend::new().with_descriptor(descriptor(VID, PID, 0, "hidraw0"));
        let probe = backend.probe();
        let mut session = ControllerSession::new(backend);
        session.connect(VID, PID).unwrap();
        (session, probe)
    }

    #[test]
    fn test_connect_prefers_interface_zero() {
        let backend = MockBackend::new()
            .with_descriptor(descriptor(VID, PID, 1, "if1"))
            .with_descriptor(descriptor(VID, PID, 0, "if0"));
        let probe = backend.probe();
        let mut session = ControllerSession::new(backend);

        session.connect(VID, PID).unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.descriptor().unwrap().interface_number, 0);
        assert_eq!(probe.opened_paths().len(), 1);
        assert_eq!(probe.opened_paths()[0].to_str().unwrap(), "if0");
    }

    #[test]
    fn test_select_interface_fallback() {
        let candidates = vec![descriptor(VID, PID, 2, "a"), descriptor(VID, PID, 1, "b")];
        assert_eq!(select_interface(&candidates).unwrap().display_path(), "a");

        let candidates = vec![
            descriptor(VID, PID, 0, "first"),
            descriptor(VID, PID, 3, "other"),
            descriptor(VID, PID, 0, "second"),
        ];
        assert_eq!(select_interface(&candidates).unwrap().display_path(), "second");

        assert!(select_interface(&[]).is_none());
    }

    #[test]
    fn test_connect_not_found() {
        let backend = MockBackend::new().with_descriptor(descriptor(0x045E, 0x028E, 0, "xbox"));
        let probe = backend.probe();
        let mut session = ControllerSession::new(backend);

        let err = session.connect(VID, PID).unwrap_err();
        assert!(matches!(
            err,
            VibrationError::NotFound {
                vendor_id: VID,
                product_id: PID
            }
        ));
        assert!(!session.is_connected());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(probe.open_handles(), 0);
        assert!(probe.opened_paths().is_empty());

        assert!(!session.vibrate(50, 50, 0, 0));
        assert_eq!(probe.write_count(), 0);
    }

    #[test]
    fn test_open_failure_carries_hint() {
        let backend = MockBackend::new()
            .with_descriptor(descriptor(VID, PID, 0, "/dev/hidraw4"))
            .failing_open();
        let mut session = ControllerSession::new(backend);

        let err = session.connect(VID, PID).unwrap_err();
        match &err {
            VibrationError::Open { path, hint, .. } => {
                assert_eq!(path, "/dev/hidraw4");
                assert!(hint.contains("read/write permission"));
                assert!(hint.contains("10f5"));
                assert!(hint.contains("7018"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.to_string().contains("udev"));
        assert!(!session.is_connected());
    }

    #[test]
    fn test_nonblocking_failure_releases_handle() {
        let backend = MockBackend::new()
            .with_descriptor(descriptor(VID, PID, 0, "hidraw0"))
            .failing_nonblocking();
        let probe = backend.probe();
        let mut session = ControllerSession::new(backend);

        assert!(matches!(
            session.connect(VID, PID),
            Err(VibrationError::Open { .. })
        ));
        assert_eq!(probe.closes(), 1);
        assert_eq!(probe.open_handles(), 0);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_sequence_counter_advances_and_wraps() {
        let (mut session, probe) = connected();
        assert_eq!(session.sequence(), Some(0));

        assert!(session.vibrate(10, 20, 0, 0));
        assert!(session.vibrate(10, 20, 0, 0));
        let writes = probe.writes();
        assert_eq!(writes[0][2], 0);
        assert_eq!(writes[1][2], 1);

        for _ in 2..257 {
            session.vibrate(1, 1, 1, 1);
        }
        let writes = probe.writes();
        assert_eq!(writes.len(), 257);
        assert_eq!(writes[255][2], 255);
        assert_eq!(writes[256][2], 0);
    }

    #[test]
    fn test_vibrate_argument_order() {
        let (mut session, probe) = connected();
        session.vibrate(80, 60, 40, 20);
        let bytes = probe.last_write().unwrap();
        assert_eq!(&bytes[6..10], &[40, 20, 80, 60]);
    }

    #[test]
    fn test_stop_is_zero_vibrate() {
        let (mut session, probe) = connected();
        assert!(session.stop());
        let bytes = probe.last_write().unwrap();
        assert_eq!(bytes.len(), 13);
        assert_eq!(bytes[5], 0x0F);
        assert_eq!(&bytes[6..10], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_disconnect_twice() {
        let (mut session, probe) = connected();

        session.disconnect();
        assert_eq!(probe.write_count(), 1);
        assert_eq!(probe.closes(), 1);
        assert_eq!(session.state(), SessionState::Disconnected);

        session.disconnect();
        assert_eq!(probe.write_count(), 1);
        assert_eq!(probe.closes(), 1);
    }

    #[test]
    fn test_disconnect_releases_even_if_stop_fails() {
        let (mut session, probe) = connected();
        probe.fail_all_writes(true);

        session.disconnect();
        assert!(!session.is_connected());
        assert_eq!(probe.closes(), 1);
    }

    #[test]
    fn test_drop_stops_motors() {
        let (mut session, probe) = connected();
        session.vibrate(100, 100, 0, 0);
        drop(session);

        let writes = probe.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(&writes[1][6..10], &[0, 0, 0, 0]);
        assert_eq!(probe.closes(), 1);
    }

    #[test]
    fn test_reconnect_resets_sequence() {
        let (mut session, probe) = connected();
        session.vibrate(10, 10, 0, 0);
        session.vibrate(10, 10, 0, 0);

        session.connect(VID, PID).unwrap();
        assert_eq!(probe.closes(), 1);
        assert_eq!(probe.enumerations(), 2);
        assert_eq!(session.sequence(), Some(0));

        session.vibrate(10, 10, 0, 0);
        assert_eq!(probe.last_write().unwrap()[2], 0);
    }

    #[test]
    fn test_padded_retry_on_write_failure() {
        let (mut session, probe) = connected();
        probe.fail_next_writes(1);

        assert!(session.vibrate(50, 50, 0, 0));
        let bytes = probe.last_write().unwrap();
        assert_eq!(bytes.len(), 14);
        assert_eq!(bytes[0], 0x00);
        assert_eq!(bytes[1], 0x09);
        assert_eq!(bytes[9], 50);
    }

    #[test]
    fn test_both_writes_fail() {
        let (mut session, probe) = connected();
        probe.fail_next_writes(2);

        assert!(!session.vibrate(50, 50, 0, 0));
        assert_eq!(probe.write_count(), 0);

        // The failed command still consumed sequence 0
        assert!(session.vibrate(50, 50, 0, 0));
        assert_eq!(probe.last_write().unwrap()[2], 1);
    }

    #[test]
    fn test_no_retry_without_quirk() {
        let backend = MockBackend::new()
            .with_descriptor(descriptor(VID, PID, 0, "hidraw0"))
            .with_quirk(WriteQuirk::None);
        let probe = backend.probe();
        let mut session = ControllerSession::new(backend);
        session.connect(VID, PID).unwrap();

        probe.fail_next_writes(1);
        assert!(!session.vibrate(50, 50, 0, 0));
        assert!(session.vibrate(50, 50, 0, 0));
        assert_eq!(probe.writes().len(), 1);
        assert_eq!(probe.last_write().unwrap().len(), 13);
    }

    #[test]
    fn test_send_requires_connection() {
        let mut session = ControllerSession::new(MockBackend::new());
        let cmd = protocol::encode(0, 0, 0, 0, 0);
        assert!(matches!(session.send(cmd), Err(VibrationError::NotConnected)));
        assert!(!session.stop());
        assert_eq!(session.sequence(), None);
    }

    #[test]
    fn test_write_failure_message() {
        let err = VibrationError::WriteFailure {
            primary: BackendError::Other("EPIPE".to_string()),
            retry: Some(BackendError::Other("EIO".to_string())),
        };
        assert_eq!(err.to_string(), "Write failed: EPIPE (padded retry: EIO)");
    }
}
