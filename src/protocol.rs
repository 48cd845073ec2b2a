//! Vibration command encoding
//!
//! The controller accepts a single 13-byte HID output report for all force
//! feedback effects:
//!
//! ```text
//! 09 00 [SEQ] 09 00 0F [LT] [RT] [LEFT] [RIGHT] FF 00 EB
//! ```
//!
//! - `SEQ`: sequence number (0x00-0xFF), one per constructed command
//! - `LT` / `RT`: left / right trigger motors (0-100)
//! - `LEFT`: large low-frequency motor (0-100)
//! - `RIGHT`: small high-frequency motor (0-100)

use std::fmt;

/// Output report ID
pub const REPORT_ID: u8 = 0x09;
/// Motor enable mask, all four motors active
pub const MOTOR_MASK: u8 = 0x0F;
/// Trailing bytes of every command
pub const PACKET_SUFFIX: [u8; 3] = [0xFF, 0x00, 0xEB];
/// Highest intensity the firmware accepts
pub const MAX_INTENSITY: u8 = 100;
/// Command length in bytes
pub const COMMAND_LEN: usize = 13;

/// Byte offsets inside a command
pub mod offset {
    pub const SEQUENCE: usize = 2;
    pub const MASK: usize = 5;
    pub const LEFT_TRIGGER: usize = 6;
    pub const RIGHT_TRIGGER: usize = 7;
    pub const LEFT_MOTOR: usize = 8;
    pub const RIGHT_MOTOR: usize = 9;
}

/// Motor intensity, always within 0-100
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Intensity(u8);

impl Intensity {
    pub const OFF: Self = Self(0);
    pub const MAX: Self = Self(MAX_INTENSITY);

    /// Clamp any integer into the accepted range
    pub fn clamped(value: i32) -> Self {
        Self(value.clamp(Self::OFF.0 as i32, Self::MAX.0 as i32) as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

/// A fully encoded vibration command, ready to be written to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VibrationCommand([u8; COMMAND_LEN]);

impl VibrationCommand {
    /// Raw report bytes
    pub fn as_bytes(&self) -> &[u8; COMMAND_LEN] {
        &self.0
    }

    pub fn sequence(&self) -> u8 {
        self.0[offset::SEQUENCE]
    }

    pub fn left_trigger(&self) -> u8 {
        self.0[offset::LEFT_TRIGGER]
    }

    pub fn right_trigger(&self) -> u8 {
        self.0[offset::RIGHT_TRIGGER]
    }

    pub fn left_motor(&self) -> u8 {
        self.0[offset::LEFT_MOTOR]
    }

    pub fn right_motor(&self) -> u8 {
        self.0[offset::RIGHT_MOTOR]
    }

    /// True when every motor is at zero
    pub fn is_stop(&self) -> bool {
        self.0[offset::LEFT_TRIGGER..=offset::RIGHT_MOTOR]
            .iter()
            .all(|&b| b == 0)
    }
}

impl AsRef<[u8]> for VibrationCommand {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for VibrationCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// Build a vibration command.
///
/// Intensities are clamped to 0-100. The sequence number is placed verbatim;
/// advancing it is up to the caller.
pub fn encode(
    seq: u8,
    left_trigger: i32,
    right_trigger: i32,
    left: i32,
    right: i32,
) -> VibrationCommand {
    VibrationCommand([
        REPORT_ID,
        0x00,
        seq,
        0x09,
        0x00,
        MOTOR_MASK,
        Intensity::clamped(left_trigger).value(),
        Intensity::clamped(right_trigger).value(),
        Intensity::clamped(left).value(),
        Intensity::clamped(right).value(),
        PACKET_SUFFIX[0],
        PACKET_SUFFIX[1],
        PACKET_SUFFIX[2],
    ])
}
