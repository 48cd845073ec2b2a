//! Vibration driver for Turtle Beach Xbox controllers over USB HID.
//!
//! ```no_run
//! use std::time::Duration;
//! use turtle_rumble::backend::HidapiBackend;
//! use turtle_rumble::effects::{EffectComposer, Motor, SleepPacer};
//! use turtle_rumble::session::{ControllerSession, TURTLE_BEACH_PRODUCT_ID, TURTLE_BEACH_VENDOR_ID};
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut session = ControllerSession::new(HidapiBackend::new()?);
//! session.connect(TURTLE_BEACH_VENDOR_ID, TURTLE_BEACH_PRODUCT_ID)?;
//!
//! let mut composer = EffectComposer::new(SleepPacer::default());
//! composer.hold_for(&mut session, 50, 50, Duration::from_secs(1))?;
//! composer.pulse_train(&mut session, 80, Duration::from_millis(150), 3, Motor::Both)?;
//!
//! session.disconnect();
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod effects;
pub mod protocol;
pub mod session;
