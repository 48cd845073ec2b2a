//! Timed vibration effects
//!
//! Holds, pulse trains and the demo sequence, built only on the public
//! session operations. Every wait goes through a [`Pacer`] so that a Ctrl-C
//! can cut it short; when that happens the motors are stopped before the
//! interruption is reported.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::HidBackend;
use crate::session::{ControllerSession, VibrationError};

/// Granularity at which a pause checks for cancellation
const PAUSE_SLICE: Duration = Duration::from_millis(10);

/// Source of the waits between commands
pub trait Pacer {
    /// Wait for `duration`, or fail with [`VibrationError::Interrupted`]
    fn pause(&mut self, duration: Duration) -> Result<(), VibrationError>;
}

/// Sleeps on the calling thread, giving up as soon as the running flag is
/// cleared
#[derive(Debug, Clone)]
pub struct SleepPacer {
    running: Arc<AtomicBool>,
}

impl SleepPacer {
    pub fn new(running: Arc<AtomicBool>) -> Self {
        Self { running }
    }
}

impl Default for SleepPacer {
    fn default() -> Self {
        Self::new(Arc::new(AtomicBool::new(true)))
    }
}

impl Pacer for SleepPacer {
    fn pause(&mut self, duration: Duration) -> Result<(), VibrationError> {
        // None when the deadline is past what Instant can represent; such a
        // pause only ends on cancellation
        let deadline = Instant::now().checked_add(duration);
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return Err(VibrationError::Interrupted);
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(());
                    }
                    (deadline - now).min(PAUSE_SLICE)
                }
                None => PAUSE_SLICE,
            };
            thread::sleep(slice);
        }
    }
}

/// Which motor a pulse drives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Motor {
    Left,
    Right,
    #[default]
    Both,
}

impl Motor {
    /// (left, right) levels for the given intensity
    pub fn levels(self, intensity: i32) -> (i32, i32) {
        match self {
            Motor::Left => (intensity, 0),
            Motor::Right => (0, intensity),
            Motor::Both => (intensity, intensity),
        }
    }
}

impl FromStr for Motor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "left" | "l" => Ok(Motor::Left),
            "right" | "r" => Ok(Motor::Right),
            "both" | "b" => Ok(Motor::Both),
            other => Err(format!("unknown motor '{}', expected left, right or both", other)),
        }
    }
}

impl fmt::Display for Motor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Motor::Left => "left",
            Motor::Right => "right",
            Motor::Both => "both",
        })
    }
}

/// Intensities for all four motors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotorLevels {
    pub left: i32,
    pub right: i32,
    pub left_trigger: i32,
    pub right_trigger: i32,
}

impl MotorLevels {
    pub const fn new(left: i32, right: i32, left_trigger: i32, right_trigger: i32) -> Self {
        Self {
            left,
            right,
            left_trigger,
            right_trigger,
        }
    }
}

/// One step of the demo sequence
#[derive(Debug, Clone, Copy)]
pub struct DemoStep {
    pub name: &'static str,
    pub levels: MotorLevels,
}

/// Steps run by [`EffectComposer::run_demo`], one motor group at a time.
pub const DEMO_STEPS: [DemoStep; 6] = [
    DemoStep { name: "Left motor (strong)", levels: MotorLevels::new(80, 0, 0, 0) },
    DemoStep { name: "Right motor (weak)", levels: MotorLevels::new(0, 80, 0, 0) },
    DemoStep { name: "Both motors", levels: MotorLevels::new(60, 60, 0, 0) },
    DemoStep { name: "Left trigger", levels: MotorLevels::new(0, 0, 80, 0) },
    DemoStep { name: "Right trigger", levels: MotorLevels::new(0, 0, 0, 80) },
    DemoStep { name: "Everything", levels: MotorLevels::new(50, 50, 50, 50) },
];

pub const DEMO_HOLD: Duration = Duration::from_millis(700);
pub const DEMO_GAP: Duration = Duration::from_millis(300);
pub const DEMO_PULSE_INTENSITY: i32 = 80;
pub const DEMO_PULSE_DURATION: Duration = Duration::from_millis(150);
pub const DEMO_PULSE_COUNT: u32 = 3;

/// Sequences session calls into timed effects
pub struct EffectComposer<P: Pacer> {
    pacer: P,
}

impl<P: Pacer> EffectComposer<P> {
    pub fn new(pacer: P) -> Self {
        Self { pacer }
    }

    pub fn pacer(&self) -> &P {
        &self.pacer
    }

    /// Vibrate the two main motors for `duration`, then stop.
    ///
    /// Returns whether the initial vibrate command went out.
    pub fn hold_for<B: HidBackend>(
        &mut self,
        session: &mut ControllerSession<B>,
        left: i32,
        right: i32,
        duration: Duration,
    ) -> Result<bool, VibrationError> {
        self.hold(session, MotorLevels::new(left, right, 0, 0), duration)
    }

    /// Like [`hold_for`](Self::hold_for) with trigger motors as well
    pub fn hold<B: HidBackend>(
        &mut self,
        session: &mut ControllerSession<B>,
        levels: MotorLevels,
        duration: Duration,
    ) -> Result<bool, VibrationError> {
        let sent = session.vibrate(
            levels.left,
            levels.right,
            levels.left_trigger,
            levels.right_trigger,
        );
        self.wait(session, duration)?;
        session.stop();
        Ok(sent)
    }

    /// Pulse `count` times, each pulse lasting `duration` and followed by a
    /// gap of the same length, except after the last one.
    ///
    /// Returns true if every pulse was sent.
    pub fn pulse_train<B: HidBackend>(
        &mut self,
        session: &mut ControllerSession<B>,
        intensity: i32,
        duration: Duration,
        count: u32,
        motor: Motor,
    ) -> Result<bool, VibrationError> {
        let (left, right) = motor.levels(intensity);
        let mut all_sent = true;

        for i in 0..count {
            debug!("Pulse {}/{} on {} motor(s)", i + 1, count, motor);
            all_sent &= session.vibrate(left, right, 0, 0);
            self.wait(session, duration)?;
            session.stop();

            if i + 1 < count {
                self.wait(session, duration)?;
            }
        }

        Ok(all_sent)
    }

    /// Walk through every motor, then pulse. `on_step` is told about each
    /// step before it starts.
    pub fn run_demo<B: HidBackend>(
        &mut self,
        session: &mut ControllerSession<B>,
        mut on_step: impl FnMut(&str, &MotorLevels),
    ) -> Result<bool, VibrationError> {
        let mut all_sent = true;

        for step in &DEMO_STEPS {
            on_step(step.name, &step.levels);
            all_sent &= self.hold(session, step.levels, DEMO_HOLD)?;
            self.wait(session, DEMO_GAP)?;
        }

        let pulse = MotorLevels::new(DEMO_PULSE_INTENSITY, DEMO_PULSE_INTENSITY, 0, 0);
        on_step("Pulse x3", &pulse);
        all_sent &= self.pulse_train(
            session,
            DEMO_PULSE_INTENSITY,
            DEMO_PULSE_DURATION,
            DEMO_PULSE_COUNT,
            Motor::Both,
        )?;

        Ok(all_sent)
    }

    fn wait<B: HidBackend>(
        &mut self,
        session: &mut ControllerSession<B>,
        duration: Duration,
    ) -> Result<(), VibrationError> {
        if let Err(e) = self.pacer.pause(duration) {
            warn!("Effect interrupted, stopping motors");
            session.stop();
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{descriptor, MockBackend, MockProbe};
    use crate::session::{TURTLE_BEACH_PRODUCT_ID, TURTLE_BEACH_VENDOR_ID};

    /// Records each pause together with how many writes preceded it
    struct RecordingPacer {
        probe: MockProbe,
        pauses: Vec<(usize, Duration)>,
        interrupt_at: Option<usize>,
    }

    impl RecordingPacer {
        fn new(probe: MockProbe) -> Self {
            Self {
                probe,
                pauses: Vec::new(),
                interrupt_at: None,
            }
        }
    }

    impl Pacer for RecordingPacer {
        fn pause(&mut self, duration: Duration) -> Result<(), VibrationError> {
            if self.interrupt_at == Some(self.pauses.len()) {
                return Err(VibrationError::Interrupted);
            }
            self.pauses.push((self.probe.write_count(), duration));
            Ok(())
        }
    }

    fn setup() -> (
        ControllerSession<MockBackend>,
        EffectComposer<RecordingPacer>,
        MockProbe,
    ) {
        let backend = MockBackend::new().with_descriptor(descriptor(
            TURTLE_BEACH_VENDOR_ID,
            TURTLE_BEACH_PRODUCT_ID,
            0,
            "hidraw0",
        ));
        let probe = backend.probe();
        let mut session = ControllerSession::new(backend);
        session
            .connect(TURTLE_BEACH_VENDOR_ID, TURTLE_BEACH_PRODUCT_ID)
            .unwrap();
        let composer = EffectComposer::new(RecordingPacer::new(probe.clone()));
        (session, composer, probe)
    }

    #[test]
    fn test_pulse_train_schedule() {
        let (mut session, mut composer, probe) = setup();
        let ms150 = Duration::from_millis(150);

        let sent = composer
            .pulse_train(&mut session, 80, ms150, 3, Motor::Both)
            .unwrap();
        assert!(sent);

        let writes = probe.writes();
        assert_eq!(writes.len(), 6);
        for pair in writes.chunks(2) {
            assert_eq!(&pair[0][6..10], &[0, 0, 80, 80]);
            assert_eq!(&pair[1][6..10], &[0, 0, 0, 0]);
        }

        // Hold after each vibrate, gap after stops 1 and 2 only
        assert_eq!(
            composer.pacer().pauses,
            vec![(1, ms150), (2, ms150), (3, ms150), (4, ms150), (5, ms150)]
        );
    }

    #[test]
    fn test_pulse_train_zero_count() {
        let (mut session, mut composer, probe) = setup();
        let sent = composer
            .pulse_train(&mut session, 80, Duration::from_millis(100), 0, Motor::Both)
            .unwrap();
        assert!(sent);
        assert_eq!(probe.write_count(), 0);
        assert!(composer.pacer().pauses.is_empty());
    }

    #[test]
    fn test_pulse_train_routes_motor() {
        let (mut session, mut composer, probe) = setup();
        composer
            .pulse_train(&mut session, 70, Duration::ZERO, 1, Motor::Left)
            .unwrap();
        composer
            .pulse_train(&mut session, 70, Duration::ZERO, 1, Motor::Right)
            .unwrap();

        let writes = probe.writes();
        assert_eq!(&writes[0][8..10], &[70, 0]);
        assert_eq!(&writes[2][8..10], &[0, 70]);
    }

    #[test]
    fn test_hold_for() {
        let (mut session, mut composer, probe) = setup();
        let sent = composer
            .hold_for(&mut session, 50, 25, Duration::from_secs(2))
            .unwrap();
        assert!(sent);

        let writes = probe.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(&writes[0][6..10], &[0, 0, 50, 25]);
        assert!(writes[1][6..10].iter().all(|&b| b == 0));
        assert_eq!(composer.pacer().pauses, vec![(1, Duration::from_secs(2))]);
    }

    #[test]
    fn test_hold_for_reports_vibrate_failure() {
        let (mut session, mut composer, probe) = setup();
        probe.fail_next_writes(2);

        let sent = composer
            .hold_for(&mut session, 50, 50, Duration::from_millis(10))
            .unwrap();
        assert!(!sent);
        // The stop still went out
        assert_eq!(probe.write_count(), 1);
    }

    #[test]
    fn test_hold_for_disconnected() {
        let mut session = ControllerSession::new(MockBackend::new());
        let probe = MockProbe::default();
        let mut composer = EffectComposer::new(RecordingPacer::new(probe));
        let sent = composer
            .hold_for(&mut session, 50, 50, Duration::from_millis(10))
            .unwrap();
        assert!(!sent);
    }

    #[test]
    fn test_interrupt_stops_motors() {
        let (mut session, mut composer, probe) = setup();
        composer.pacer.interrupt_at = Some(1);

        let result = composer.pulse_train(&mut session, 90, Duration::from_millis(200), 5, Motor::Both);
        assert!(matches!(result, Err(VibrationError::Interrupted)));

        // vibrate, stop, then the stop issued by the interruption
        let writes = probe.writes();
        assert_eq!(writes.len(), 3);
        assert_eq!(&writes[2][6..10], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_demo_sequence() {
        let (mut session, mut composer, probe) = setup();
        let mut steps = Vec::new();

        let sent = composer
            .run_demo(&mut session, |name, _| steps.push(name.to_string()))
            .unwrap();
        assert!(sent);
        assert_eq!(steps.len(), 7);
        assert_eq!(steps[0], "Left motor (strong)");

        // Six holds and three pulses, each a vibrate/stop pair
        let writes = probe.writes();
        assert_eq!(writes.len(), 18);
        assert_eq!(&writes[6][6..10], &[80, 0, 0, 0]);
        assert_eq!(&writes[10][6..10], &[50, 50, 50, 50]);
    }

    #[test]
    fn test_sleep_pacer_cancelled() {
        let running = Arc::new(AtomicBool::new(false));
        let mut pacer = SleepPacer::new(running);
        assert!(matches!(
            pacer.pause(Duration::from_secs(10)),
            Err(VibrationError::Interrupted)
        ));
    }

    #[test]
    fn test_sleep_pacer_waits() {
        let mut pacer = SleepPacer::default();
        let start = Instant::now();
        pacer.pause(Duration::from_millis(15)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_sleep_pacer_unbounded_duration() {
        let mut pacer = SleepPacer::new(Arc::new(AtomicBool::new(false)));
        assert!(matches!(
            pacer.pause(Duration::MAX),
            Err(VibrationError::Interrupted)
        ));
    }

    #[test]
    fn test_sleep_pacer_cancelled_mid_pause() {
        let running = Arc::new(AtomicBool::new(true));
        let mut pacer = SleepPacer::new(running.clone());

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            running.store(false, Ordering::SeqCst);
        });

        let start = Instant::now();
        let result = pacer.pause(Duration::from_secs(10));
        canceller.join().unwrap();

        assert!(matches!(result, Err(VibrationError::Interrupted)));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_sleep_pacer_unbounded_cancelled_mid_pause() {
        let running = Arc::new(AtomicBool::new(true));
        let mut pacer = SleepPacer::new(running.clone());

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            running.store(false, Ordering::SeqCst);
        });

        let result = pacer.pause(Duration::MAX);
        canceller.join().unwrap();
        assert!(matches!(result, Err(VibrationError::Interrupted)));
    }

    #[test]
    fn test_motor_from_str() {
        assert_eq!("left".parse::<Motor>().unwrap(), Motor::Left);
        assert_eq!("RIGHT".parse::<Motor>().unwrap(), Motor::Right);
        assert_eq!("both".parse::<Motor>().unwrap(), Motor::Both);
        assert!("middle".parse::<Motor>().is_err());
        assert_eq!(Motor::Right.levels(40), (0, 40));
    }
}
