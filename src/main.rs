//! Turtle Beach vibration CLI
//!
//! Drives the rumble and trigger motors of a Turtle Beach Xbox controller
//! connected over USB.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use turtle_rumble::backend::{HidBackend, HidapiBackend};
use turtle_rumble::config::{self, parse_seconds, parse_usb_id, Config, CONFIG_FILE};
use turtle_rumble::effects::{EffectComposer, Motor, MotorLevels, SleepPacer};
use turtle_rumble::session::{ControllerSession, VibrationError};

/// Turtle Beach controller vibration tool
#[derive(Parser)]
#[command(name = "turtle-rumble")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file or directory
    #[arg(short, long, env = "TURTLE_RUMBLE_CONFIG")]
    config: Option<PathBuf>,

    /// Vendor ID (hex like 0x10F5, or decimal)
    #[arg(long, value_parser = parse_usb_id)]
    vendor_id: Option<u16>,

    /// Product ID (hex like 0x7018, or decimal)
    #[arg(long, value_parser = parse_usb_id)]
    product_id: Option<u16>,

    /// Verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Vibrate for a while, then stop
    Vibrate {
        /// Left motor, strong / low frequency (0-100)
        #[arg(short, long, default_value_t = 0)]
        left: i32,

        /// Right motor, weak / high frequency (0-100)
        #[arg(short, long, default_value_t = 0)]
        right: i32,

        /// Left trigger motor (0-100)
        #[arg(long, default_value_t = 0)]
        left_trigger: i32,

        /// Right trigger motor (0-100)
        #[arg(long, default_value_t = 0)]
        right_trigger: i32,

        /// Duration in seconds
        #[arg(short, long, value_parser = parse_seconds)]
        duration: Option<Duration>,
    },

    /// Pulse one or both motors
    Pulse {
        /// Pulse intensity (0-100)
        #[arg(short, long)]
        intensity: Option<i32>,

        /// Pulse length and gap in milliseconds
        #[arg(short, long)]
        duration_ms: Option<u64>,

        /// Number of pulses
        #[arg(short, long)]
        count: Option<u32>,

        /// Motor: left, right, both
        #[arg(short, long)]
        motor: Option<Motor>,
    },

    /// Stop all motors
    Stop,

    /// Run through every motor
    Demo,

    /// List HID devices from known controller vendors
    List,

    /// Write a default configuration file
    Init {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("turtle_rumble={}", log_level).parse()?),
        )
        .with_target(false)
        .init();

    let config_path = cli.config.unwrap_or_else(config::config_dir);
    let mut config = Config::load_dir(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    if let Some(vendor_id) = cli.vendor_id {
        config.device.vendor_id = vendor_id;
    }
    if let Some(product_id) = cli.product_id {
        config.device.product_id = product_id;
    }

    match cli.command {
        Commands::Vibrate {
            left,
            right,
            left_trigger,
            right_trigger,
            duration,
        } => {
            let duration = match duration {
                Some(duration) => duration,
                None => config.hold_duration()?,
            };
            run_vibrate(&config, [left, right, left_trigger, right_trigger], duration)
        }
        Commands::Pulse {
            intensity,
            duration_ms,
            count,
            motor,
        } => {
            let pulse = &config.pulse;
            run_pulse(
                &config,
                intensity.unwrap_or(pulse.intensity),
                duration_ms.map(Duration::from_millis).unwrap_or_else(|| pulse.duration()),
                count.unwrap_or(pulse.count),
                motor.unwrap_or(pulse.motor),
            )
        }
        Commands::Stop => run_stop(&config),
        Commands::Demo => run_demo(&config),
        Commands::List => list_devices(&config),
        Commands::Init { output } => init_config(output),
    }
}

/// Running flag cleared by Ctrl-C
fn shutdown_flag() -> Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    })
    .context("Error setting Ctrl-C handler")?;

    Ok(running)
}

fn connect(config: &Config) -> Result<ControllerSession<HidapiBackend>> {
    let target = config.device;
    let backend = HidapiBackend::new()
        .context("Failed to initialize HID API")?
        .with_quirk(config.write_quirk);
    let mut session = ControllerSession::new(backend);

    println!(
        "{} Searching for controller (VID:0x{:04X} PID:0x{:04X})...",
        "→".bright_blue(),
        target.vendor_id,
        target.product_id
    );

    match session.connect(target.vendor_id, target.product_id) {
        Ok(()) => {}
        Err(e @ VibrationError::NotFound { .. }) => {
            println!("{} {}", "✗".bright_red(), e);
            print_known_devices(session.backend_mut(), &config.known_vendors)?;
            return Err(e.into());
        }
        Err(e) => {
            println!("{} {}", "✗".bright_red(), e);
            return Err(e).context("Failed to connect to controller");
        }
    }

    if let Some(descriptor) = session.descriptor() {
        println!(
            "{} Connected: {} (interface {})",
            "✓".bright_green(),
            descriptor
                .product
                .as_deref()
                .unwrap_or("Turtle Beach controller")
                .bright_white(),
            descriptor.interface_number
        );
    }

    Ok(session)
}

/// Print the outcome of an effect. Interruption is not an error.
fn report(result: std::result::Result<bool, VibrationError>) -> Result<()> {
    match result {
        Ok(true) => {
            println!("{} Done", "✓".bright_green());
            Ok(())
        }
        Ok(false) => {
            warn!("Some commands could not be sent");
            println!("{} Some commands failed", "!".bright_yellow());
            Ok(())
        }
        Err(VibrationError::Interrupted) => {
            println!("\n{} Interrupted, motors stopped", "!".bright_yellow());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn run_vibrate(config: &Config, levels: [i32; 4], duration: Duration) -> Result<()> {
    let [left, right, left_trigger, right_trigger] = levels;
    let running = shutdown_flag()?;
    let mut session = connect(config)?;
    let mut composer = EffectComposer::new(SleepPacer::new(running));

    println!(
        "{} L={} R={} LT={} RT={} for {:.2}s",
        "→".bright_blue(),
        left,
        right,
        left_trigger,
        right_trigger,
        duration.as_secs_f64()
    );
    let result = composer.hold(
        &mut session,
        MotorLevels::new(left, right, left_trigger, right_trigger),
        duration,
    );

    session.disconnect();
    report(result)
}

fn run_pulse(
    config: &Config,
    intensity: i32,
    duration: Duration,
    count: u32,
    motor: Motor,
) -> Result<()> {
    let running = shutdown_flag()?;
    let mut session = connect(config)?;
    let mut composer = EffectComposer::new(SleepPacer::new(running));

    println!(
        "{} {} pulse(s) at {} on {} motor(s), {} ms each",
        "→".bright_blue(),
        count,
        intensity,
        motor,
        duration.as_millis()
    );
    let result = composer.pulse_train(&mut session, intensity, duration, count, motor);

    session.disconnect();
    report(result)
}

fn run_stop(config: &Config) -> Result<()> {
    let mut session = connect(config)?;
    let stopped = session.stop();
    session.disconnect();
    report(Ok(stopped))
}

fn run_demo(config: &Config) -> Result<()> {
    let running = shutdown_flag()?;
    let mut session = connect(config)?;
    let mut composer = EffectComposer::new(SleepPacer::new(running));

    println!("{}", "Vibration demo".bright_white().bold());
    println!(
        "{}",
        "Protocol: 09 00 [SEQ] 09 00 0F [LT] [RT] [L] [R] FF 00 EB".dimmed()
    );

    let result = composer.run_demo(&mut session, |name, levels| {
        println!();
        println!("{} {}", "[TEST]".bright_cyan(), name.bright_white());
        println!(
            "       {}",
            format!(
                "L={}, R={}, LT={}, RT={}",
                levels.left, levels.right, levels.left_trigger, levels.right_trigger
            )
            .dimmed()
        );
    });

    session.disconnect();
    report(result)
}

fn list_devices(config: &Config) -> Result<()> {
    let mut backend = HidapiBackend::new().context("Failed to initialize HID API")?;
    print_known_devices(&mut backend, &config.known_vendors)
}

fn print_known_devices(backend: &mut impl HidBackend, vendors: &[u16]) -> Result<()> {
    let devices: Vec<_> = backend
        .devices()
        .context("Failed to enumerate HID devices")?
        .into_iter()
        .filter(|d| vendors.contains(&d.vendor_id))
        .collect();

    if devices.is_empty() {
        println!("{} No matching HID devices found", "✗".bright_red());
        println!();
        println!("Make sure your controller is:");
        println!("  • Connected with a USB data cable");
        println!("  • Visible in `lsusb` with vendor 10f5");
        return Ok(());
    }

    println!("\n{} Available HID devices:\n", "✓".bright_green());
    for (i, device) in devices.iter().enumerate() {
        println!(
            "  {}. {} {}",
            i + 1,
            device.to_string().bright_white(),
            device.display_path().dimmed()
        );
    }
    println!();

    Ok(())
}

fn init_config(output: Option<PathBuf>) -> Result<()> {
    let output = output.unwrap_or_else(|| config::config_dir().join(CONFIG_FILE));
    Config::default()
        .save(&output)
        .with_context(|| format!("Failed to write {:?}", output))?;
    println!(
        "{} Wrote default configuration to {}",
        "✓".bright_green(),
        output.display().to_string().bright_yellow()
    );
    Ok(())
}
