use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use kapascan::{
    Controller, DataLogger, Measurement, MoveMode, RigConfig, ScanChannel, ScanResult, Stage,
    TriggerMode,
};
use tracing::Level;

#[derive(Debug, Parser)]
#[command(name = "kapascan", version, about = "Operate the scanning-capacitance rig")]
struct Cli {
    /// Rig description (TOML)
    #[arg(short, long, default_value = "rig.toml")]
    config: PathBuf,

    /// -v for debug output, -vv for trace
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// DT6220 capacitance controller
    Controller {
        #[command(subcommand)]
        action: ControllerAction,
    },
    /// grbl translation stage
    Stage {
        #[command(subcommand)]
        action: StageAction,
    },
    /// 34972A data logger
    Logger {
        #[command(subcommand)]
        action: LoggerAction,
    },
    /// Raster scan as described in the [scan] section
    Scan,
}

#[derive(Debug, Subcommand)]
enum ControllerAction {
    Version,
    Status,
    Acquire {
        #[arg(long, default_value_t = 10)]
        points: usize,
        #[arg(long, value_enum)]
        mode: Option<TriggerMode>,
        /// Sampling time in ms
        #[arg(long)]
        sampling_time: Option<f64>,
    },
}

#[derive(Debug, Subcommand)]
enum StageAction {
    Status,
    Home,
    Unlock,
    #[command(allow_negative_numbers = true)]
    Move {
        x: f64,
        y: f64,
        #[arg(long, value_enum, default_value_t = MoveMode::Absolute)]
        mode: MoveMode,
    },
    #[command(allow_negative_numbers = true)]
    Jog {
        dx: f64,
        dy: f64,
        /// Feed rate in mm/min
        #[arg(long, default_value_t = 100.0)]
        feed: f64,
    },
}

#[derive(Debug, Subcommand)]
enum LoggerAction {
    Idn,
    /// Read the monitored channel, configuring it first if given
    Read {
        #[arg(long)]
        channel: Option<u16>,
    },
    Display {
        text: String,
    },
    Clear,
    Error,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = RigConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    match cli.command {
        Commands::Controller { action } => controller(&config, action),
        Commands::Stage { action } => stage(&config, action),
        Commands::Logger { action } => logger(&config, action),
        Commands::Scan => scan(&config),
    }
}

fn controller(config: &RigConfig, action: ControllerAction) -> Result<()> {
    let mut controller = Controller::connect(&config.controller)
        .context("failed to connect to the controller")?;
    match action {
        ControllerAction::Version => println!("{}", controller.version()?),
        ControllerAction::Status => println!("{}", controller.status()?),
        ControllerAction::Acquire {
            points,
            mode,
            sampling_time,
        } => {
            controller.configure_acquisition(mode, sampling_time)?;
            let data = controller.acquire(points)?;
            for (sensor, samples) in controller.sensors().iter().zip(&data) {
                let mean = samples.iter().sum::<f64>() / samples.len() as f64;
                println!(
                    "{} ({}, ch{}): mean {:.3} µm over {} samples",
                    sensor.serial_nr,
                    sensor.name,
                    sensor.channel,
                    mean,
                    samples.len()
                );
            }
        }
    }
    Ok(())
}

fn stage(config: &RigConfig, action: StageAction) -> Result<()> {
    let mut stage = Stage::connect(&config.stage).context("failed to connect to the stage")?;
    match action {
        StageAction::Status => {
            let status = stage.status()?;
            println!(
                "{:?} at X{:.4} Y{:.4}",
                status.state, status.position.x, status.position.y
            );
        }
        StageAction::Home => stage.home()?,
        StageAction::Unlock => stage.unlock()?,
        StageAction::Move { x, y, mode } => stage.move_to(x, y, mode)?,
        StageAction::Jog { dx, dy, feed } => stage.jog(dx, dy, feed)?,
    }
    Ok(())
}

fn logger(config: &RigConfig, action: LoggerAction) -> Result<()> {
    let settings = config
        .logger
        .as_ref()
        .context("the rig config has no [logger] section")?;
    let mut logger = DataLogger::connect(settings).context("failed to connect to the logger")?;
    match action {
        LoggerAction::Idn => println!("{}", logger.identify()?),
        LoggerAction::Read { channel } => {
            if let Some(channel) = channel {
                logger.configure(ScanChannel::new(channel)?)?;
            }
            println!("{}", logger.read_monitor()?);
        }
        LoggerAction::Display { text } => logger.display(&text)?,
        LoggerAction::Clear => logger.clear_display()?,
        LoggerAction::Error => {
            let entry = logger.system_error()?;
            println!("{},\"{}\"", entry.code, entry.message);
        }
    }
    Ok(())
}

fn scan(config: &RigConfig) -> Result<()> {
    let mut measurement = Measurement::connect(config).context("failed to connect the rig")?;
    measurement.initialize()?;
    let result = measurement.scan()?;
    measurement.close()?;
    print_result(&result);
    Ok(())
}

/// One whitespace-separated row per grid point: x, y, z and temperature.
fn print_result(result: &ScanResult) {
    for (yi, y) in result.y.iter().enumerate() {
        for (xi, x) in result.x.iter().enumerate() {
            let z = result.z[yi][xi];
            match &result.temperature {
                Some(t) => println!("{x:.4} {y:.4} {z:.4} {:.3}", t[yi][xi]),
                None => println!("{x:.4} {y:.4} {z:.4}"),
            }
        }
    }
}
