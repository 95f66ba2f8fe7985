use std::thread;
use std::time::Duration;

use anyhow::Result;
use kapascan::{DataLogger, LoggerSettings, ScanChannel};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let host = args.get(1).map(String::as_str).unwrap_or("192.168.254.51");
    let channel: u16 = match args.get(2) {
        Some(c) => c.parse()?,
        None => 101,
    };

    let mut logger = DataLogger::connect(&LoggerSettings::new(host))?;
    println!("IDN: {}", logger.identify()?);

    logger.configure(ScanChannel::new(channel)?)?;
    logger.display("TEMP MONITOR")?;

    for _ in 0..5 {
        thread::sleep(Duration::from_secs(1));
        println!("ch{channel}: {:.3} °C", logger.read_monitor()?);
    }

    let err = logger.system_error()?;
    if err.is_error() {
        println!("Error queue : {},\"{}\"", err.code, err.message);
    }

    // Leave the front panel as we found it.
    logger.close()?;
    Ok(())
}
