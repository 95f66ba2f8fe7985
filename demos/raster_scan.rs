use anyhow::{Context, Result};
use kapascan::{Measurement, RigConfig};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let path = args.get(1).map(String::as_str).unwrap_or("rig.toml");

    let config = RigConfig::load(path).with_context(|| format!("failed to load {path}"))?;
    let mut measurement = Measurement::connect(&config)?;
    measurement.initialize()?;

    measurement.move_away()?;
    println!("Stage parked, place the sample and press enter.");
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    measurement.move_back()?;
    measurement.move_to_start()?;

    let result = measurement.scan()?;
    measurement.close()?;

    for (row, y) in result.z.iter().zip(&result.y) {
        let mean = row.iter().sum::<f64>() / row.len() as f64;
        println!("y = {y:.4} mm: mean z {mean:.4} µm over {} points", row.len());
    }
    Ok(())
}
