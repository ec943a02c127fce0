//! # Seed Data Generator
//!
//! Populates the database with a synthetic glucose curve for development.
//!
//! ## Usage
//! ```bash
//! # Generate 24h of readings at 5-minute spacing (default)
//! cargo run -p gluco-db --bin seed
//!
//! # Generate 3 days of readings
//! cargo run -p gluco-db --bin seed -- --hours 72
//!
//! # Specify database path
//! cargo run -p gluco-db --bin seed -- --db ./data/gluco.db
//! ```
//!
//! ## Generated Curve
//! A slow sine wave around 120 mg/dl with a meal bump every few hours,
//! ending at the current minute. Each reading carries its rate of change.

use std::env;

use gluco_core::{now_ms, GlucoseRecord};
use gluco_db::{Database, DbConfig};

const MINUTE_MS: i64 = 60_000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let mut hours: i64 = 24;
    let mut interval_min: i64 = 5;
    let mut db_path = String::from("./gluco_dev.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--hours" | "-H" => {
                if i + 1 < args.len() {
                    hours = args[i + 1].parse().unwrap_or(24);
                    i += 1;
                }
            }
            "--interval" | "-i" => {
                if i + 1 < args.len() {
                    interval_min = args[i + 1].parse().unwrap_or(5).max(1);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("GlucoSync Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -H, --hours <N>      Hours of history to generate (default: 24)");
                println!("  -i, --interval <N>   Minutes between readings (default: 5)");
                println!("  -d, --db <PATH>      Database file path (default: ./gluco_dev.db)");
                println!("  -h, --help           Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    println!("🌱 GlucoSync Seed Data Generator");
    println!("================================");
    println!("Database: {}", db_path);
    println!("History:  {}h every {} min", hours, interval_min);
    println!();

    let db = Database::new(DbConfig::new(&db_path)).await?;
    println!("✓ Connected to database");
    println!("✓ Migrations applied");

    let end = now_ms() / MINUTE_MS * MINUTE_MS;
    let step = interval_min * MINUTE_MS;
    let count = hours * 60 / interval_min;

    let records: Vec<GlucoseRecord> = (0..count)
        .map(|n| {
            let timestamp = end - (count - 1 - n) * step;
            synthetic_reading(timestamp, interval_min)
        })
        .collect();

    let start = std::time::Instant::now();
    let inserted = db.glucose().insert_if_absent(&records).await?;
    let elapsed = start.elapsed();

    println!();
    println!(
        "✓ Stored {} of {} readings in {:?} ({} already present)",
        inserted,
        records.len(),
        elapsed,
        records.len() - inserted
    );
    println!("  Total in database: {}", db.glucose().count().await?);

    Ok(())
}

/// Value of the synthetic curve at `minute`.
fn curve(minute: i64) -> f64 {
    let t = minute as f64;
    let base = 120.0 + 35.0 * (t / 240.0 * std::f64::consts::TAU).sin();
    // meal bump every 5 hours, decaying over 90 minutes
    let since_meal = (minute % 300) as f64;
    let bump = if since_meal < 90.0 {
        60.0 * (since_meal / 90.0 * std::f64::consts::PI).sin()
    } else {
        0.0
    };
    base + bump
}

/// Builds a reading with a rate computed from the previous sample.
fn synthetic_reading(timestamp: i64, interval_min: i64) -> GlucoseRecord {
    let minute = timestamp / MINUTE_MS;
    let value = curve(minute);
    let previous = curve(minute - interval_min);
    let rate = ((value - previous) / interval_min as f64 * 10.0).round() / 10.0;

    GlucoseRecord::new(timestamp, value.round() as i32)
        .with_rate(rate)
        .with_source("seed")
}
