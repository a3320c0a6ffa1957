//! Display Bootstrap Latency Test
//!
//! Repeatedly starts and tears down the configured virtual display and
//! reports how long each connect-retry phase took.

use std::time::{Duration, Instant};
use dotenv::dotenv;
use xvfb_capture_harness::{DisplayHandle, HarnessConfig};

const ROUNDS: u32 = 5;

fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let config = HarnessConfig::from_env()?;

    println!("🔍 Display Bootstrap Test");
    println!("=========================");
    println!("Display: {} via {}", config.display.id, config.display.server_binary);
    println!("Timeout: {:?}, backoff {:?}\n", config.display.timeout, config.display.connect_backoff);

    let mut min = Duration::MAX;
    let mut max = Duration::ZERO;
    let mut total = Duration::ZERO;

    for round in 1..=ROUNDS {
        let start = Instant::now();
        let display = DisplayHandle::acquire_blocking(&config.display, None)?;
        let latency = start.elapsed();

        let (w, h, d) = display.screen_geometry();
        println!("{}. {:.1}ms (server pid {}, screen {}x{}x{})", round, latency.as_secs_f64() * 1000.0, display.server_pid(), w, h, d);

        min = min.min(latency);
        max = max.max(latency);
        total += latency;
        // Server is stopped here, before the next round reuses the id
        drop(display);
    }

    println!("\n📊 Test Results:");
    println!("----------------");
    println!("  Min: {:.2}ms", min.as_secs_f64() * 1000.0);
    println!("  Max: {:.2}ms", max.as_secs_f64() * 1000.0);
    println!("  Avg: {:.2}ms", total.as_secs_f64() * 1000.0 / f64::from(ROUNDS));

    Ok(())
}
