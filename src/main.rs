use dotenv::dotenv;
use xvfb_capture_harness::config::HarnessConfig;
use xvfb_capture_harness::scenario::{default_requests, run_scenario};
use xvfb_capture_harness::teardown::TeardownLog;

fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let config = HarnessConfig::from_env()?;
    std::fs::create_dir_all(&config.output_dir)?;

    println!("🔧 Xvfb Capture Harness");
    println!("=======================");
    println!(
        "Display {} ({}x{}x{}) via {}",
        config.display.id,
        config.display.width,
        config.display.height,
        config.display.depth,
        config.display.server_binary
    );
    match &config.subject {
        Some(subject) => println!("Subject: {}", subject.command_line()),
        None => println!("Subject: none (bare root window)"),
    }

    let teardown = TeardownLog::new();
    let outcomes = run_scenario(&config, &default_requests(&config), Some(teardown.clone()))?;

    println!("\n📊 Results:");
    for outcome in &outcomes {
        println!(
            "  {:<6} {}x{} -> {} ({:.2}s)",
            outcome.name,
            outcome.width,
            outcome.height,
            outcome.output.display(),
            outcome.elapsed.as_secs_f64()
        );
    }
    log::debug!("Teardown: {:?}", teardown.records());

    println!("\n✅ Capture complete!");
    Ok(())
}
