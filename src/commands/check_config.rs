//! Check-config command implementation

use anyhow::Result;
use competition_exchange::Config;
use tracing::info;

pub fn run(config_path: String) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    info!("Configuration {} is valid", config_path);

    let t = &config.trading;
    println!("\n{}", "=".repeat(60));
    println!("EXCHANGE CONFIGURATION");
    println!("{}", "=".repeat(60));
    println!("Commission rate:    {}", t.commission_rate);
    println!("Price band:         ±{}", t.price_band_pct);
    println!("Reservation buffer: {}", t.reservation_buffer);
    println!("Order TTL:          {}h", t.order_ttl_hours);
    println!("Short selling:      {}", t.allow_short_selling);
    match t.max_position_size {
        Some(cap) => println!("Position cap:       {}", cap),
        None => println!("Position cap:       none"),
    }
    println!("Starting cash:      {}", t.starting_cash);
    println!(
        "Rate limit:         {} orders / {}s",
        config.rate_limit.max_submissions, config.rate_limit.window_secs
    );
    println!("Sweep interval:     {}s", config.engine.sweep_interval_secs);
    match &config.storage.state_dir {
        Some(dir) => println!("State directory:    {}", dir.display()),
        None => println!("State directory:    (in-memory)"),
    }

    println!("\nInstruments:");
    for instrument in &config.instruments {
        println!("  {:<8} {}", instrument.symbol, instrument.reference_price);
    }
    println!("{}", "=".repeat(60));

    Ok(())
}
