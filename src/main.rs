mod bat_controllers;
mod bat_gui;
mod bat_models;
mod bat_views;

use anyhow::Context;
use bat_controllers::{ConsoleOptions, PollingController, POLL_INTERVAL_SECS};
use bat_models::{DataFetcher, DurableStore, GeoPoint, DEFAULT_ENDPOINT};
use clap::Parser;
use std::time::Duration;

/// Real-time arrival timeline for the Chiayi green bus lines.
#[derive(Parser, Debug)]
#[command(name = "bat", version, about)]
struct Cli {
    /// Run in the terminal instead of opening a window
    #[arg(long)]
    headless: bool,

    /// Feed endpoint (overrides the BAT_ENDPOINT environment variable)
    #[arg(long)]
    endpoint: Option<String>,

    /// Route to show at startup (r1-r4), overriding the saved selection
    #[arg(long)]
    route: Option<String>,

    /// Polling interval in seconds
    #[arg(long, default_value_t = POLL_INTERVAL_SECS)]
    interval: u64,

    /// Your latitude, for nearby-first ordering
    #[arg(long)]
    lat: Option<f64>,

    /// Your longitude, for nearby-first ordering
    #[arg(long)]
    lon: Option<f64>,

    /// Keyword filter on station names (headless mode)
    #[arg(long, default_value = "")]
    filter: String,

    /// Show only stations with live activity (headless mode)
    #[arg(long)]
    only_active: bool,

    /// Order stations by distance from --lat/--lon (headless mode)
    #[arg(long)]
    nearby_first: bool,
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    // Set up panic hook for better error messages
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("\n{}", "═".repeat(70));
        eprintln!("❌ APPLICATION PANIC");
        eprintln!("{}", "═".repeat(70));
        eprintln!("\nThe application encountered an unexpected error:");
        eprintln!("{}", panic_info);
        eprintln!("\n💡 Troubleshooting:");
        eprintln!("  • Please restart the application");
        eprintln!("  • Check your internet connection");
        eprintln!("  • Report this issue if it persists");
        eprintln!("\n{}", "═".repeat(70));
    }));

    let cli = Cli::parse();
    let endpoint = cli
        .endpoint
        .or_else(|| std::env::var("BAT_ENDPOINT").ok())
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

    let fetcher = DataFetcher::new(endpoint).context("Failed to set up the HTTP client")?;
    let durable = DurableStore::open_default();
    let mut controller = PollingController::new(fetcher, durable);
    controller.set_poll_interval(Duration::from_secs(cli.interval.max(1)));

    if let (Some(lat), Some(lon)) = (cli.lat, cli.lon) {
        controller.set_user_location(Some(GeoPoint { lat, lon }));
    }
    if let Some(route) = cli.route.as_deref() {
        if !controller.select_route(route) {
            anyhow::bail!("Unknown route {:?} (expected r1, r2, r3 or r4)", route);
        }
    }

    if cli.headless {
        let options = ConsoleOptions {
            keyword: cli.filter,
            only_active: cli.only_active,
            nearby_first: cli.nearby_first,
        };
        bat_controllers::run_console(controller, options);
        Ok(())
    } else {
        bat_gui::run_gui(controller).map_err(|e| anyhow::anyhow!("GUI error: {}", e))
    }
}
