/// VeilNet daemon: one binary, three roles
///
/// `veilnet-daemon coord <config.json>` runs the coordinator,
/// `veilnet-daemon router <config.json>` a router, and
/// `veilnet-daemon client <config.json>` the browser-facing gateway backed
/// by the client core.
use anyhow::Result;
use tracing::{info, Level};
use tracing_subscriber;

use veilnet_common::{ClientConfig, CoordConfig, RouterConfig};
use veilnet_core::{Coordinator, Router};
use veilnet_daemon::Gateway;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("coord") => run_coord(config_path(&args)?).await,
        Some("router") => run_router(config_path(&args)?).await,
        Some("client") => run_client(config_path(&args)?).await,
        Some("help") | Some("--help") | Some("-h") => {
            print_help();
            Ok(())
        }
        Some("version") | Some("--version") | Some("-V") => {
            println!("veilnet-daemon v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(other) => {
            eprintln!("Unknown command: {}", other);
            eprintln!("Run with 'help' to see available commands");
            std::process::exit(1);
        }
        None => {
            print_help();
            std::process::exit(1);
        }
    }
}

fn config_path(args: &[String]) -> Result<&str> {
    args.get(2)
        .map(String::as_str)
        .ok_or_else(|| anyhow::anyhow!("missing config path; see 'veilnet-daemon help'"))
}

async fn run_coord(path: &str) -> Result<()> {
    let config = CoordConfig::from_file(path)?;
    info!(identity = ?config.tracing_identity, "starting coordinator");

    let handle = Coordinator::start(config).await?;
    info!(client_addr = %handle.client_addr, router_addr = %handle.router_addr, "coordinator running");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    handle.stop().await;
    Ok(())
}

async fn run_router(path: &str) -> Result<()> {
    let config = RouterConfig::from_file(path)?;
    info!(router_id = config.router_id, "starting router");

    let handle = Router::start(config).await?;
    info!(client_addr = %handle.client_addr, "router running");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    handle.stop().await;
    Ok(())
}

async fn run_client(path: &str) -> Result<()> {
    let config = ClientConfig::from_file(path)?;
    info!(client_id = %config.client_id, "starting client gateway");

    Gateway::new(&config).serve().await?;
    Ok(())
}

fn print_help() {
    println!("VeilNet Daemon - Tor-style anonymizing overlay");
    println!();
    println!("USAGE:");
    println!("    veilnet-daemon <ROLE> <CONFIG>");
    println!();
    println!("ROLES:");
    println!("    coord <config.json>    Run the coordinator (directory + ring selection)");
    println!("    router <config.json>   Run a relay router");
    println!("    client <config.json>   Run the browser-facing gateway");
    println!("    help                   Show this help message");
    println!("    version                Show version information");
    println!();
    println!("EXAMPLES:");
    println!("    veilnet-daemon coord config/coord.json");
    println!("    veilnet-daemon router config/router1.json");
    println!("    veilnet-daemon client config/client.json");
    println!();
    println!("    # Then browse through the overlay:");
    println!("    curl http://localhost:8800/example.org/view/");
}
