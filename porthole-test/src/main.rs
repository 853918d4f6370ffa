//! porthole-test - Reference Porthole client
//!
//! Brings up a simulated Porthole device, then runs the canonical client
//! sequence against it through the control-code interface:
//! - Register connect/disconnect notifications
//! - Wait for the peer to attach
//! - Share a setup message and report the mapping id
//! - Release the buffer and wait for the peer to detach

mod config;
mod error;
mod payload;
mod session;
mod sim;

use crate::config::ClientConfig;
use crate::sim::Simulation;
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

/// porthole-test - Reference Porthole client
#[derive(Parser, Debug)]
#[command(name = "porthole-test", version, about)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "porthole-test.yaml")]
    config: PathBuf,

    /// Override the ring size of the setup message
    #[arg(long, env = "PORTHOLE_RING_SIZE")]
    ring_size: Option<u32>,

    /// Debug mode
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .init();

    info!("porthole-test v{} (driver v{})", env!("CARGO_PKG_VERSION"), porthole::VERSION);

    let mut config = ClientConfig::load(&args.config)?;
    if let Some(ring_size) = args.ring_size {
        config.message.ring_size = ring_size;
    }

    let sim = Simulation::start(&config.device)?;
    let result = session::run(&sim, &config.message, config.device.wait_timeout());

    let stats = sim.device().stats();
    info!(
        messages = stats.messages,
        segments = stats.segments,
        unmaps = stats.unmaps,
        failures = stats.failures,
        "device counters"
    );
    sim.shutdown();

    let report = result?;
    info!(
        "Message shared as mapping {:#x} ({} bytes in {} segments)",
        report.map_id, report.payload_len, report.segments
    );
    Ok(())
}
