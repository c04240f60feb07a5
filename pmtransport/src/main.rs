//! pmtransport - Power-management transport sample for the remote cores
//!
//! Brings up SysM3 and AppM3, registers the notify and data shared regions,
//! exchanges a run of MessageQ request/reply messages with the remote
//! application and shuts it down with the terminate sentinel.
//!
//! The remote side is provided by the in-process loopback backend.

mod config;

use crate::config::PmTransportConfig;
use anyhow::Result;
use clap::Parser;
use libnyx_remoteproc::loopback::{Faults, Loopback};
use libnyx_remoteproc::{Platform, SessionReport, ShutdownAck, TransportSession};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// pmtransport - remote core MessageQ transport
#[derive(Parser, Debug)]
#[command(name = "pmtransport", version, about)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "/etc/nyx/pmtransport.yaml")]
    config: PathBuf,

    /// Data messages to exchange (overrides the config file)
    #[arg(short = 'n', long)]
    iterations: Option<u32>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Debug mode
    #[arg(short, long)]
    debug: bool,

    /// Failed rendezvous attempts before the remote queue appears
    #[arg(long, env = "PMTRANSPORT_QUEUE_READY_AFTER")]
    queue_ready_after: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = PmTransportConfig::load(&args.config)?;

    let log_level = if args.debug { "debug" } else { config.log_level.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .init();

    info!("pmtransport v{} starting", env!("CARGO_PKG_VERSION"));

    if let Some(iterations) = args.iterations {
        config.session.iterations = iterations;
    }
    if let Some(after) = args.queue_ready_after {
        config.loopback.queue_ready_after = after;
    }

    let backend = Arc::new(Loopback::with_faults(Faults {
        queue_ready_after: config.loopback.queue_ready_after,
        ..Faults::default()
    }));
    let mut session = TransportSession::new(Platform::from_backend(backend), config.session)?;
    let cancel = session.cancel_token();

    // The session blocks; keep the runtime free to watch for Ctrl-C
    let mut run = tokio::task::spawn_blocking(move || session.run());
    let report = tokio::select! {
        joined = &mut run => joined?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling transport session");
            cancel.cancel();
            run.await?
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if !report.is_success() {
        anyhow::bail!("Transport session unsuccessful");
    }
    Ok(())
}

fn print_report(report: &SessionReport) {
    println!("{:<12} {}", "EXCHANGED", report.exchanged);

    let shutdown = match report.shutdown {
        ShutdownAck::Acknowledged => "acknowledged".to_string(),
        ShutdownAck::Unexpected(id) => format!("unexpected reply {:#06x}", id),
        ShutdownAck::NoReply => "no reply".to_string(),
        ShutdownAck::NotSent => "not sent".to_string(),
        ShutdownAck::Skipped => "skipped".to_string(),
    };
    println!("{:<12} {}", "SHUTDOWN", shutdown);

    match &report.error {
        Some(e) => println!("{:<12} {:?}: {}", "ERROR", e.kind(), e),
        None => println!("{:<12} none", "ERROR"),
    }
}
