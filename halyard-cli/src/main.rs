//! halyard - Kubernetes-aware L4 load-balancer control plane.

mod commands;
mod health;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::RoleArgs;

/// Program VIPs into IPVS and announce them over BGP, driven by a cluster
/// watch.
#[derive(Parser)]
#[command(name = "halyard")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the director: announce VIPs over BGP and program IPVS.
    ///
    /// The director continuously checks the cluster watch for node health
    /// and listener configuration, deletes rules that no longer apply and
    /// creates the ones that are missing.
    Director(RoleArgs),

    /// Run a real server: configure loopback VIPs and iptables on a
    /// backend node.
    ///
    /// The real server probes the director once per second and takes over
    /// local programming only after a sustained director outage.
    Realserver(RoleArgs),
}

fn init_tracing(verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("halyard_cli={level}").parse()?)
                .add_directive(format!("halyard_core={level}").parse()?)
                .add_directive(format!("halyard_system={level}").parse()?)
                .add_directive(format!("halyard_bgp={level}").parse()?)
                .add_directive(format!("halyard_watch={level}").parse()?),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    match cli.command {
        Commands::Director(args) => commands::director::run(args).await,
        Commands::Realserver(args) => commands::realserver::run(args).await,
    }
}
