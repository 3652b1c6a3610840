//! hagrid-sim — run the scheduler over a cluster snapshot.
//!
//! Reads a JSON snapshot (nodes, resources, constraints, history), runs one
//! scheduling pass and prints the resulting placements, actions and
//! diagnostics.
//!
//! # Usage
//!
//! ```text
//! hagrid-sim run --snapshot cluster.json --options options.toml --pin web=node2
//! hagrid-sim run --snapshot cluster.json --format json
//! hagrid-sim digests --snapshot cluster.json
//! ```

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use hagrid_core::DiagnosticKind;
use hagrid_scheduler::{SchedulerRun, Transition, device_digests};
use hagrid_state::{ClusterSnapshot, ClusterState};
use tracing::info;

#[derive(Parser)]
#[command(name = "hagrid-sim", about = "Hagrid scheduler simulator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Schedule a snapshot and print the transition.
    Run {
        /// Cluster snapshot (JSON).
        #[arg(long)]
        snapshot: PathBuf,

        /// Cluster options (TOML), replacing the snapshot's own.
        #[arg(long)]
        options: Option<PathBuf>,

        /// Force a resource onto a node, as `RESOURCE=NODE`.
        #[arg(long, value_name = "RESOURCE=NODE")]
        pin: Vec<String>,

        /// Output format.
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,

        /// Include every action, not just the scheduled ones.
        #[arg(long)]
        all: bool,
    },
    /// Print the digest summaries of the snapshot's fence devices.
    Digests {
        #[arg(long)]
        snapshot: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,hagrid=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            snapshot,
            options,
            pin,
            format,
            all,
        } => run(snapshot, options, &pin, format, all),
        Command::Digests { snapshot } => digests(snapshot),
    }
}

fn run(
    snapshot: PathBuf,
    options: Option<PathBuf>,
    pins: &[String],
    format: Format,
    all: bool,
) -> anyhow::Result<()> {
    let mut run = SchedulerRun::from_files(&snapshot, options.as_deref())
        .with_context(|| format!("loading {}", snapshot.display()))?;
    for pin in pins {
        let Some((rsc, node)) = pin.split_once('=') else {
            bail!("invalid --pin \"{pin}\", expected RESOURCE=NODE");
        };
        run.pin(rsc, node)?;
    }

    let transition = run.execute();
    info!(
        scheduled = transition.scheduled().count(),
        diagnostics = transition.diagnostics.len(),
        "transition computed"
    );

    match format {
        Format::Json => println!("{}", transition.to_json()?),
        Format::Text => print!("{}", render_text(&transition, all)),
    }
    Ok(())
}

fn render_text(transition: &Transition, all: bool) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "Placements:");
    for p in &transition.placements {
        let node = p.node.as_deref().unwrap_or("(stopped)");
        let _ = writeln!(out, "  {:<24} {:<12} {}", p.resource, p.role.as_str(), node);
    }

    let _ = writeln!(out, "\nActions:");
    for a in &transition.actions {
        if !all && !a.is_scheduled() {
            continue;
        }
        let mut flags = Vec::new();
        if a.pseudo {
            flags.push("pseudo");
        }
        if a.optional {
            flags.push("optional");
        }
        if !a.runnable {
            flags.push("blocked");
        }
        let _ = write!(out, "  {}", a.uuid);
        if let Some(node) = &a.node {
            let _ = write!(out, " on {node}");
        }
        if !flags.is_empty() {
            let _ = write!(out, " [{}]", flags.join(","));
        }
        if let Some(reason) = &a.reason {
            let _ = write!(out, " ({reason})");
        }
        out.push('\n');
    }

    if !transition.diagnostics.is_empty() {
        let _ = writeln!(out, "\nDiagnostics:");
        for d in &transition.diagnostics {
            let kind = match d.kind {
                DiagnosticKind::Config => "config",
                DiagnosticKind::Inconsistency => "inconsistency",
                DiagnosticKind::Rollback => "rollback",
            };
            let _ = writeln!(out, "  {kind:<14} {}: {}", d.subject, d.message);
        }
    }
    out
}

fn digests(snapshot: PathBuf) -> anyhow::Result<()> {
    let snapshot = ClusterSnapshot::from_file(&snapshot)
        .with_context(|| format!("loading {}", snapshot.display()))?;
    let state = ClusterState::from_snapshot(&snapshot)?;

    let mut all = String::new();
    let mut secure = String::new();
    for (_, rsc) in state.resources().filter(|(_, r)| r.flags.fence_device) {
        let agent = rsc.agent.as_ref().map_or("", |a| a.kind.as_str());
        let (digest_all, digest_secure) = device_digests(rsc);
        let _ = write!(all, "{}:{agent}:{digest_all},", rsc.id);
        let _ = write!(secure, "{}:{agent}:{digest_secure},", rsc.id);
    }
    println!("#digests-all: {all}");
    println!("#digests-secure: {secure}");
    Ok(())
}
