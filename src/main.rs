use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::thread;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use flowagg::aggregator::{AggregatorState, ThreadedAggregator};
use flowagg::config::{Config, OutputFormat};
use flowagg::ipfix::Registry;
use flowagg::printer;

/// Multi-threaded IPFIX flow record aggregation.
#[derive(Parser)]
#[command(name = "flowagg", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Comma-separated key fields.
    #[arg(short, long)]
    keys: Option<String>,

    /// Comma-separated value fields.
    #[arg(short, long)]
    values: Option<String>,

    /// Comma-separated order fields (name[/asc|/desc]).
    #[arg(short, long)]
    order: Option<String>,

    /// Maximum number of output records.
    #[arg(short, long)]
    limit: Option<usize>,

    /// Worker thread count.
    #[arg(short, long)]
    threads: Option<usize>,

    /// Print per-thread results instead of merging them.
    #[arg(long)]
    no_merge: bool,

    /// Keep biflow halves that carry no octets and packets.
    #[arg(long)]
    no_biflow_autoignore: bool,

    /// Merge only the best N records using the threshold algorithm.
    #[arg(long)]
    topk: Option<usize>,

    /// Output format.
    #[arg(long, value_enum)]
    format: Option<OutputFormat>,

    /// Input file glob patterns.
    inputs: Vec<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

impl Cli {
    /// Command line values take precedence over the configuration file.
    fn apply(&self, cfg: &mut Config) {
        let agg = &mut cfg.aggregation;
        if let Some(keys) = &self.keys {
            agg.keys = keys.clone();
        }
        if let Some(values) = &self.values {
            agg.values = values.clone();
        }
        if let Some(order) = &self.order {
            agg.order_by = order.clone();
        }
        if let Some(limit) = self.limit {
            agg.limit = Some(limit);
        }
        if let Some(threads) = self.threads {
            agg.threads = threads;
        }
        if self.no_merge {
            agg.merge = false;
        }
        if self.no_biflow_autoignore {
            agg.biflow_autoignore = false;
        }
        if let Some(topk) = self.topk {
            agg.topk = topk;
        }
        if let Some(format) = self.format {
            cfg.output.format = format;
        }
        if !self.inputs.is_empty() {
            cfg.input.patterns = self.inputs.clone();
        }
    }
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("flowagg {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .init();

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    cli.apply(&mut cfg);
    cfg.validate()?;

    info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting flowagg",
    );

    run(cfg)
}

fn run(cfg: Config) -> Result<()> {
    let registry = Registry::builtin();
    let view = cfg.aggregation.create_view(&registry)?;
    let options = cfg.aggregation.options(&registry)?;

    let files = cfg.input.files()?;
    if files.is_empty() {
        bail!("no input files (pass glob patterns or set input.patterns)");
    }

    let aggregator = ThreadedAggregator::start(view, files, registry, options)?;

    let shutdown = CancellationToken::new();
    let signals = spawn_signal_watcher(aggregator.cancel_token(), shutdown.clone())?;

    loop {
        match aggregator.notifications().get_timeout(cfg.progress_interval) {
            Ok(Some(state)) => {
                info!(?state, "aggregator state changed");
                if state.is_terminal() {
                    break;
                }
            }
            Ok(None) => info!(
                processed_flows = aggregator.processed_flows(),
                total_flows = aggregator.total_flows(),
                processed_files = aggregator.processed_files(),
                total_files = aggregator.total_files(),
                "progress",
            ),
            Err(_) => break,
        }
    }

    let state = aggregator.state();
    let cancelled = aggregator.cancel_token().is_cancelled();
    let result = aggregator.join();

    shutdown.cancel();
    if signals.join().is_err() {
        warn!("signal watcher panicked");
    }

    let output = result?;
    if cancelled && state != AggregatorState::Errored {
        warn!("aggregation cancelled, printing partial results");
    }

    let mut printer = printer::create_printer(cfg.output.format, BufWriter::new(io::stdout()));
    printer::print_output(printer.as_mut(), &output).context("writing output")?;

    info!("flowagg finished");
    Ok(())
}

/// Trips `cancel` on SIGINT or SIGTERM until `shutdown` is cancelled.
fn spawn_signal_watcher(
    cancel: CancellationToken,
    shutdown: CancellationToken,
) -> Result<thread::JoinHandle<()>> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    thread::Builder::new()
        .name("flowagg-signals".into())
        .spawn(move || {
            rt.block_on(async move {
                #[cfg(unix)]
                let terminate = async {
                    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                        Ok(mut sigterm) => {
                            sigterm.recv().await;
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to register SIGTERM handler");
                            std::future::pending::<()>().await;
                        }
                    }
                };
                #[cfg(not(unix))]
                let terminate = std::future::pending::<()>();

                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("received SIGINT, cancelling aggregation");
                        cancel.cancel();
                    }
                    _ = terminate => {
                        info!("received SIGTERM, cancelling aggregation");
                        cancel.cancel();
                    }
                    _ = shutdown.cancelled() => {}
                }
            });
        })
        .context("spawning signal watcher thread")
}
