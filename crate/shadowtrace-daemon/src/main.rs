//! Daemon binary mounting a shadowing filesystem.

use anyhow::Context as _;
use clap::Parser;
use futures_util::stream::StreamExt as _;
use shadowtrace_core::config::Config;
use shadowtrace_core::fs::{FsContext, MountContext, fuse};
use shadowtrace_core::trace::{self, TraceEmitter, TraceFormat};
use shadowtrace_core::utils::logging;
use signal_hook_tokio::Signals;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

/// Mount a directory elsewhere and trace every operation done
/// through the mount.
///
/// Each operation is written as one record to the trace output,
/// stdout by default, tagged with the uid, gid and pid of the process
/// that issued it. Stop it with SIGTERM; the filesystem is unmounted
/// and pending trace records written before exiting.
///
/// By default, outputs errors and warnings to stderr. To configure
/// the output, set the env variable RUST_LOG. Set the env variable
/// RUST_LOG_FORMAT=SYSTEMD to a systemd-friendly log output.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about, verbatim_doc_comment)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// File to append trace records to, instead of stdout
    #[arg(long)]
    trace_out: Option<PathBuf>,

    /// Format of the trace records: json or text
    #[arg(long)]
    trace_format: Option<TraceFormat>,

    /// Let other users access the mount
    #[arg(long)]
    allow_other: bool,

    /// Directory to shadow
    shadow: PathBuf,

    /// Where to mount it
    mountpoint: PathBuf,
}

/// Time given to the trace writer to catch up on shutdown.
const WRITER_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_with_info_modules(vec!["shadowtrace", "shadowtrace_core"]);

    if let Err(err) = execute(cli).await {
        eprintln!("ERROR: {err:#}");
        process::exit(1);
    };
}

async fn execute(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("{}: failed to read TOML config file", path.display()))?,
        None => Config::default(),
    };
    if let Some(output) = cli.trace_out {
        config.trace.output = Some(output);
    }
    if let Some(format) = cli.trace_format {
        config.trace.format = format;
    }
    if cli.allow_other {
        config.mount.allow_other = true;
    }

    let shadow = check_directory(&cli.shadow)?;
    let mountpoint = check_directory(&cli.mountpoint)?;
    if shadow.starts_with(&mountpoint) {
        anyhow::bail!(
            "Shadow directory '{}' is inside mountpoint '{}'",
            shadow.display(),
            mountpoint.display()
        );
    }

    let sink = trace::writer::open_sink(config.trace.output.as_deref())
        .await
        .with_context(|| match &config.trace.output {
            Some(path) => format!("{}: failed to open trace output", path.display()),
            None => "Failed to open trace output".to_string(),
        })?;
    let (tracer, records) = TraceEmitter::channel(config.trace.queue);
    let writer = tokio::spawn(trace::writer::run(records, sink, config.trace.format));

    let ctx = FsContext::new(
        MountContext::new(&mountpoint, &shadow),
        config.filter.build(),
        tracer.clone(),
        config.cache.validity(),
    );
    let handle = fuse::export(ctx, &mountpoint, &config.mount)
        .with_context(|| format!("Failed to mount on {}", mountpoint.display()))?;

    let mut signals = Signals::new([
        signal_hook::consts::SIGHUP,
        signal_hook::consts::SIGTERM,
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGQUIT,
    ])?;

    // stdout may carry the trace
    eprintln!("Mounted {} on {}", shadow.display(), mountpoint.display());

    let _ = signals.next().await;

    log::info!("Interrupted. Unmounting..");
    signals.handle().close(); // A 2nd signal kills the process
    handle.join().await?;

    let dropped = tracer.dropped();
    if dropped > 0 {
        log::warn!("{dropped} trace records were dropped");
    }
    drop(tracer);
    if tokio::time::timeout(WRITER_GRACE, writer).await.is_err() {
        log::warn!("Trace output didn't finish in time; some records may be lost");
    }

    Ok(())
}

/// Check that `path` is an existing directory and return its
/// canonical form.
fn check_directory(path: &Path) -> anyhow::Result<PathBuf> {
    log::debug!("Checking directory {}", path.display());
    if !path.exists() {
        anyhow::bail!("Directory '{}' does not exist", path.display());
    }
    if !path.is_dir() {
        anyhow::bail!("Path '{}' is not a directory", path.display());
    }

    std::fs::canonicalize(path).with_context(|| format!("{}: failed to resolve", path.display()))
}
