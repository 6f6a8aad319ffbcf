//! Redowire host binary: `redowire -f <config> [-r]`.
//!
//! Exit code 0 on clean shutdown; otherwise the code of the fatal error
//! class (see `RedowireError::exit_code`).

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser as ClapParser;
use redowire_builder::json::{FileWriter, JsonFormat};
use redowire_builder::{Metrics, QueueBuilder};
use redowire_error::{RedowireError, Result};
use redowire_metadata::schema::{SchemaSnapshot, TableFilter};
use redowire_metadata::{DbParams, Metadata, StartOptions};
use redowire_redo::reader::ReaderConfig;
use redowire_replicator::{PathMapping, Replicator, ReplicatorConfig};
use redowire_txn::{MemoryLimits, TransactionBuffer};
use redowire_types::cx::PollTimings;
use redowire_types::value::DbTimezone;
use redowire_types::{Cx, DisableChecks, RedoLog, RedoThread};
use tracing::{error, info, warn};

use config::{Config, SourceConfig, TargetConfig};

#[derive(Debug, ClapParser)]
#[command(name = "redowire", about = "Oracle redo log replication engine")]
struct Args {
    /// Configuration file.
    #[arg(short = 'f', long = "file")]
    config: PathBuf,

    /// Allow running as root.
    #[arg(short = 'r', long = "root")]
    allow_root: bool,
}

/// Ctrl-C / SIGTERM requests a soft shutdown of every source.
fn set_ctrl_handler(contexts: Vec<Arc<Cx>>) {
    ctrlc::set_handler(move || {
        for cx in &contexts {
            cx.stop_soft();
        }
    })
    .expect("Error setting Ctrl-C handler");
}

/// Whether the process runs with root privileges. `/proc/self` is owned
/// by the effective uid of the process.
fn running_as_root() -> bool {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata("/proc/self")
        .map(|meta| meta.uid() == 0)
        .unwrap_or(false)
}

fn init_tracing(log_level: u8) {
    let level = match log_level {
        0 => "error",
        1 => "warn",
        2 | 3 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();

    if !args.allow_root && running_as_root() {
        eprintln!("refusing to run as root; pass -r to override");
        return ExitCode::from(1);
    }

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("bad configuration: {e}");
            return ExitCode::from(e.exit_code() as u8);
        }
    };
    init_tracing(config.log_level);

    match run(&config) {
        Ok(()) => {
            info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run(config: &Config) -> Result<()> {
    info!(
        version = config.version.as_deref().unwrap_or("unversioned"),
        sources = config.sources.len(),
        targets = config.targets.len(),
        "configuration loaded"
    );
    let mut contexts = Vec::new();
    let mut handles = Vec::new();

    for source in &config.sources {
        let target = config
            .targets
            .iter()
            .find(|t| t.source == source.alias)
            .cloned();
        let cx = build_cx(source);
        contexts.push(Arc::clone(&cx));

        let source = source.clone();
        let config = config.clone();
        let handle = std::thread::Builder::new()
            .name(format!("replicator-{}", source.alias))
            .spawn(move || run_source(&config, &source, target.as_ref(), cx))
            .expect("spawning replicator thread");
        handles.push(handle);
    }

    set_ctrl_handler(contexts);

    let mut first_error: Option<RedowireError> = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            Err(_) => {
                if first_error.is_none() {
                    first_error = Some(RedowireError::internal("replicator thread panicked"));
                }
            }
        }
    }
    match first_error {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

fn build_cx(source: &SourceConfig) -> Arc<Cx> {
    let defaults = PollTimings::default();
    let reader = &source.reader;
    let cx = Cx::new(PollTimings {
        refresh_interval_us: reader
            .refresh_interval_us
            .unwrap_or(defaults.refresh_interval_us),
        redo_read_sleep_us: reader
            .redo_read_sleep_us
            .unwrap_or(defaults.redo_read_sleep_us),
        arch_read_sleep_us: reader
            .arch_read_sleep_us
            .unwrap_or(defaults.arch_read_sleep_us),
        arch_read_tries: reader.arch_read_tries.unwrap_or(defaults.arch_read_tries),
    });
    if let Some(debug) = &source.debug {
        if let Some(n) = debug.stop_log_switches {
            cx.arm_stop_log_switches(n);
        }
        if let Some(n) = debug.stop_transactions {
            cx.arm_stop_transactions(n);
        }
    }
    Arc::new(cx)
}

fn build_metadata(config: &Config, source: &SourceConfig) -> Result<Arc<Metadata>> {
    let reader = &source.reader;
    let db_timezone = match &reader.db_timezone {
        None => DbTimezone::UTC,
        Some(text) => text.parse().map_err(|e| RedowireError::BadConfig {
            detail: format!("db-timezone: {e}"),
        })?,
    };
    let metadata = Metadata::new(
        DbParams {
            database: source.name.clone(),
            log_archive_format: reader.log_archive_format.clone(),
            db_recovery_file_dest: reader.db_recovery_file_dest.clone(),
            context: reader.context.clone(),
            db_block_checksum: reader.db_block_checksum.clone(),
            db_timezone,
            disable_checks: DisableChecks(reader.disable_checks),
        },
        StartOptions {
            scn: reader.start_scn,
            seq: reader.start_seq,
            time: reader.start_time.clone(),
        },
        PathBuf::from(&config.state.path),
        config.state.checkpoints_keep,
    );

    let filter = match &source.filter {
        Some(section) => TableFilter::compile(&section.table)?,
        None => TableFilter::default(),
    };
    if let Some(seed_path) = &source.schema {
        metadata.set_schema(Arc::new(SchemaSnapshot::load(seed_path, &filter)?));
    }
    Ok(Arc::new(metadata))
}

fn build_replicator_config(config: &Config, source: &SourceConfig) -> Result<ReplicatorConfig> {
    let reader = &source.reader;
    let batch_mode = reader.kind == "batch";
    let online_logs: Vec<RedoLog> = reader
        .online_redo
        .iter()
        .map(|log| {
            RedoThread::new(log.thread)
                .map(|thread| RedoLog::new(thread, log.group, log.path.clone()))
                .ok_or_else(|| RedowireError::BadConfig {
                    detail: format!("online-redo group {} has thread 0", log.group),
                })
        })
        .collect::<Result<_>>()?;

    let checksum_params = DbParams {
        db_block_checksum: reader.db_block_checksum.clone(),
        disable_checks: DisableChecks(reader.disable_checks),
        ..DbParams::default()
    };
    Ok(ReplicatorConfig {
        reader: ReaderConfig {
            capacity_bytes: config.memory.read_buffer_mb as usize * 1024 * 1024,
            verify_checksums: checksum_params.verify_block_checksums(),
            tail_poll_us: reader
                .redo_read_sleep_us
                .unwrap_or(PollTimings::default().redo_read_sleep_us),
        },
        arch_only: batch_mode || online_logs.is_empty(),
        batch_mode,
        batch_paths: reader.redo_log.iter().map(PathBuf::from).collect(),
        online_logs,
        path_mapping: PathMapping::new(source.path_mapping_pairs()?),
        max_pending_transactions: reader.max_pending_transactions.unwrap_or(500),
        flush_options: redowire_builder::flush::FlushOptions::default(),
        boot_failsafe: reader.boot_failsafe,
        schemaless: source.schemaless(),
        confirmed_scn: None,
    })
}

fn run_source(
    config: &Config,
    source: &SourceConfig,
    target: Option<&TargetConfig>,
    cx: Arc<Cx>,
) -> Result<()> {
    info!(alias = %source.alias, database = %source.name, "starting source");

    let metadata = build_metadata(config, source)?;
    let mut replicator_config = build_replicator_config(config, source)?;
    let txn = TransactionBuffer::new(MemoryLimits {
        min_mb: config.memory.min_mb,
        max_mb: config.memory.max_mb,
    });
    let metrics = Metrics::new();

    let Some(target) = target else {
        warn!(alias = %source.alias, "source has no target, discarding its stream");
        let (mut builder, receiver) = QueueBuilder::new(default_drop_queue());
        let drain = std::thread::spawn(move || for _ in receiver.iter() {});
        let mut replicator = Replicator::new(
            cx,
            replicator_config,
            metadata,
            txn,
            &mut builder,
            metrics,
        );
        let result = replicator.run();
        drop(replicator);
        drop(builder);
        let _ = drain.join();
        return result;
    };

    let output = target
        .writer
        .output
        .clone()
        .ok_or_else(|| RedowireError::BadConfig {
            detail: format!("file writer of target '{}' has no output", target.alias),
        })?;
    if let Some(format) = &source.format {
        tracing::debug!(
            kind = %format.kind,
            scn = format.scn,
            timestamp = format.timestamp,
            xid = format.xid,
            "builder format options"
        );
    }
    let format = JsonFormat {
        db_timezone: metadata.params.db_timezone,
        numeric_scn: source.format.as_ref().map_or(true, |f| f.scn != 0),
    };

    let (mut builder, receiver) = QueueBuilder::new(target.writer.queue_size);
    let writer = FileWriter::spawn(
        PathBuf::from(&output),
        target.writer.append != 0,
        format,
        receiver,
    )?;
    replicator_config.confirmed_scn = Some(Arc::clone(&writer.confirmed));

    let mut replicator = Replicator::new(
        cx,
        replicator_config,
        metadata,
        txn,
        &mut builder,
        Arc::clone(&metrics),
    );
    let result = replicator.run();
    let snapshot = replicator.metrics_snapshot();
    drop(replicator);
    drop(builder);
    let confirmed = Arc::clone(&writer.confirmed);
    writer.join();
    info!(
        commits = snapshot.transactions_commit_out,
        rollbacks = snapshot.transactions_rollback_out,
        confirmed_scn = %confirmed.get(),
        "source finished"
    );
    result
}

fn default_drop_queue() -> usize {
    1024
}
