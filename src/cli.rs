use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use vdj_catalog::backup::{BackupManager, DEFAULT_KEEP};
use vdj_catalog::cache::ResultCache;
use vdj_catalog::checkpoint::{CheckpointStore, TaskState, TaskStatus, TaskType};
use vdj_catalog::config::{CONFIG_ENV_VAR, Config};
use vdj_catalog::document::{DocumentStore, MergeStrategy, Record};
use vdj_catalog::duplicates::DuplicateDetector;
use vdj_catalog::engine::{EngineConfig, RecordTask, TaskEngine, TaskEvent, TaskReport};
use vdj_catalog::external::ExternalTools;
use vdj_catalog::loudness::{LoudnessMeasurer, LoudnessTask};
use vdj_catalog::remap::{PathRemapper, apply_plan, detect_windows_prefixes};

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "vdj-catalog", version, about = "VirtualDJ catalog maintenance")]
pub struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct GlobalArgs {
    /// Config file (TOML)
    #[arg(long, global = true, env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,
    /// Catalog database.xml
    #[arg(long, global = true)]
    database: Option<PathBuf>,
    #[arg(long, global = true)]
    backup_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    checkpoint_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    cache_path: Option<PathBuf>,
    /// ffmpeg binary
    #[arg(long, global = true)]
    ffmpeg: Option<String>,
    /// Records per checkpointed batch
    #[arg(long, global = true)]
    batch_size: Option<usize>,
    /// Parallel workers inside a batch
    #[arg(long, global = true)]
    workers: Option<usize>,
    /// Print machine-readable JSON instead of a summary
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Catalog statistics
    Stats {
        /// Also check that local files exist
        #[arg(long)]
        check_files: bool,
    },
    /// Manage catalog backups
    #[command(subcommand)]
    Backup(BackupCommand),
    /// Merge another database.xml into the catalog
    Merge {
        other: PathBuf,
        /// Let the other catalog's values win on conflict
        #[arg(long)]
        prefer_other: bool,
        /// Report what would change without saving
        #[arg(long)]
        dry_run: bool,
    },
    /// Rewrite Windows paths using prefix mappings
    Remap {
        /// Extra mapping, FROM=TO (repeatable)
        #[arg(long = "map", value_parser = parse_mapping)]
        mappings: Vec<(String, String)>,
        /// List Windows path prefixes found in the catalog
        #[arg(long)]
        detect: bool,
        /// Save the rewritten catalog (default is a dry run)
        #[arg(long)]
        apply: bool,
        /// Remap even when the new path does not exist
        #[arg(long)]
        include_missing: bool,
    },
    /// Find duplicate records
    Duplicates {
        /// Compare file contents (slow)
        #[arg(long)]
        content: bool,
        /// Skip full-file verification of partial-hash groups
        #[arg(long)]
        no_verify: bool,
    },
    /// Measure loudness of local audio files (resumable)
    Measure {
        /// Target integrated loudness in LUFS
        #[arg(long, allow_hyphen_values = true)]
        target: Option<f64>,
        /// Write the matching Scan Volume back to the catalog
        #[arg(long)]
        normalize: bool,
        /// Max records to process
        #[arg(long)]
        limit: Option<usize>,
        /// Do not read or write the result cache
        #[arg(long)]
        no_cache: bool,
    },
    /// Inspect and resume checkpointed tasks
    #[command(subcommand)]
    Tasks(TasksCommand),
    /// Result cache maintenance
    #[command(subcommand)]
    Cache(CacheCommand),
}

#[derive(Subcommand)]
enum BackupCommand {
    Create {
        #[arg(long, default_value = "manual")]
        label: String,
    },
    List,
    /// Restore a backup over the catalog (the current file is backed up first)
    Restore { backup: PathBuf },
    Cleanup {
        #[arg(long, default_value_t = DEFAULT_KEEP)]
        keep: usize,
    },
}

#[derive(Subcommand)]
enum TasksCommand {
    List {
        /// Include finished tasks
        #[arg(long)]
        all: bool,
    },
    Resume { task_id: String },
    /// Delete finished checkpoints older than N days
    Cleanup {
        #[arg(long, default_value_t = 7)]
        max_age_days: u32,
    },
}

#[derive(Subcommand)]
enum CacheCommand {
    Stats,
    /// Drop entries whose file changed or disappeared
    Prune,
    Clear {
        #[arg(long)]
        namespace: Option<String>,
    },
}

fn parse_mapping(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((from, to)) if !from.is_empty() && !to.is_empty() => Ok((from.to_string(), to.to_string())),
        _ => Err(format!("expected FROM=TO, got '{raw}'")),
    }
}

impl GlobalArgs {
    fn resolve(&self) -> Result<Config, Box<dyn std::error::Error>> {
        let mut config = Config::load_from(self.config.as_deref())?;
        if let Some(path) = &self.database {
            config.database_path = path.clone();
        }
        if let Some(dir) = &self.backup_dir {
            config.backup_dir = dir.clone();
        }
        if let Some(dir) = &self.checkpoint_dir {
            config.checkpoint_dir = dir.clone();
        }
        if let Some(path) = &self.cache_path {
            config.cache_path = path.clone();
        }
        if let Some(path) = &self.ffmpeg {
            config.ffmpeg_path = path.clone();
        }
        if let Some(n) = self.batch_size {
            config.batch_size = n;
        }
        if let Some(n) = self.workers {
            config.workers = n;
        }
        config.validate()?;
        Ok(config)
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn run(cli: Cli) -> CliResult {
    let config = cli.global.resolve()?;
    let json = cli.global.json;
    match cli.command {
        Command::Stats { check_files } => stats(&config, check_files, json),
        Command::Backup(cmd) => backup(&config, cmd, json),
        Command::Merge {
            other,
            prefer_other,
            dry_run,
        } => merge(&config, &other, prefer_other, dry_run, json),
        Command::Remap {
            mappings,
            detect,
            apply,
            include_missing,
        } => remap(&config, mappings, detect, apply, include_missing, json),
        Command::Duplicates { content, no_verify } => duplicates(&config, content, !no_verify, json),
        Command::Measure {
            target,
            normalize,
            limit,
            no_cache,
        } => measure(&config, target, normalize, limit, no_cache, json).await,
        Command::Tasks(cmd) => tasks(&config, cmd, json).await,
        Command::Cache(cmd) => cache(&config, cmd, json),
    }
}

fn stats(config: &Config, check_files: bool, json: bool) -> CliResult {
    let store = DocumentStore::open(&config.database_path)?;
    let stats = store.stats(check_files)?;
    if json {
        return print_json(&stats);
    }
    println!("Catalog: {}", config.database_path.display());
    println!("  Total records:    {}", stats.total);
    println!("  Local files:      {}", stats.local_files);
    println!("  Windows paths:    {}", stats.windows_paths);
    for (drive, count) in &stats.windows_drives {
        println!("    {drive}:  {count}");
    }
    println!("  Streaming:        {}", stats.netsearch);
    println!("  Audio / other:    {} / {}", stats.audio_files, stats.non_audio_files);
    println!("  With energy:      {}", stats.with_energy);
    println!("  With mood:        {}", stats.with_mood);
    println!("  With cue points:  {}", stats.with_cue_points);
    println!("  With BPM:         {}", stats.with_scan_bpm);
    if let Some(missing) = stats.missing_files {
        println!("  Missing files:    {missing}");
    }
    let mut extensions: Vec<_> = stats.by_extension.iter().collect();
    extensions.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    let top: Vec<String> = extensions.iter().take(8).map(|(ext, n)| format!("{ext}={n}")).collect();
    if !top.is_empty() {
        println!("  Extensions:       {}", top.join(", "));
    }
    Ok(())
}

fn backup(config: &Config, cmd: BackupCommand, json: bool) -> CliResult {
    let manager = BackupManager::new(&config.backup_dir)?;
    match cmd {
        BackupCommand::Create { label } => {
            let path = manager.create(&config.database_path, &label)?;
            println!("{}", path.display());
        }
        BackupCommand::List => {
            let backups = manager.list()?;
            if json {
                return print_json(&backups);
            }
            if backups.is_empty() {
                eprintln!("No backups in {}", manager.dir().display());
            }
            for info in backups {
                println!(
                    "{}  {:>10}  {:<12}  {}",
                    info.modified.format("%Y-%m-%d %H:%M:%S"),
                    info.size,
                    info.label.as_deref().unwrap_or("-"),
                    info.path.display()
                );
            }
        }
        BackupCommand::Restore { backup } => {
            manager.restore(&backup, &config.database_path)?;
            eprintln!("Restored {} -> {}", backup.display(), config.database_path.display());
        }
        BackupCommand::Cleanup { keep } => {
            let removed = manager.cleanup(keep)?;
            eprintln!("Removed {removed} backup(s), kept the newest {keep}");
        }
    }
    Ok(())
}

fn merge(config: &Config, other: &std::path::Path, prefer_other: bool, dry_run: bool, json: bool) -> CliResult {
    let mut store = DocumentStore::open(&config.database_path)?;
    let incoming = DocumentStore::open(other)?;
    let strategy = if prefer_other {
        MergeStrategy::PreferOther
    } else {
        MergeStrategy::FillMissing
    };
    let stats = store.merge_from(&incoming, strategy)?;
    if json {
        print_json(&stats)?;
    } else {
        eprintln!(
            "Merge: {} added, {} updated, {} unchanged",
            stats.added, stats.updated, stats.skipped
        );
    }
    if dry_run || (stats.added == 0 && stats.updated == 0) {
        return Ok(());
    }
    let manager = BackupManager::new(&config.backup_dir)?;
    manager.guard(&config.database_path, "pre-merge", |_| store.save(None))?;
    Ok(())
}

fn remap(
    config: &Config,
    extra: Vec<(String, String)>,
    detect: bool,
    apply: bool,
    include_missing: bool,
    json: bool,
) -> CliResult {
    let mut store = DocumentStore::open(&config.database_path)?;
    let remapper = PathRemapper::new(config.path_mappings.clone().into_iter().chain(extra));
    let records: Vec<Record> = store.records()?.collect();

    if detect {
        let prefixes = detect_windows_prefixes(&records);
        if json {
            let counts: std::collections::BTreeMap<&String, usize> =
                prefixes.iter().map(|(prefix, paths)| (prefix, paths.len())).collect();
            print_json(&counts)?;
        } else {
            for (prefix, paths) in &prefixes {
                let mapped = remapper.can_remap(&paths[0]);
                println!("{prefix:<30} {:>6}  {}", paths.len(), if mapped { "mapped" } else { "unmapped" });
            }
        }
        return Ok(());
    }

    if remapper.mappings().is_empty() {
        return Err("no path mappings configured (use --map FROM=TO or path_mappings in the config)".into());
    }
    let plan = remapper.plan(&records, true);
    let found = plan.iter().filter(|entry| entry.exists).count();
    if json && !apply {
        return print_json(&plan);
    }
    eprintln!("{} remappable paths ({found} found on disk)", plan.len());
    let unmapped = remapper.unmapped_prefixes(&records);
    if !unmapped.is_empty() {
        eprintln!("Unmapped prefixes: {}", unmapped.join(", "));
    }
    if !apply {
        for entry in plan.iter().take(10) {
            eprintln!("  {} -> {}{}", entry.old_path, entry.new_path, if entry.exists { "" } else { " (missing)" });
        }
        eprintln!("Dry run. Pass --apply to save.");
        return Ok(());
    }

    let report = apply_plan(&mut store, &plan, !include_missing)?;
    if json {
        print_json(&report)?;
    }
    eprintln!(
        "Remapped {}, skipped {} missing, {} conflicts",
        report.remapped,
        report.skipped_missing,
        report.conflicts.len()
    );
    if report.remapped > 0 {
        let manager = BackupManager::new(&config.backup_dir)?;
        manager.guard(&config.database_path, "pre-remap", |_| store.save(None))?;
    }
    Ok(())
}

fn duplicates(config: &Config, content: bool, verify_full: bool, json: bool) -> CliResult {
    let store = DocumentStore::open(&config.database_path)?;
    let records: Vec<Record> = store.records()?.collect();
    let detector = DuplicateDetector {
        verify_full,
        ..DuplicateDetector::default()
    };
    let report = detector.find_all(&records, content);
    if json {
        return print_json(&report);
    }
    println!("Metadata groups: {}", report.summary.metadata_groups);
    for (key, paths) in report.by_metadata.iter().take(20) {
        println!("  {key}");
        for path in paths {
            println!("    {path}");
        }
    }
    println!("Filename groups: {}", report.summary.filename_groups);
    if content {
        println!("Exact duplicates: {}", report.summary.exact_duplicates);
        for group in report.by_content.iter().take(20) {
            println!("  ---");
            for path in group {
                println!("    {path}");
            }
        }
    }
    Ok(())
}

fn engine_config(config: &Config) -> EngineConfig {
    EngineConfig {
        batch_size: config.batch_size,
        workers: config.workers,
        ..EngineConfig::default()
    }
}

/// Stream engine events to stderr until the sender is dropped.
fn spawn_event_printer() -> (mpsc::UnboundedSender<TaskEvent>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                TaskEvent::RecordFailed { key, reason } => eprintln!("FAIL {key}: {reason}"),
                TaskEvent::Progress {
                    processed,
                    total,
                    percent,
                } => eprintln!("[{processed}/{total}] {percent:.1}%"),
                TaskEvent::StatusChanged { task_id, status } => eprintln!("{task_id}: {status}"),
                TaskEvent::RecordCompleted { .. } | TaskEvent::BatchCompleted { .. } => {}
            }
        }
    });
    (tx, handle)
}

async fn run_loudness(
    config: &Config,
    task: LoudnessTask,
    keys: Option<Vec<String>>,
    resume_id: Option<&str>,
    use_cache: bool,
    json: bool,
) -> CliResult {
    let normalize = task.task_type() == TaskType::Normalize;
    let mut store = DocumentStore::open(&config.database_path)?;
    // Normalize saves the catalog after every batch; keep a copy of the starting point.
    if normalize {
        BackupManager::new(&config.backup_dir)?.create(&config.database_path, "pre-normalize")?;
    }
    let checkpoints = CheckpointStore::open(&config.checkpoint_dir)?;
    let cache = if use_cache {
        Some(ResultCache::open(&config.cache_path)?)
    } else {
        None
    };

    let (tx, printer) = spawn_event_printer();
    let mut engine = TaskEngine::new(task, &checkpoints)
        .with_config(engine_config(config))
        .with_events(tx);
    if let Some(cache) = cache.as_ref() {
        engine = engine.with_cache(cache);
    }

    // Ctrl-C pauses at the next batch boundary; the checkpoint stays resumable.
    let control = engine.control();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, pausing after the current batch...");
            control.pause();
        }
    });

    let started = Instant::now();
    let outcome = match (keys, resume_id) {
        (_, Some(task_id)) => engine.resume(task_id, &mut store).await,
        (Some(keys), None) => engine.start(keys, &mut store).await,
        (None, None) => Err(vdj_catalog::CatalogError::ValidationFailed("nothing to run".into())),
    };
    interrupt.abort();
    drop(engine);
    let _ = printer.await;
    let report = outcome?;
    print_report(&report, started, json)
}

fn print_report(report: &TaskReport, started: Instant, json: bool) -> CliResult {
    if json {
        return print_json(report);
    }
    let elapsed = started.elapsed().as_secs();
    eprintln!(
        "\n{} {}: {} completed, {} failed, {} remaining ({} computed, {} cached this run, {}m {}s)",
        report.task_type,
        report.status,
        report.completed,
        report.failed,
        report.remaining,
        report.this_run.computed,
        report.this_run.cached,
        elapsed / 60,
        elapsed % 60
    );
    if report.status == TaskStatus::Paused {
        eprintln!("Resume with: vdj-catalog tasks resume {}", report.task_id);
    }
    Ok(())
}

async fn loudness_task(config: &Config, target: f64, normalize: bool) -> Result<LoudnessTask, Box<dyn std::error::Error>> {
    let tools = Arc::new(ExternalTools::new(config.ffmpeg_path.clone()));
    // Fail the whole command up front rather than every record.
    tools.ffmpeg().await?;
    tracing::debug!(ffmpeg = ?tools.ffmpeg_version(), "using ffmpeg");
    let measurer = LoudnessMeasurer::new(tools, target);
    Ok(if normalize {
        LoudnessTask::normalize(measurer)
    } else {
        LoudnessTask::measure(measurer)
    })
}

async fn measure(
    config: &Config,
    target: Option<f64>,
    normalize: bool,
    limit: Option<usize>,
    no_cache: bool,
    json: bool,
) -> CliResult {
    let target = target.unwrap_or(config.target_lufs);
    if !target.is_finite() || target > 0.0 {
        return Err(format!("target must be a negative LUFS value, got {target}").into());
    }
    let keys: Vec<String> = {
        let store = DocumentStore::open(&config.database_path)?;
        store
            .records()?
            .filter(|r| r.is_audio() && !r.is_windows_path() && !r.is_netsearch())
            .map(|r| r.file_path)
            .take(limit.unwrap_or(usize::MAX))
            .collect()
    };
    if keys.is_empty() {
        eprintln!("No local audio files in the catalog.");
        return Ok(());
    }
    eprintln!("Measuring {} files against {target} LUFS", keys.len());
    let task = loudness_task(config, target, normalize).await?;
    run_loudness(config, task, Some(keys), None, !no_cache, json).await
}

fn print_tasks(states: &[TaskState]) {
    if states.is_empty() {
        eprintln!("No tasks.");
    }
    for state in states {
        println!(
            "{:<45} {:<10} {:>6.1}%  {}/{}  failed {}  updated {}",
            state.task_id,
            state.status,
            state.progress_percent(),
            state.processed_count(),
            state.total_items,
            state.failed_paths.len(),
            state.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
}

async fn tasks(config: &Config, cmd: TasksCommand, json: bool) -> CliResult {
    let checkpoints = CheckpointStore::open(&config.checkpoint_dir)?;
    match cmd {
        TasksCommand::List { all } => {
            let states = if all {
                checkpoints.list()?
            } else {
                checkpoints.list_incomplete()?
            };
            if json {
                return print_json(&states);
            }
            print_tasks(&states);
            Ok(())
        }
        TasksCommand::Resume { task_id } => {
            let state = checkpoints.load(&task_id)?;
            let normalize = match state.task_type {
                TaskType::Measure => false,
                TaskType::Normalize => true,
                other => return Err(format!("this binary cannot resume {other} tasks").into()),
            };
            let target = state.config_f64("target_lufs").unwrap_or(config.target_lufs);
            let task = loudness_task(config, target, normalize).await?;
            run_loudness(config, task, None, Some(&task_id), true, json).await
        }
        TasksCommand::Cleanup { max_age_days } => {
            let removed = checkpoints.cleanup_completed(max_age_days)?;
            eprintln!("Removed {removed} finished checkpoint(s)");
            Ok(())
        }
    }
}

fn cache(config: &Config, cmd: CacheCommand, json: bool) -> CliResult {
    let cache = ResultCache::open(&config.cache_path)?;
    match cmd {
        CacheCommand::Stats => {
            let stats = cache.stats()?;
            if json {
                return print_json(&stats);
            }
            println!("{} entries, {} bytes", stats.entries, stats.db_size_bytes);
            for (namespace, count) in &stats.by_namespace {
                println!("  {namespace:<24} {count}");
            }
        }
        CacheCommand::Prune => {
            let removed = cache.invalidate_stale()?;
            eprintln!("Removed {removed} stale entr{}", if removed == 1 { "y" } else { "ies" });
        }
        CacheCommand::Clear { namespace } => {
            let removed = cache.clear(namespace.as_deref())?;
            eprintln!("Removed {removed} entries");
        }
    }
    Ok(())
}
