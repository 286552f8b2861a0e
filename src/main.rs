use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use photocull::commands;
use photocull::config::ScanConfig;
use photocull::core::file_ops::FileOperator;
use photocull::core::layout;
use photocull::core::progress::{CancellationToken, ScanEvent};
use photocull::core::scanner::ScanStatus;
use photocull::core::thumbnail::ThumbnailCache;
use photocull::database::SessionStore;
use photocull::database::models::{ClusterKind, Destination, ScanPhase, Verdict};

#[derive(Parser, Debug)]
#[command(name = "photocull", version, about = "Find duplicates, score and cull a photo folder")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan a folder: fingerprint, cluster, score and suggest verdicts
    Scan {
        /// Folder to scan
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        /// TOML config file (default: `<dir>/.photocull/config.toml`)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Max perceptual hash distance for near-duplicates
        #[arg(long)]
        threshold: Option<u32>,
        /// Photos to keep per duplicate cluster
        #[arg(long)]
        keep: Option<usize>,
        /// Hours between photos that start a new event
        #[arg(long)]
        gap_hours: Option<f64>,
        /// Skip face analysis
        #[arg(long)]
        no_faces: bool,
        /// SCRFD ONNX model for face detection
        #[arg(long, value_name = "FILE")]
        face_model: Option<PathBuf>,
    },

    /// Show the session state of a folder
    Status {
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
    },

    /// List duplicate clusters with scores and verdicts
    Clusters {
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        /// Include single-photo clusters
        #[arg(long)]
        all: bool,
    },

    /// List capture-time events
    Events {
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
    },

    /// Set the verdict of one photo (keep, archive, delete, review)
    Mark {
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        /// Photo path, absolute or relative to the folder
        #[arg(long, value_name = "FILE")]
        photo: PathBuf,
        #[arg(long)]
        verdict: Verdict,
    },

    /// Move or trash every decided photo
    Apply {
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        /// Do not ask before sending photos to the trash
        #[arg(long)]
        yes: bool,
    },

    /// Undo the most recent apply
    Undo {
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
    },

    /// List apply batches
    History {
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
    },

    /// Generate review thumbnails
    Thumbs {
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        /// Remove cached thumbnails instead
        #[arg(long)]
        clear: bool,
    },

    /// Forget the session and start over on the next scan
    Reset {
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Scan {
            path,
            config,
            threshold,
            keep,
            gap_hours,
            no_faces,
            face_model,
        } => {
            let folder = resolve_folder(&path)?;
            let mut scan_config = ScanConfig::load_for_folder(&folder, config.as_deref())
                .context("Failed to load configuration")?;
            if let Some(threshold) = threshold {
                scan_config.phash_threshold = threshold;
            }
            if let Some(keep) = keep {
                scan_config.keep_per_cluster = keep;
            }
            if let Some(gap_hours) = gap_hours {
                scan_config.event_gap_hours = gap_hours;
            }
            if no_faces {
                scan_config.face_detection_enabled = false;
            }
            if face_model.is_some() {
                scan_config.face_model_path = face_model;
            }
            scan_folder(&folder, scan_config)?;
        }

        Commands::Status { path } => {
            let folder = resolve_folder(&path)?;
            let store = open_reader(&folder)?;
            let session = store
                .sessions()
                .get()?
                .ok_or_else(|| anyhow!("No scan recorded for {}", folder.display()))?;

            println!("🗂️  Session {} ({})", session.id, session.source_folder);
            println!("   status:  {}", String::from(session.status));
            println!(
                "   phase:   {}",
                session.phase.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
            );
            println!("   photos:  {}", store.photos().count()?);
            println!("   clusters: {}", store.clusters().count()?);
            for (verdict, count) in store.photos().count_by_verdict()? {
                println!("   {:<8} {}", verdict.as_str(), count);
            }
            if let Some(batch) = session.last_batch_id {
                println!("   last apply batch: {} (undoable)", batch);
            }
        }

        Commands::Clusters { path, all } => {
            let folder = resolve_folder(&path)?;
            let store = open_reader(&folder)?;
            let mut shown = 0;
            for cluster in store.clusters().all()? {
                if cluster.kind == ClusterKind::Singleton && !all {
                    continue;
                }
                shown += 1;
                println!("\n✨ Cluster {} ({})", cluster.id, String::from(cluster.kind));
                for photo in store.photos().in_cluster(cluster.id)? {
                    println!(
                        "   {:<8} {:>7.3}  {}",
                        photo.verdict.as_str(),
                        photo.quality_score,
                        photo.path
                    );
                }
            }
            if shown == 0 {
                println!("No duplicates found.");
            }
        }

        Commands::Events { path } => {
            let folder = resolve_folder(&path)?;
            let store = open_reader(&folder)?;
            let events = store.events().all()?;
            if events.is_empty() {
                println!("No dated photos.");
            }
            for event in events {
                println!(
                    "📅 Event {}: {} → {} ({} photos)",
                    event.id,
                    event.start,
                    event.end,
                    event.members.len()
                );
                for photo in store.photos().in_event(event.id)? {
                    let taken = photo
                        .capture_time
                        .map(|t| t.format("%H:%M:%S").to_string())
                        .unwrap_or_default();
                    println!("   {:<8} {}  {}", photo.verdict.as_str(), taken, photo.path);
                }
            }
        }

        Commands::Mark {
            path,
            photo,
            verdict,
        } => {
            let folder = resolve_folder(&path)?;
            let photo_path = if photo.is_absolute() {
                photo
            } else {
                folder.join(photo)
            };
            commands::set_verdict(&folder, &photo_path.to_string_lossy(), verdict)
                .map_err(anyhow::Error::msg)?;
            println!("✅ {} → {}", photo_path.display(), verdict);
        }

        Commands::Apply { path, yes } => {
            let folder = resolve_folder(&path)?;
            apply_folder(&folder, yes)?;
        }

        Commands::Undo { path } => {
            let folder = resolve_folder(&path)?;
            let report = commands::undo_last_apply(&folder).map_err(anyhow::Error::msg)?;
            println!("🔄 Undoing batch {}", report.batch_id);
            for restored in &report.restored {
                let note = if restored.relocated { " (original path was taken)" } else { "" };
                println!(
                    "   Restored {} → {}{}",
                    restored.from.display(),
                    restored.to.display(),
                    note
                );
            }
            for path in &report.not_undoable {
                eprintln!("⚠️  {} was sent to the trash; restore it from there", path);
            }
            for (path, error) in &report.failed {
                eprintln!("⚠️  Could not restore {}: {}", path, error);
            }
            println!(
                "\n✅ {} restored, {} not undoable, {} failed",
                report.restored.len(),
                report.not_undoable.len(),
                report.failed.len()
            );
        }

        Commands::History { path } => {
            let folder = resolve_folder(&path)?;
            let store = open_reader(&folder)?;
            let batches = store.apply_log().batches()?;
            if batches.is_empty() {
                println!("No apply batches.");
            }
            for batch in batches {
                println!(
                    "[{}] {}  moved: {}  trashed: {}  failed: {}{}",
                    batch.batch_id,
                    batch.applied_at,
                    batch.moved,
                    batch.trashed,
                    batch.failed,
                    if batch.undone { "  (undone)" } else { "" }
                );
                for entry in store.apply_log().entries(batch.batch_id)? {
                    let outcome = match (&entry.destination, entry.success) {
                        (_, false) => format!("FAILED: {}", entry.error.unwrap_or_default()),
                        (Destination::RecycleBin, true) => "trash".to_string(),
                        (destination, true) => destination.to_string(),
                    };
                    println!("     {:<8} {} → {}", entry.verdict.as_str(), entry.source_path, outcome);
                }
            }
        }

        Commands::Thumbs { path, clear } => {
            let folder = resolve_folder(&path)?;
            let cache = ThumbnailCache::for_folder(&folder);
            if clear {
                let removed = cache.clear().context("Failed to clear thumbnails")?;
                println!("🧹 Removed {} thumbnails", removed);
                return Ok(());
            }

            let store = open_reader(&folder)?;
            let paths: Vec<PathBuf> = store
                .photos()
                .all()?
                .into_iter()
                .filter(|p| p.applied_batch.is_none())
                .map(|p| PathBuf::from(p.path))
                .collect();

            let token = CancellationToken::new();
            install_ctrlc(&token)?;
            let spinner = spinner(&format!("Generating {} thumbnails…", paths.len()))?;
            let results = cache.generate_batch(&paths, &token);
            let failed = results.iter().filter(|(_, r)| r.is_err()).count();
            spinner.finish_with_message("Thumbnails done");
            println!(
                "✅ {} thumbnails in {} ({} failed)",
                results.len() - failed,
                cache.dir().display(),
                failed
            );
        }

        Commands::Reset { path, yes } => {
            let folder = resolve_folder(&path)?;
            if !yes
                && !Confirm::new()
                    .with_prompt(format!("Forget every scan result for {}?", folder.display()))
                    .default(false)
                    .interact()?
            {
                println!("Aborted.");
                return Ok(());
            }
            commands::reset_session(&folder).map_err(anyhow::Error::msg)?;
            println!("🧹 Session reset. The next scan starts from scratch.");
        }
    }

    Ok(())
}

fn resolve_folder(path: &Path) -> Result<PathBuf> {
    let folder = fs::canonicalize(path).with_context(|| format!("Cannot access {}", path.display()))?;
    if !folder.is_dir() {
        bail!("{} is not a directory", folder.display());
    }
    Ok(folder)
}

fn open_reader(folder: &Path) -> Result<SessionStore> {
    SessionStore::open_reader(folder)
        .with_context(|| format!("No session for {}; run `photocull scan` first", folder.display()))
}

fn install_ctrlc(token: &CancellationToken) -> Result<()> {
    let token = token.clone();
    ctrlc::set_handler(move || {
        eprintln!("\n⚠️  Cancelling, finishing the current batch…");
        token.cancel();
    })
    .context("Failed to install Ctrl-C handler")
}

fn spinner(message: &str) -> Result<ProgressBar> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    Ok(spinner)
}

fn phase_bar(phase: ScanPhase, total: usize) -> Result<ProgressBar> {
    let bar = ProgressBar::new(total as u64);
    bar.set_style(
        ProgressStyle::with_template("{prefix:>14} [{bar:40.cyan/blue}] {pos}/{len} {elapsed_precise}")?
            .progress_chars("=> "),
    );
    bar.set_prefix(phase.to_string());
    Ok(bar)
}

fn scan_folder(folder: &Path, config: ScanConfig) -> Result<()> {
    println!("▶ Scanning {}", folder.display());
    let start = Instant::now();
    let mut handle = commands::start_scan(folder, config).map_err(anyhow::Error::msg)?;
    install_ctrlc(&handle.cancellation_token())?;

    let mut current: Option<(ScanPhase, ProgressBar)> = None;
    while let Some(event) = handle.next_event_blocking() {
        let ScanEvent::Progress(progress) = event else {
            continue;
        };
        let same_phase = current.as_ref().is_some_and(|(phase, _)| *phase == progress.phase);
        if !same_phase {
            if let Some((_, bar)) = current.take() {
                bar.finish();
            }
            current = Some((progress.phase, phase_bar(progress.phase, progress.total)?));
        }
        if let Some((_, bar)) = current.as_ref() {
            bar.set_length(progress.total as u64);
            bar.set_position(progress.processed as u64);
        }
    }
    if let Some((_, bar)) = current.take() {
        bar.finish();
    }

    match handle.wait() {
        ScanStatus::Completed { summary } => {
            println!("\n✅ Scan complete in {:.2?}", start.elapsed());
            println!(
                "   {} photos ({} new, {} changed, {} gone), {} unreadable",
                summary.total_photos, summary.added, summary.changed, summary.orphaned, summary.unreadable
            );
            println!(
                "   {} clusters, {} with duplicates, {} events, {} suggestions",
                summary.clusters, summary.duplicate_clusters, summary.events, summary.suggested
            );
            Ok(())
        }
        ScanStatus::Cancelled { phase } => {
            println!("\n⚠️  Scan cancelled during {}. Run scan again to resume.", phase);
            Ok(())
        }
        ScanStatus::Failed { phase, cause } => bail!("Scan failed during {}: {}", phase, cause),
    }
}

fn apply_folder(folder: &Path, yes: bool) -> Result<()> {
    let store = SessionStore::open_existing(folder)
        .with_context(|| format!("No session for {}; run `photocull scan` first", folder.display()))?;
    let pending: Vec<_> = store
        .photos()
        .all()?
        .into_iter()
        .filter(|p| p.verdict != Verdict::Review && p.applied_batch.is_none())
        .collect();
    if pending.is_empty() {
        println!("Nothing to apply.");
        return Ok(());
    }

    let operator = FileOperator::new(folder);
    let count = |verdict: Verdict| pending.iter().filter(|p| p.verdict == verdict).count();
    println!("▶ Applying {} decisions in {}", pending.len(), folder.display());
    println!("   keep:    {} → {}", count(Verdict::Keep), layout::KEEP_FOLDER);
    for folder_name in [layout::ARCHIVE_DUPES_FOLDER, layout::ARCHIVE_LOW_QUALITY_FOLDER] {
        let archived = pending
            .iter()
            .filter(|p| operator.destination_folder(p) == Some(folder_name))
            .count();
        println!("   archive: {} → {}", archived, folder_name);
    }
    println!("   delete:  {} → trash", count(Verdict::Delete));
    drop(store);

    let deletions = count(Verdict::Delete);
    if deletions > 0
        && !yes
        && !Confirm::new()
            .with_prompt(format!("Send {} photos to the trash?", deletions))
            .default(false)
            .interact()?
    {
        println!("Aborted.");
        return Ok(());
    }

    let report = commands::apply_verdicts(folder).map_err(anyhow::Error::msg)?;
    let Some(batch_id) = report.batch_id else {
        println!("Nothing to apply.");
        return Ok(());
    };
    for entry in report.entries.iter().filter(|e| !e.success) {
        eprintln!(
            "⚠️  {} {}: {}",
            entry.verdict,
            entry.photo_path,
            entry.error.as_deref().unwrap_or("unknown error")
        );
    }
    println!(
        "\n✅ Batch {}: {} applied, {} failed",
        batch_id,
        report.succeeded(),
        report.failed()
    );
    for log_file in &report.log_files {
        println!("   log: {}", log_file.display());
    }
    println!("   Undo with `photocull undo --path {}`", folder.display());
    Ok(())
}
