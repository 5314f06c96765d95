use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use mixplan::db::models::{ImportRecord, Track};
use mixplan::db::{Database, TrackStore};
use mixplan::matcher::{EnergyCurveMatcher, MatchType};
use mixplan::planner::{PlanMode, SetPlan, SetPlanner};
use mixplan::similarity::{SimilarityResult, SimilarityScorer};

#[derive(Parser)]
#[command(name = "mixplan", version, about = "DJ set planner: harmonic and energy matching over an analyzed library")]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeName {
    PeakTime,
    WarmUp,
    OpenFormat,
}

impl From<ModeName> for PlanMode {
    fn from(m: ModeName) -> Self {
        match m {
            ModeName::PeakTime => PlanMode::PeakTime,
            ModeName::WarmUp => PlanMode::WarmUp,
            ModeName::OpenFormat => PlanMode::OpenFormat,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum MatchName {
    Parallel,
    Complementary,
    Continuation,
    Contrast,
}

impl From<MatchName> for MatchType {
    fn from(m: MatchName) -> Self {
        match m {
            MatchName::Parallel => MatchType::Parallel,
            MatchName::Complementary => MatchType::Complementary,
            MatchName::Continuation => MatchType::Continuation,
            MatchName::Contrast => MatchType::Contrast,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Import analyzed tracks from a JSON export of the analysis pipeline
    Import {
        /// JSON file holding an array of {track, analysis, embedding} records
        file: PathBuf,
    },

    /// List or register music library locations
    Locations {
        #[command(subcommand)]
        action: Option<LocationAction>,
    },

    /// Compute and cache similarity for every pair of analyzed tracks
    Similarity {
        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,
    },

    /// Find tracks that mix well with a given track
    Similar {
        /// Track id
        id: i64,

        /// Number of results (defaults to config similar.limit)
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Ignore pairs cached by `mixplan similarity` and score live
        #[arg(long)]
        rescore: bool,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Order tracks into a DJ set
    Plan {
        /// Track ids to order (all analyzed tracks if omitted)
        ids: Vec<i64>,

        /// Ordering strategy (defaults to config planner.mode)
        #[arg(short, long, value_enum)]
        mode: Option<ModeName>,

        /// Track id to open the set with
        #[arg(long)]
        start: Option<i64>,

        /// Track id to close the set with
        #[arg(long)]
        end: Option<i64>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Find tracks whose energy curve fits a given track's
    Curves {
        /// Track id
        id: i64,

        /// Only show this match type (falls back to all if none match)
        #[arg(long, value_enum)]
        prefer: Option<MatchName>,

        /// Number of results
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show library statistics
    Stats,
}

#[derive(Subcommand)]
enum LocationAction {
    /// Register a music directory
    Add { path: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = mixplan::config::AppConfig::load();

    // Resolve database path: CLI > config > XDG default
    let db_path = cli
        .db_path
        .or(config.db_path.clone())
        .unwrap_or_else(mixplan::config::default_db_path);
    log::info!("Database: {}", db_path.display());

    let db = Database::open(&db_path).context("Failed to open database")?;

    for dir in &config.music_dirs {
        if db.add_music_location(dir).context("Failed to register music dir")? {
            log::info!("Registered music location {}", dir.display());
        }
    }

    let scorer = SimilarityScorer::new(config.similarity);

    match cli.command {
        Commands::Import { file } => {
            let contents = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let records: Vec<ImportRecord> = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", file.display()))?;

            let pb = ProgressBar::new(records.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} tracks ({eta} remaining)")
                    .unwrap()
                    .progress_chars("=>-"),
            );

            let (mut imported, mut analyses, mut failed) = (0usize, 0usize, 0usize);
            for record in &records {
                match db.import_record(record) {
                    Ok(_) => {
                        imported += 1;
                        if record.analysis.is_some() {
                            analyses += 1;
                        }
                    }
                    Err(e) => {
                        log::warn!("Failed to import {}: {e}", record.track.file_path);
                        failed += 1;
                    }
                }
                pb.inc(1);
            }
            pb.finish_and_clear();

            println!(
                "Import complete: {} tracks, {} analyses, {} failed",
                imported, analyses, failed
            );
        }

        Commands::Locations { action } => {
            if let Some(LocationAction::Add { path }) = action {
                if db.add_music_location(&path).context("Failed to add location")? {
                    println!("Added {}", path.display());
                } else {
                    println!("{} is already registered", path.display());
                }
                return Ok(());
            }

            let locations = db.fetch_music_locations().context("Query failed")?;
            if locations.is_empty() {
                println!("No music locations. Add one with `mixplan locations add <path>`.");
            }
            for loc in &locations {
                println!("{}", loc.display());
            }
        }

        Commands::Similarity { jobs } => {
            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            // The CLI never cancels; the flag is for library callers.
            let result = mixplan::similarity::compute_similarity(
                &db,
                &scorer,
                workers,
                &AtomicBool::new(false),
            )
            .context("Similarity computation failed")?;
            println!(
                "Similarity complete: {} tracks processed, {} pairs stored",
                result.tracks_processed, result.pairs_stored
            );
        }

        Commands::Similar { id, limit, rescore, json } => {
            let Some(target) = db.fetch_track(id).context("Query failed")? else {
                println!("No track with id {id}.");
                return Ok(());
            };
            if target.analysis.is_none() {
                println!("Track {id} has no analysis. Import one first.");
                return Ok(());
            }

            let candidates = db.fetch_analyzed_tracks().context("Query failed")?;
            let ids: Vec<i64> = candidates.iter().map(|t| t.id).collect();
            let embeddings = db.fetch_embeddings(&ids).context("Query failed")?;
            let limit = limit.unwrap_or(config.similar.limit);
            let results = if rescore {
                scorer.find_similar(&target, &candidates, &embeddings, limit)
            } else {
                mixplan::similarity::find_similar_cached(
                    &db,
                    &scorer,
                    &target,
                    &candidates,
                    &embeddings,
                    limit,
                )
                .context("Similarity lookup failed")?
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
                return Ok(());
            }
            if results.is_empty() {
                println!("No other analyzed tracks.");
                return Ok(());
            }

            println!("Tracks that mix with \"{}\":", target.display_name());
            println!();
            print_similar_table(target.id, &results, &candidates);
        }

        Commands::Plan { ids, mode, start, end, json } => {
            let tracks = if ids.is_empty() {
                db.fetch_analyzed_tracks().context("Query failed")?
            } else {
                db.fetch_tracks(&ids).context("Query failed")?
            };
            let track_ids: Vec<i64> = tracks.iter().map(|t| t.id).collect();
            let embeddings = db.fetch_embeddings(&track_ids).context("Query failed")?;

            let mode = mode.map(PlanMode::from).unwrap_or(config.planner.mode);
            let plan = SetPlanner::new(scorer).optimize_set(&tracks, &embeddings, mode, start, end);

            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
                return Ok(());
            }
            if plan.tracks.is_empty() {
                println!("No tracks to plan.");
                return Ok(());
            }

            println!("{} set, {} tracks:", mode.as_str(), plan.tracks.len());
            println!();
            print_plan(&plan);
        }

        Commands::Curves { id, prefer, limit, json } => {
            let Some(analysis) = db.fetch_analysis(id).context("Query failed")? else {
                println!("Track {id} has no analysis.");
                return Ok(());
            };
            if analysis.waveform_preview.is_empty() {
                println!("Track {id} has no waveform preview.");
                return Ok(());
            }

            let candidates: Vec<(i64, Vec<f64>)> = db
                .fetch_analyzed_tracks()
                .context("Query failed")?
                .into_iter()
                .filter(|t| t.id != id)
                .filter_map(|t| {
                    let preview = t.analysis?.waveform_preview;
                    (!preview.is_empty()).then_some((t.id, preview))
                })
                .collect();

            let matches = EnergyCurveMatcher::new().find_matches(
                &analysis.waveform_preview,
                &candidates,
                prefer.map(MatchType::from),
                limit,
            );

            if json {
                println!("{}", serde_json::to_string_pretty(&matches)?);
                return Ok(());
            }

            let shape = mixplan::curve::analyze_shape(&mixplan::curve::normalize(&analysis.waveform_preview));
            println!(
                "Track {}: {:?} trend, {:?} pattern, peak at {:.0}%",
                id,
                shape.trend,
                shape.pattern,
                shape.peak_position * 100.0
            );
            println!();

            if matches.is_empty() {
                println!("No other tracks with waveform previews.");
                return Ok(());
            }

            println!(
                "{:>6} {:<14} {:>6} {:>6} {:>6}  {:>6} {:>6}",
                "Id", "Match", "Score", "Corr", "Shape", "MixAt", "Fit"
            );
            println!("{}", "-".repeat(60));
            for m in &matches {
                println!(
                    "{:>6} {:<14} {:>6.3} {:>6.2} {:>6.2}  {:>5.0}% {:>6.2}",
                    m.candidate_id,
                    m.match_type.as_str(),
                    m.overall_score,
                    m.correlation,
                    m.shape_similarity,
                    m.transition.position * 100.0,
                    m.transition.score,
                );
            }
        }

        Commands::Stats => {
            let stats = db.stats().context("Failed to get stats")?;
            println!("Library Statistics");
            println!("==================");
            println!("Total tracks:     {}", stats.total_tracks);
            println!("Analyzed tracks:  {}", stats.analyzed_tracks);
            println!("With embeddings:  {}", stats.embedded_tracks);
            println!("Cached pairs:     {}", stats.cached_pairs);
            println!("Total duration:   {:.1} hours", stats.total_duration_hours);
            println!();

            if !stats.keys.is_empty() {
                println!("Keys:");
                for (key, count) in &stats.keys {
                    println!("  {:<6} {}", key, count);
                }
            }
        }
    }

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max - 3).collect();
        format!("{head}...")
    } else {
        s.to_string()
    }
}

fn print_similar_table(target_id: i64, results: &[SimilarityResult], tracks: &[Track]) {
    println!(
        "{:>6} {:<35} {:>6}  {:>4} {:>4} {:>4} {:>4}  {}",
        "Id", "Track", "Score", "Vib", "Tmp", "Key", "Eng", "Why"
    );
    println!("{}", "-".repeat(100));

    for r in results {
        let other = r.other(target_id);
        let name = tracks
            .iter()
            .find(|t| t.id == other)
            .map(|t| t.display_name())
            .unwrap_or_default();
        println!(
            "{:>6} {:<35} {:>6.3}  {:>4.0} {:>4.0} {:>4.0} {:>4.0}  {}",
            other,
            truncate(&name, 35),
            r.combined_score,
            r.embedding_similarity * 100.0,
            r.tempo_similarity * 100.0,
            r.key_similarity * 100.0,
            r.energy_similarity * 100.0,
            r.explanation,
        );
    }

    println!();
    println!("Vib=Embedding  Tmp=Tempo  Key=Camelot  Eng=Energy (sub-scores in %)");
}

fn print_plan(plan: &SetPlan) {
    for (i, track) in plan.tracks.iter().enumerate() {
        let (bpm, key, energy) = track
            .analysis
            .as_ref()
            .map(|a| (a.bpm, a.camelot_key(), a.energy_level))
            .unwrap_or((0.0, "?".to_string(), 0));
        println!(
            "{:>3}. {:<40} {:>6.1} {:>4} {:>3}",
            i + 1,
            truncate(&track.display_name(), 40),
            bpm,
            key,
            energy
        );
        if let Some(t) = plan.transitions.get(i) {
            println!("       -> {:.2}  {}", t.score, t.explanation);
        }
    }
    println!();
    println!("Set score: {:.3}", plan.score);
}
