use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use stimset::anchor::ClipGateSynthesizer;
use stimset::config::AppConfig;
use stimset::render::{PolarityTable, RenderContext};
use stimset::selection::{Selection, SelectionRequest};
use stimset::table::dataset::ReferenceDataset;
use stimset::table::{PathResolver, ScoreTable};

#[derive(Parser)]
#[command(name = "stimset", version, about = "Listening-test stimulus selection and rendering")]
struct Cli {
    /// Config file (defaults to ~/.config/stimset/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides for the `[selection]` config section.
#[derive(clap::Args)]
struct SelectArgs {
    /// Score table CSV (overrides datasets.scores_csv)
    #[arg(long)]
    scores: Option<PathBuf>,

    /// Number of tracks to select
    #[arg(short = 't', long)]
    num_tracks: Option<usize>,

    /// Number of methods per track
    #[arg(short = 'a', long)]
    num_algos: Option<usize>,

    /// Stem being rated
    #[arg(long)]
    target: Option<String>,

    /// Only consider these methods (must match --num-algos)
    #[arg(long = "only", value_delimiter = ',')]
    only_algos: Vec<String>,

    /// Tracks to leave out
    #[arg(long = "exclude-track", value_delimiter = ',')]
    exclude_tracks: Vec<u32>,

    /// Keep per-track score outliers
    #[arg(long)]
    keep_outliers: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Select tracks and methods from a score table
    Select {
        #[command(flatten)]
        args: SelectArgs,

        /// Metric to select on (overrides selection.metric)
        #[arg(short, long)]
        metric: Option<String>,

        /// Where to write the sampled table
        #[arg(short, long, default_value = "sample.csv")]
        output: PathBuf,
    },

    /// Render stimuli from a sampled table
    Render {
        /// Sampled table written by `select` or `run`
        sample: PathBuf,

        /// Output directory
        #[arg(short, long, default_value = "stimuli")]
        out: PathBuf,

        /// Write unmixed target stimuli instead of mixes
        #[arg(long)]
        targets: bool,

        /// Stem being rated (overrides selection.target)
        #[arg(long)]
        target: Option<String>,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long)]
        jobs: Option<usize>,
    },

    /// Select once per metric (disjoint tracks), then render
    Run {
        #[command(flatten)]
        args: SelectArgs,

        /// Metrics to visit (overrides selection.metrics)
        #[arg(long, value_delimiter = ',')]
        metrics: Vec<String>,

        /// Output directory
        #[arg(short, long, default_value = "stimuli")]
        out: PathBuf,

        /// Write unmixed target stimuli instead of mixes
        #[arg(long)]
        targets: bool,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long)]
        jobs: Option<usize>,
    },

    /// Print the active window of a WAV file
    Window {
        path: PathBuf,

        /// Window length in seconds
        #[arg(short, long)]
        duration: Option<f64>,

        /// Energy percentile to match
        #[arg(short, long)]
        percentile: Option<f64>,
    },
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

    let mut config = AppConfig::load(cli.config.as_deref()).context("Failed to load config")?;

    match cli.command {
        Commands::Select {
            args,
            metric,
            output,
        } => {
            let mut request = selection_request(&config, &args);
            if let Some(metric) = metric {
                request.metric = metric;
            }
            let references = load_references(&config)?;
            let table = load_table(&config, args.scores.as_deref(), &references)?;

            let selection = stimset::selection::select(&table, &request, &references)
                .context("Selection failed")?;
            print_selection(&selection);
            selection
                .table
                .write_csv(&output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("Sample written to {}", output.display());
        }

        Commands::Render {
            sample,
            out,
            targets,
            target,
            jobs,
        } => {
            if let Some(jobs) = jobs {
                config.render.jobs = jobs;
            }
            let target = target.unwrap_or_else(|| config.selection.target.clone());
            let table = ScoreTable::from_csv_unfiltered(&sample)
                .with_context(|| format!("Failed to read {}", sample.display()))?;
            table.require_filepaths().context("Sampled table is incomplete")?;
            render(&config, &table, &target, &out, targets)?;
        }

        Commands::Run {
            args,
            metrics,
            out,
            targets,
            jobs,
        } => {
            if let Some(jobs) = jobs {
                config.render.jobs = jobs;
            }
            let request = selection_request(&config, &args);
            let metrics = if metrics.is_empty() {
                config.selection.metrics.clone()
            } else {
                metrics
            };
            let references = load_references(&config)?;
            let table = load_table(&config, args.scores.as_deref(), &references)?;

            let selection =
                stimset::selection::select_across_metrics(&table, &metrics, &request, &references)
                    .context("Selection failed")?;
            print_selection(&selection);

            let sample_path = out.join("sample.csv");
            selection
                .table
                .write_csv(&sample_path)
                .with_context(|| format!("Failed to write {}", sample_path.display()))?;
            render(&config, &selection.table, &request.target, &out, targets)?;
        }

        Commands::Window {
            path,
            duration,
            percentile,
        } => {
            let duration = duration.unwrap_or(config.render.segment_duration);
            let percentile = percentile.unwrap_or(config.render.percentile);
            let signal = stimset::audio::io::read_wav(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let window =
                stimset::audio::segment::locate_active_window(&signal, duration, percentile)
                    .context("Failed to locate active window")?;
            let sr = signal.sample_rate();
            println!(
                "{}: frames {}..{} ({:.3}s - {:.3}s of {:.3}s)",
                path.display(),
                window.start,
                window.end,
                window.start_secs(sr),
                window.end as f64 / sr as f64,
                signal.duration_secs()
            );
        }
    }

    Ok(())
}

fn selection_request(config: &AppConfig, args: &SelectArgs) -> SelectionRequest {
    let mut request = config.selection.request(config.dispersion);
    if let Some(n) = args.num_tracks {
        request.num_tracks = n;
    }
    if let Some(n) = args.num_algos {
        request.num_algos = n;
    }
    if let Some(target) = &args.target {
        request.target = target.clone();
    }
    if !args.only_algos.is_empty() {
        request.only_algos = Some(args.only_algos.clone());
    }
    request.exclude_tracks.extend(args.exclude_tracks.iter().copied());
    if args.keep_outliers {
        request.remove_outliers = false;
    }
    request
}

/// Reference stems from the YAML manifest, else from scanning the reference root.
fn load_references(config: &AppConfig) -> Result<ReferenceDataset> {
    let datasets = &config.datasets;
    let references = if let Some(manifest) = &datasets.reference_manifest {
        ReferenceDataset::from_yaml(manifest)
            .with_context(|| format!("Failed to load {}", manifest.display()))?
    } else if let Some(root) = &datasets.reference_root {
        ReferenceDataset::scan(root).with_context(|| format!("Failed to scan {}", root.display()))?
    } else {
        anyhow::bail!(
            "No reference dataset. Set datasets.reference_manifest or datasets.reference_root in config."
        );
    };
    log::info!("Reference dataset: {} stems", references.len());
    Ok(references)
}

fn load_table(
    config: &AppConfig,
    scores: Option<&Path>,
    references: &ReferenceDataset,
) -> Result<ScoreTable> {
    let path = scores
        .or(config.datasets.scores_csv.as_deref())
        .context("No score table. Pass --scores or set datasets.scores_csv in config.")?;

    let resolver = config
        .datasets
        .estimates_root
        .as_deref()
        .map(|estimates_root| PathResolver {
            dataset: references,
            estimates_root,
        });
    ScoreTable::from_csv(path, &config.selection.load_options(), resolver.as_ref())
        .with_context(|| format!("Failed to load {}", path.display()))
}

fn render(
    config: &AppConfig,
    table: &ScoreTable,
    target: &str,
    out: &Path,
    targets: bool,
) -> Result<()> {
    let polarity = PolarityTable::from_config(&config.polarity);
    let synth = ClipGateSynthesizer::default();
    let ctx = RenderContext {
        config: &config.render,
        polarity: &polarity,
        synth: &synth,
        target,
    };

    let manifest = if targets {
        stimset::render::render_targets(table, out, &ctx)
    } else {
        stimset::render::render_mixes(table, out, &ctx)
    }
    .context("Rendering failed")?;

    println!(
        "Rendered {} stimuli in {} folders under {}",
        manifest.entries.len(),
        manifest.folders().len(),
        out.display()
    );
    Ok(())
}

/// Print selected methods per track, with drift warnings.
fn print_selection(selection: &Selection) {
    println!("{:>6}  {:<8} Methods", "Track", "Metric");
    println!("{}", "-".repeat(60));
    for (track_id, methods) in selection.methods() {
        let metric = selection
            .table
            .iter()
            .find(|r| r.track_id == track_id)
            .map(|r| r.metric.as_str())
            .unwrap_or("?");
        println!("{:>6}  {:<8} {}", track_id, metric, methods.join(", "));
    }
    for warning in &selection.drift {
        println!("warning: {warning}");
    }
}
