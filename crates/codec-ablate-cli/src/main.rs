//! codec-ablate CLI - Encoder ablation study tool

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

mod commands;

/// Plan, run and analyse encoder tool ablation studies.
#[derive(Parser)]
#[command(name = "codec-ablate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Expand an experiment file into encode jobs
    Plan {
        /// Experiment file (YAML, or JSON by extension)
        spec: PathBuf,

        /// Write the job list as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        select: commands::JobSelection,
    },

    /// Run planned jobs against the encoder
    Run {
        /// Experiment file (YAML, or JSON by extension)
        spec: PathBuf,

        #[command(flatten)]
        select: commands::JobSelection,

        /// Maximum concurrent encoder processes (default: cores, at most 16)
        #[arg(short = 'j', long, env = "CODEC_ABLATE_MAX_PARALLEL")]
        max_parallel: Option<usize>,

        /// Per-job timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Progress report interval in seconds
        #[arg(long, default_value_t = 10)]
        progress_interval: u64,

        /// Encoder internal thread count (exported as OMP_NUM_THREADS)
        #[arg(long)]
        encoder_threads: Option<usize>,

        /// Discard bitstreams
        #[arg(long)]
        null_bitstream: bool,

        /// Encode this many frames per job instead of each sequence's count
        #[arg(long)]
        frames: Option<u32>,

        /// Skip jobs already recorded as DONE in the ledger
        #[arg(long)]
        resume: bool,
    },

    /// Rebuild a results ledger from an existing output tree
    Collect {
        /// Output directory containing group/tool/sequence/QP<n>/enc.log
        root: PathBuf,

        /// Ledger to write (default: <root>/results.csv)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Frame rate used when a sequence name has no `_NN` suffix
        #[arg(long, default_value_t = 30)]
        fps: u32,
    },

    /// Compute BD-Rate per tool and sequence from a ledger
    Bd {
        /// Results ledger CSV
        ledger: PathBuf,

        /// Experiment file supplying anchor names
        #[arg(long)]
        spec: Option<PathBuf>,

        /// Output directory for bd_summary.csv and overview.csv
        #[arg(short, long, default_value = ".")]
        out_dir: PathBuf,

        /// Reference anchor name
        #[arg(long)]
        reference: Option<String>,

        /// Minimal anchor name
        #[arg(long)]
        minimal: Option<String>,

        /// Require three shared QPs instead of reporting two-point estimates
        #[arg(long)]
        strict: bool,

        /// Compare addition tools against the reference anchor when the minimal anchor is missing
        #[arg(long)]
        fallback_to_reference: bool,
    },

    /// Rank tools from a BD summary and export flag presets
    Rank {
        /// BD summary CSV produced by `bd`
        bd_summary: PathBuf,

        /// Experiment file used to derive flags
        #[arg(long)]
        spec: PathBuf,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        out_dir: PathBuf,

        /// Ignore two-point estimates
        #[arg(long)]
        exact_only: bool,

        /// Minimum mean benefit for the High tier
        #[arg(long, default_value_t = 0.7)]
        high_mean: f64,

        /// Minimum mean benefit for the Medium tier
        #[arg(long, default_value_t = 0.4)]
        medium_mean: f64,

        /// Minimum stability for the High tier
        #[arg(long, default_value_t = 0.8)]
        high_stability: f64,

        /// Minimum stability for the Medium tier
        #[arg(long, default_value_t = 0.6)]
        medium_stability: f64,

        /// Also write a shortlisted experiment keeping this many tools per group
        #[arg(long)]
        top_k: Option<usize>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(err) = dispatch(cli.command) {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

fn dispatch(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Plan { spec, output, select } => commands::plan::run(&spec, output, &select),
        Commands::Run {
            spec,
            select,
            max_parallel,
            timeout,
            progress_interval,
            encoder_threads,
            null_bitstream,
            frames,
            resume,
        } => commands::run::run(
            &spec,
            &select,
            commands::run::RunArgs {
                max_parallel,
                timeout,
                progress_interval,
                encoder_threads,
                null_bitstream,
                frames,
                resume,
            },
        ),
        Commands::Collect { root, output, fps } => commands::collect::run(&root, output, fps),
        Commands::Bd {
            ledger,
            spec,
            out_dir,
            reference,
            minimal,
            strict,
            fallback_to_reference,
        } => commands::bd::run(
            &ledger,
            spec.as_deref(),
            &out_dir,
            commands::bd::AnchorArgs {
                reference,
                minimal,
                strict,
                fallback_to_reference,
            },
        ),
        Commands::Rank {
            bd_summary,
            spec,
            out_dir,
            exact_only,
            high_mean,
            medium_mean,
            high_stability,
            medium_stability,
            top_k,
        } => commands::rank::run(
            &bd_summary,
            &spec,
            &out_dir,
            exact_only,
            &codec_ablate::Thresholds {
                high_mean,
                medium_mean,
                high_stability,
                medium_stability,
            },
            top_k,
        ),
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
