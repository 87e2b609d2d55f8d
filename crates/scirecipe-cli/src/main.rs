mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use scirecipe_core::tasks::TaskKind;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "scirecipe",
    about = "Generate, validate and score structured lab-protocol QA records",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .scirecipe/)
    #[arg(long, global = true, env = "SCIRECIPE_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, show or check the project config
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Run the resumable generation batch over the input stream
    Generate {
        /// Input dataset (JSON array or JSON-Lines); overrides streams.input
        #[arg(long)]
        input: Option<PathBuf>,
        /// Process at most N new input records
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Re-check every record of an output stream against the schema
    Validate {
        /// JSON-Lines stream to audit
        file: PathBuf,
    },

    /// Score a predicted key block against a reference key block
    Score {
        #[arg(long)]
        predicted: PathBuf,
        #[arg(long)]
        reference: PathBuf,
    },

    /// Score model answers for an evaluation set
    Eval {
        /// Evaluation samples (JSON array or JSON-Lines)
        #[arg(long)]
        input: PathBuf,
        /// Where to write per-sample rows and the final report
        #[arg(long)]
        output: PathBuf,
        /// Ask the configured collaborator for samples without model_output
        #[arg(long)]
        generate: bool,
        /// Score a short-answer task instead: ordering, error_check or protocol_qa
        #[arg(long)]
        task: Option<TaskKind>,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Generate { .. } | Commands::Eval { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
        Commands::Generate { input, limit } => {
            cmd::generate::run(&root, input.as_deref(), limit, cli.json)
        }
        Commands::Validate { file } => cmd::validate::run(&file, cli.json),
        Commands::Score {
            predicted,
            reference,
        } => cmd::score::run(&predicted, &reference, cli.json),
        Commands::Eval {
            input,
            output,
            generate,
            task,
        } => match task {
            Some(kind) => cmd::eval::run_task(&root, kind, &input, &output, generate, cli.json),
            None => cmd::eval::run(&root, &input, &output, generate, cli.json),
        },
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
