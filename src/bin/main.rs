use clap::{Parser, Subcommand};
use financial_agent_apo::{
    apo::dualphase::{DualPhaseOptimizer, DualPhaseOptions, DualPhaseRound, InitializationOptions},
    apo::spo::{SpoOptimizer, SpoOptions, SpoRound},
    config::{load_options, AppConfig},
    context::{CancelToken, RunContext, StreamChunk, StreamHandler},
    generation::{GeminiClient, Generator},
    report, run_rounds, PromptOptimizer, Result, RoundOutcome,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Pairs generated from a seed prompt read on stdin
const STDIN_TRAINING_PAIRS: usize = 3;

#[derive(Parser)]
#[command(name = "apo")]
#[command(about = "Automatic prompt optimization for the financial agent")]
struct Cli {
    /// Echo model traffic to stdout
    #[arg(long, global = true)]
    stream: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Dual-Phase Accelerated Prompt Optimization (https://arxiv.org/abs/2406.13443)
    DualPhase {
        /// JSON options file; without it the seed prompt is read from stdin
        #[arg(long)]
        opts: Option<PathBuf>,

        #[arg(long, default_value = "10")]
        rounds: usize,

        /// Where to write the final prompt checkpoint
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },
    /// Self-Supervised Prompt Optimization (https://arxiv.org/abs/2502.06855)
    Spo {
        #[arg(long)]
        opts: PathBuf,

        #[arg(long, default_value = "10")]
        rounds: usize,
    },
}

#[tokio::main]
async fn main() -> std::result::Result<ExitCode, Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = AppConfig::from_env()?;
    info!(model = %config.model, "APO starting");
    let generator: Arc<dyn Generator> = Arc::new(GeminiClient::from_config(&config)?);

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, canceling the current round");
                cancel.cancel();
            }
        });
    }

    let mut ctx = RunContext::new()
        .with_model(config.model.clone())
        .with_cancel_token(cancel);
    if cli.stream {
        let handler: StreamHandler = Arc::new(|chunk: &StreamChunk| {
            print!("{}", report::stream_chunk(chunk));
        });
        ctx = ctx.with_stream(handler);
    }

    let result = match cli.command {
        Command::DualPhase {
            opts,
            rounds,
            checkpoint,
        } => run_dual_phase(generator, &ctx, opts, rounds, checkpoint).await,
        Command::Spo { opts, rounds } => run_spo(generator, &ctx, opts, rounds).await,
    };

    Ok(exit_code(result))
}

/// The error is reported here only, not again by the runtime
fn exit_code(result: Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Optimization failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn read_seed_prompt() -> Result<DualPhaseOptions> {
    eprintln!("Prompt (end with Ctrl-D):");
    let mut previous_p0 = String::new();
    tokio::io::stdin().read_to_string(&mut previous_p0).await?;
    Ok(seed_options(&previous_p0))
}

/// Options for a run seeded only by an earlier prompt draft
fn seed_options(previous_p0: &str) -> DualPhaseOptions {
    DualPhaseOptions {
        initialization: InitializationOptions {
            previous_p0: previous_p0.trim().to_string(),
            generate_training_data_pairs: STDIN_TRAINING_PAIRS,
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn run_dual_phase(
    generator: Arc<dyn Generator>,
    ctx: &RunContext,
    opts: Option<PathBuf>,
    rounds: usize,
    checkpoint: Option<PathBuf>,
) -> Result<()> {
    let opts = match opts {
        Some(path) => load_options::<DualPhaseOptions>(path)?,
        None => read_seed_prompt().await?,
    };

    let mut optimizer = DualPhaseOptimizer::new(generator, opts);

    println!("================= Initialization =================");
    let snapshot = optimizer.initialize(ctx).await?;
    print!("{}", report::dual_phase_prompt("P0", snapshot.accuracy, &snapshot.prompt));

    let mut accepted = 0;
    let result = run_rounds(&mut optimizer, ctx, rounds, |i, round: &DualPhaseRound| {
        if round.outcome == RoundOutcome::Accepted {
            accepted += 1;
        }
        print!("{}", report::dual_phase_round(i + 1, accepted, round));
    })
    .await;

    // The last accepted prompt is kept even when a round fails
    let raw = serde_json::to_string_pretty(optimizer.current_prompt())?;
    println!("Current prompt:\n{}", raw);
    if let Some(path) = checkpoint {
        std::fs::write(&path, &raw)?;
        info!(path = %path.display(), "Checkpoint written");
    }

    result.map(|_| ())
}

async fn run_spo(
    generator: Arc<dyn Generator>,
    ctx: &RunContext,
    opts: PathBuf,
    rounds: usize,
) -> Result<()> {
    let opts: SpoOptions = load_options(opts)?;
    let mut optimizer = SpoOptimizer::new(generator, opts);

    let snapshot = optimizer.initialize(ctx).await?;
    print!("{}", report::spo_initial(&snapshot));

    let result = run_rounds(&mut optimizer, ctx, rounds, |_, round: &SpoRound| {
        print!("{}", report::spo_round(round));
    })
    .await;

    print!(
        "{}",
        report::spo_prompt(optimizer.prompt_index(), Some("Final"), optimizer.current_prompt())
    );

    result.map(|_| ())
}
