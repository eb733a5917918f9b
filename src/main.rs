use aggro_score_lib::init_logging;
use aggro_score_lib::models::{BatchConfig, SamplingParams, DEFAULT_TEXT_COLUMN};
use aggro_score_lib::services::scoring::weights::WEIGHT_TOLERANCE;
use aggro_score_lib::services::{
    read_rows, write_results, BatchAggregator, ConfigStore, OpenAiProvider, ProviderError,
    RetryPolicy, TextAnalyzer, WeightKey, WeightSet,
};
use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "aggroScore", version, about = "Score social media posts for aggressiveness")]
struct Cli {
    /// Directory holding config.json (defaults to the platform config dir)
    #[arg(long, global = true, env = "AGGROSCORE_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Score every row of a JSON / JSON Lines table
    Score(ScoreArgs),
    /// Inspect or change the composite weights
    Weights {
        #[command(subcommand)]
        action: WeightsAction,
    },
}

#[derive(clap::Args, Debug)]
struct ScoreArgs {
    /// Input rows (.json array of objects or .jsonl)
    #[arg(long, short)]
    input: PathBuf,
    /// Where to write the scored table (.json or .jsonl)
    #[arg(long, short)]
    output: PathBuf,
    /// Column holding the post text
    #[arg(long, short, default_value = DEFAULT_TEXT_COLUMN)]
    column: String,
    /// Sampling temperature, 0.0-2.0 (defaults to the saved value)
    #[arg(long)]
    temperature: Option<f64>,
    /// Nucleus sampling top_p, 0.0-1.0 (defaults to the saved value)
    #[arg(long)]
    top_p: Option<f64>,
    /// Adjust one weight before the run, redistributing the rest (repeatable)
    #[arg(long = "weight", value_name = "KEY=VALUE", value_parser = parse_weight_override)]
    weights: Vec<(WeightKey, f64)>,
    /// Rescale the saved weights to sum to 1.0 instead of refusing to run
    #[arg(long)]
    normalize_weights: bool,
    /// Judge attempts per row
    #[arg(long, default_value_t = 3)]
    attempts: usize,
    /// Seconds between judge attempts
    #[arg(long, default_value_t = 1.0)]
    retry_delay: f64,
}

#[derive(Subcommand, Debug)]
enum WeightsAction {
    /// Print all weights and the unassigned budget
    Show,
    /// Set one weight and redistribute the others proportionally
    Set { key: WeightKey, value: f64 },
    /// Restore the default weights
    Reset,
}

fn parse_weight_override(s: &str) -> Result<(WeightKey, f64), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {:?}", s))?;
    let key: WeightKey = key.parse().map_err(|e| format!("{}", e))?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("weight for {} is not a number: {:?}", key, value))?;
    Ok((key, value))
}

fn retry_delay(seconds: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| anyhow!("--retry-delay must be a non-negative number of seconds, got {}", seconds))
}

fn open_store(config_dir: Option<PathBuf>) -> Result<ConfigStore> {
    let dir = config_dir
        .or_else(ConfigStore::default_config_dir)
        .ok_or_else(|| anyhow!("no config directory available; pass --config-dir"))?;
    Ok(ConfigStore::new(dir))
}

fn print_weights(weights: &WeightSet) {
    for (key, value) in weights.iter() {
        println!("{:<24} {:.4}", key.as_str(), value);
    }
    let remaining = weights.remaining();
    println!("{:<24} {:.4}", "remaining", remaining);
    if remaining < -WEIGHT_TOLERANCE {
        println!("weights exceed the budget; scoring is blocked until they are corrected");
    }
}

async fn run_score(store: ConfigStore, args: ScoreArgs) -> Result<()> {
    let config = store.load().context("loading configuration")?;

    let sampling = SamplingParams {
        temperature: args.temperature.unwrap_or(config.temperature),
        top_p: args.top_p.unwrap_or(config.top_p),
    };

    let mut weights = if args.normalize_weights {
        config.weights.normalized()
    } else {
        config.weights.clone()
    };
    for (key, value) in &args.weights {
        weights.set_weight(*key, *value);
    }

    let table = read_rows(&args.input).context("reading input rows")?;
    let batch_config = BatchConfig::new(args.column.clone(), sampling, weights);
    BatchAggregator::preflight(&table, &batch_config)?;

    let retry = RetryPolicy::new(args.attempts, retry_delay(args.retry_delay)?);

    let provider = match OpenAiProvider::from_config(&config) {
        Ok(p) => p,
        Err(ProviderError::MissingApiKey) => {
            bail!("OpenAI API key not set; export OPENAI_API_KEY or add apiKeys.openai to config.json")
        }
        Err(e) => return Err(e.into()),
    };
    info!(model = provider.model(), base_url = provider.base_url(), "provider.ready");

    let analyzer = TextAnalyzer::with_retry(Arc::new(provider), retry);
    let mut aggregator = BatchAggregator::new(analyzer, Arc::new(store));

    let outcome = aggregator
        .run(&table, &batch_config, |p| {
            println!("analyzing... {}/{}", p.done, p.total);
        })
        .await?;

    if let Some(e) = &outcome.persistence_error {
        eprintln!("notice: settings were not saved: {}", e);
    }

    write_results(&args.output, &outcome.table).context("writing results")?;

    println!(
        "done: {} rows scored, {} classifier fallbacks, {} judge unavailable -> {}",
        outcome.table.rows.len(),
        outcome.degraded_rows.len(),
        outcome.unavailable_rows.len(),
        args.output.display()
    );
    Ok(())
}

fn run_weights(store: ConfigStore, action: WeightsAction) -> Result<()> {
    let mut config = store.load().context("loading configuration")?;
    match action {
        WeightsAction::Show => {}
        WeightsAction::Set { key, value } => {
            config.weights.set_weight(key, value);
            store.save(&config).context("saving configuration")?;
        }
        WeightsAction::Reset => {
            config.weights = WeightSet::default();
            store.save(&config).context("saving configuration")?;
        }
    }
    print_weights(&config.weights);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let store = open_store(cli.config_dir)?;
    match cli.command {
        Command::Score(args) => run_score(store, args).await,
        Command::Weights { action } => run_weights(store, action),
    }
}
