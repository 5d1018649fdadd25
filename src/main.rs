use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use config_optimizer::report::{result_payload, write_history_file};
use config_optimizer::{
    ChainedRun, Configuration, HttpOracle, ParameterSpace, RateLimitedOracle, ResultCache, RunSettings,
    SqliteStore, StopFlag,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Black-box configuration optimizer for a rate-limited backtest API")]
struct Args {
    /// Backtest endpoint that scores a configuration.
    #[arg(long, env = "OPTIMIZER_ENDPOINT")]
    endpoint: String,
    #[arg(long, env = "OPTIMIZER_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    /// TOML run settings; anything omitted keeps its default.
    #[arg(long)]
    settings: Option<PathBuf>,
    /// TOML parameter space; the built-in token-screening space otherwise.
    #[arg(long)]
    space: Option<PathBuf>,
    /// JSON configuration to start from instead of the conservative default.
    #[arg(long)]
    seed_config: Option<PathBuf>,
    #[arg(long)]
    runs: Option<usize>,
    #[arg(long)]
    runtime_secs: Option<u64>,
    #[arg(long)]
    target: Option<f64>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
    #[arg(long, default_value = "optimized_config.json")]
    out: PathBuf,
    /// Optional CSV export of every evaluated candidate.
    #[arg(long)]
    history: Option<PathBuf>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "config_optimizer=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_settings(args: &Args) -> Result<RunSettings> {
    let mut settings = match &args.settings {
        Some(path) => RunSettings::load(path).with_context(|| format!("failed to load {}", path.display()))?,
        None => RunSettings::default(),
    };
    if let Some(runs) = args.runs {
        settings.chain.runs = runs;
    }
    if let Some(secs) = args.runtime_secs {
        settings.runtime_secs = secs;
    }
    if let Some(target) = args.target {
        settings.target_score = Some(target);
    }
    if let Some(seed) = args.seed {
        settings.seed = seed;
    }
    settings.validate()?;
    Ok(settings)
}

fn load_space(path: Option<&Path>) -> Result<ParameterSpace> {
    let Some(path) = path else {
        return Ok(ParameterSpace::default_space());
    };
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(ParameterSpace::from_toml_str(&raw)?)
}

fn load_seed(path: Option<&Path>) -> Result<Option<Configuration>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("{} is not valid JSON", path.display()))?;
    Ok(Some(Configuration::from_value(&value)?))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();
    let args = Args::parse();
    if args.timeout_secs == 0 {
        bail!("--timeout-secs must be >= 1");
    }

    let settings = load_settings(&args)?;
    let space = load_space(args.space.as_deref())?;
    let seed = load_seed(args.seed_config.as_deref())?;
    if let Some(cfg) = &seed {
        if let Err(v) = space.validate(cfg) {
            bail!("seed configuration is invalid: {v}");
        }
    }

    let store = match &settings.cache.path {
        Some(path) => Some(SqliteStore::open(path).with_context(|| format!("failed to open {}", path.display()))?),
        None => None,
    };
    let mut cache = match &store {
        Some(s) => ResultCache::restore(
            s,
            settings.cache.capacity,
            chrono::Duration::hours(settings.cache.max_age_hours),
        ),
        None => ResultCache::new(settings.cache.capacity),
    };

    let backend = HttpOracle::new(&args.endpoint, args.api_key.clone(), Duration::from_secs(args.timeout_secs))?;
    let mut oracle = RateLimitedOracle::new(Arc::new(backend), settings.rate_limit.clone());

    let stop = StopFlag::new();
    let flag = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current candidate");
            flag.stop();
        }
    });

    info!(
        endpoint = %args.endpoint,
        parameters = space.rules().len(),
        runs = settings.chain.runs,
        runtime_secs = settings.runtime_secs,
        mode = ?settings.scoring.mode,
        min_tokens = settings.min_tokens(),
        "starting optimization"
    );

    let mut chain = ChainedRun::new(&space, &settings, &mut cache, &mut oracle, stop);
    if let Some(s) = &store {
        chain = chain.with_store(s);
    }
    let report = chain.execute(seed).await;

    let payload = result_payload(&report, &settings, cache.stats(), oracle.stats());
    fs::write(&args.out, serde_json::to_string_pretty(&payload)?)
        .with_context(|| format!("failed to write {}", args.out.display()))?;
    info!(path = %args.out.display(), "saved result");

    if let Some(path) = &args.history {
        write_history_file(&report, path).with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), "saved test history");
    }

    let stats = cache.stats();
    match &report.best {
        Some(best) => info!(
            score = format!("{:.2}", best.score),
            source = %best.source,
            validated = best.validated,
            tests = report.total_tests(),
            cache_hit_rate = format!("{:.1}%", stats.hit_rate() * 100.0),
            "optimization finished"
        ),
        None => {
            let reasons: Vec<String> = report.failures.iter().map(|f| format!("run {}: {}", f.index, f.error)).collect();
            bail!("no run produced a usable baseline ({})", reasons.join("; "));
        }
    }
    if let Some(e) = &report.fatal {
        bail!("chain stopped early: {e}");
    }
    Ok(())
}
