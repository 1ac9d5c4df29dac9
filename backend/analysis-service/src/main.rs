//! Analysis Service - batch entry point
//!
//! Analyzes a list of content items and prints one JSON line per item.
//!
//! ```text
//! analysis-service [--capabilities tags,faces,scenes] [--min-confidence 0.95]
//!                  [--language de] [--metrics] [CONTENT_ID=CONTENT_REF | CONTENT_REF]...
//! ```
//!
//! Without positional items, items are read from stdin, one per line.

use analysis_cache::{CacheMetrics, DurableStore, MemoryStore, RedisStore, ResultCache};
use analysis_service::providers::google_vision::{regional_endpoint, GLOBAL_ENDPOINT};
use analysis_service::{
    AnalysisProvider, AnalysisRequest, AuthMode, BatchJob, Capability, CapabilitySet, Config,
    GoogleVisionProvider, Orchestrator, PrometheusTelemetry, ResultMerger,
};
use anyhow::{Context, Result};
use resilience::CircuitBreakerRegistry;
use std::env;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Largest serialized analysis stored in Redis
const MAX_DURABLE_VALUE_BYTES: usize = 1024 * 1024;

/// Parsed command line
#[derive(Debug)]
struct CliArgs {
    capabilities: CapabilitySet,
    min_confidence: Option<f64>,
    language_hint: Option<String>,
    dump_metrics: bool,
    items: Vec<String>,
}

impl CliArgs {
    fn parse<I: Iterator<Item = String>>(mut args: I) -> Result<Self> {
        let mut parsed = CliArgs {
            capabilities: CapabilitySet::all(),
            min_confidence: None,
            language_hint: None,
            dump_metrics: false,
            items: Vec::new(),
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--capabilities" => {
                    let value = args.next().context("--capabilities needs a value")?;
                    parsed.capabilities = value
                        .split(',')
                        .filter(|s| !s.trim().is_empty())
                        .map(|s| s.parse::<Capability>().map_err(anyhow::Error::msg))
                        .collect::<Result<CapabilitySet>>()?;
                    if parsed.capabilities.is_empty() {
                        anyhow::bail!("--capabilities must name at least one capability");
                    }
                }
                "--min-confidence" => {
                    let value = args.next().context("--min-confidence needs a value")?;
                    let value: f64 = value.parse().context("--min-confidence must be a number")?;
                    if !(0.0..=1.0).contains(&value) {
                        anyhow::bail!("--min-confidence must be within [0, 1]");
                    }
                    parsed.min_confidence = Some(value);
                }
                "--language" => {
                    parsed.language_hint = Some(args.next().context("--language needs a value")?);
                }
                "--metrics" => parsed.dump_metrics = true,
                flag if flag.starts_with("--") => anyhow::bail!("Unknown flag '{}'", flag),
                _ => parsed.items.push(arg),
            }
        }

        Ok(parsed)
    }

    fn request_for(&self, item: &str) -> AnalysisRequest {
        let (content_id, content_ref) = item.split_once('=').unwrap_or((item, item));
        let mut request = AnalysisRequest::new(content_id.trim(), content_ref.trim(), self.capabilities);
        request.options.min_confidence = self.min_confidence;
        request.options.language_hint = self.language_hint.clone();
        request
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (required for rustls 0.23+)
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();
    init_tracing();

    let args = CliArgs::parse(env::args().skip(1))?;

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        anyhow::anyhow!("Configuration error: {}", e)
    })?;

    info!(
        providers = %config.provider_order,
        timeout_ms = config.provider_timeout_ms,
        verification_threshold = config.verification_threshold,
        "Configuration loaded"
    );

    let registry = prometheus::Registry::new();
    PrometheusTelemetry::register(&registry).context("Failed to register telemetry metrics")?;
    CacheMetrics::register(&registry).context("Failed to register cache metrics")?;

    let providers = build_providers(&config)?;
    let provider_ids: Vec<String> = providers.iter().map(|p| p.id().to_string()).collect();
    let breakers = Arc::new(CircuitBreakerRegistry::with_providers(
        config.circuit_breaker_config(),
        provider_ids.iter().cloned(),
    ));

    let durable: Arc<dyn DurableStore> = match &config.redis_url {
        Some(url) => {
            let store = RedisStore::connect(url, MAX_DURABLE_VALUE_BYTES)
                .await
                .context("Failed to connect to Redis")?;
            info!("Durable cache tier: redis");
            Arc::new(store)
        }
        None => {
            info!("REDIS_URL not set, using in-memory durable tier");
            Arc::new(MemoryStore::new(
                config.cache_durable_max_entries,
                config.cache_durable_max_bytes,
            ))
        }
    };
    let cache = Arc::new(ResultCache::new(config.cache_config(), durable));

    let shutdown = CancellationToken::new();
    let sweeper = cache.spawn_sweeper(shutdown.child_token());

    let orchestrator = Arc::new(Orchestrator::new(
        providers,
        breakers,
        cache,
        Arc::new(PrometheusTelemetry::new()),
        ResultMerger::new(config.merger_config()?),
        config.orchestrator_config(),
    ));
    info!(providers = ?provider_ids, "Orchestrator ready");

    let items = if args.items.is_empty() {
        read_items_from_stdin()?
    } else {
        args.items.clone()
    };
    let requests: Vec<AnalysisRequest> = items.iter().map(|item| args.request_for(item)).collect();

    let job = BatchJob::new(orchestrator, config.batch_settings());
    let job_cancel = shutdown.child_token();
    let run = job.run(requests, job_cancel);
    tokio::pin!(run);

    let (results, stats) = tokio::select! {
        outcome = &mut run => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("Received shutdown signal, finishing in-flight items");
            shutdown.cancel();
            run.await
        }
    };

    {
        let mut out = io::stdout().lock();
        for item in &results {
            serde_json::to_writer(&mut out, item)?;
            writeln!(out)?;
        }
        out.flush()?;
    }

    info!(
        processed = stats.total_processed,
        auto_approved = stats.auto_approved,
        needs_review = stats.needs_review,
        errors = stats.error_count,
        skipped = stats.skipped,
        "Batch completed"
    );

    if args.dump_metrics {
        let encoder = prometheus::TextEncoder::new();
        let mut families = registry.gather();
        // Resilience metrics live in the default registry
        families.extend(prometheus::gather());
        let text = encoder
            .encode_to_string(&families)
            .context("Failed to encode metrics")?;
        eprintln!("{}", text);
    }

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        warn!(error = %e, "Cache sweeper task failed");
    }

    if stats.error_count > 0 {
        warn!(
            "Batch completed with {} errors out of {} items",
            stats.error_count, stats.total_processed
        );
    }

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "analysis_service=debug,info".into());

    // Logs go to stderr so stdout stays machine-readable
    if env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false) {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .init();
    }
}

/// Instantiate providers named in `PROVIDER_ORDER`.
///
/// `vision_global` uses the global Vision endpoint and `vision_<region>`
/// the regional one.
fn build_providers(config: &Config) -> Result<Vec<Arc<dyn AnalysisProvider>>> {
    let auth_mode = if config.use_adc {
        info!("Using Application Default Credentials for Vision API");
        AuthMode::Adc
    } else if !config.google_vision_api_key.is_empty() {
        info!("Using API key for Vision API");
        AuthMode::ApiKey(config.google_vision_api_key.clone())
    } else {
        info!("No API key provided, using Application Default Credentials");
        AuthMode::Adc
    };

    let mut providers: Vec<Arc<dyn AnalysisProvider>> = Vec::new();
    for id in config.provider_ids() {
        let endpoint = match id.strip_prefix("vision_") {
            Some("global") => GLOBAL_ENDPOINT.to_string(),
            Some(region) if !region.is_empty() => regional_endpoint(region),
            _ => {
                warn!(provider = %id, "Unknown provider id, skipping");
                continue;
            }
        };

        let provider = GoogleVisionProvider::new(
            id.clone(),
            endpoint,
            auth_mode.clone(),
            config.vision_settings(),
        )
        .with_context(|| format!("Failed to build provider {}", id))?;
        info!(provider = %id, endpoint = %provider.endpoint(), "Provider registered");
        providers.push(Arc::new(provider));
    }

    if providers.is_empty() {
        anyhow::bail!("PROVIDER_ORDER does not name any known provider");
    }
    Ok(providers)
}

fn read_items_from_stdin() -> Result<Vec<String>> {
    let stdin = io::stdin();
    let mut items = Vec::new();
    for line in stdin.lock().lines() {
        let line = line.context("Failed to read stdin")?;
        let line = line.trim();
        if !line.is_empty() && !line.starts_with('#') {
            items.push(line.to_string());
        }
    }
    Ok(items)
}
