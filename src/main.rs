use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use scrapesight::budget::{BudgetGovernor, SqliteLedger};
use scrapesight::config::{ConfigLoader, ScraperConfig};
use scrapesight::inference::{InferenceClient, OpenAiVisionModel};
use scrapesight::metrics::snapshot::MetricsSnapshot;
use scrapesight::model::{JobStatus, SiteSignature, UrlOutcome};
use scrapesight::navigation::NavigationController;
use scrapesight::navigation::chromium::ChromiumBrowser;
use scrapesight::output::ConfiguredSinks;
use scrapesight::patterns::{PatternStore, SqlitePatternStore};
use scrapesight::{ExtractionEngine, JobOrchestrator, MetricsCollector, Pipeline, db};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "scrapesight")]
#[command(version = "0.1.0")]
#[command(about = "Vision-guided scraper with cached selector patterns", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape a list of URLs as one job
    Run {
        /// Path to the configuration file (JSON/YAML/TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Tenant charged for inference
        #[arg(short, long)]
        tenant: String,

        /// User who submitted the job
        #[arg(short, long)]
        user: Option<String>,

        /// File with one URL per line
        #[arg(long)]
        urls_file: Option<PathBuf>,

        /// Target URLs
        urls: Vec<String>,

        /// Show progress bars (stderr)
        #[arg(short, long, default_value_t = true)]
        progress: bool,
    },
    /// Validate a configuration file
    Check {
        /// Path to the configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show a tenant's spend for the current period
    Budget {
        #[arg(short, long)]
        config: PathBuf,

        #[arg(short, long)]
        tenant: String,
    },
    /// Override a tenant's budget limit
    SetLimit {
        #[arg(short, long)]
        config: PathBuf,

        #[arg(short, long)]
        tenant: String,

        limit: f64,
    },
    /// List cached selector patterns
    Patterns {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Evict a cached pattern by its signature key (host|template|hash)
    Evict {
        #[arg(short, long)]
        config: PathBuf,

        signature: String,
    },
    /// Show learned, expired and evicted patterns over time
    History {
        #[arg(short, long)]
        config: PathBuf,

        /// Only this signature key (host|template|hash)
        signature: Option<String>,
    },
}

fn parse_signature(key: &str) -> anyhow::Result<SiteSignature> {
    SiteSignature::from_key(key).ok_or_else(|| anyhow::anyhow!("expected host|template|hash"))
}

async fn governor(config: &ScraperConfig) -> anyhow::Result<Arc<BudgetGovernor>> {
    let pool = db::connect(&config.database).await?;
    let ledger = Arc::new(SqliteLedger::new(pool).await?);
    Ok(Arc::new(BudgetGovernor::new(ledger, config.budget.clone())))
}

async fn pattern_store(config: &ScraperConfig) -> anyhow::Result<Arc<SqlitePatternStore>> {
    let pool = db::connect(&config.database).await?;
    Ok(Arc::new(
        SqlitePatternStore::new(pool, config.patterns.clone()).await?,
    ))
}

fn read_urls(mut urls: Vec<String>, urls_file: Option<PathBuf>) -> anyhow::Result<Vec<String>> {
    if let Some(path) = urls_file {
        let content = std::fs::read_to_string(&path)?;
        urls.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(String::from),
        );
    }
    Ok(urls)
}

fn print_status(status: &JobStatus) {
    println!("\nJob {} {}:", status.job.job_id, status.job.status);
    println!("   Records Emitted: {}", status.records_emitted);
    for (url, outcome) in &status.outcomes {
        match outcome {
            UrlOutcome::Succeeded {
                records,
                pages,
                inference_calls,
                cache_hit,
            } => println!(
                "   ✓ {} ({} records from {} page(s), {} inference calls{})",
                url,
                records,
                pages,
                inference_calls,
                if *cache_hit { ", cached" } else { "" }
            ),
            UrlOutcome::Failed { error } => println!("   ✗ {} ({})", url, error),
            UrlOutcome::BudgetBlocked => println!("   $ {} (budget exceeded)", url),
            UrlOutcome::Skipped => println!("   - {} (skipped)", url),
        }
    }
    for error in &status.errors {
        eprintln!("   error: {}", error);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        unsafe {
            std::env::set_var("RUST_LOG", "info");
        }
    }
    let cli = Cli::parse();
    let logger = env_logger::Builder::from_default_env().build();
    let multi = Arc::new(indicatif::MultiProgress::new());

    if matches!(cli.command, Commands::Run { progress: true, .. }) {
        indicatif_log_bridge::LogWrapper::new((*multi).clone(), logger).try_init()?;
    } else {
        let level = logger.filter();
        log::set_boxed_logger(Box::new(logger))?;
        log::set_max_level(level);
    }

    match cli.command {
        Commands::Run {
            config,
            tenant,
            user,
            urls_file,
            urls,
            progress,
        } => {
            log::info!("Loading config from {:?}", config);
            let config_data = ConfigLoader::load(&config)?;
            let urls = read_urls(urls, urls_file)?;
            log::info!("Loaded {} ({} urls)", config_data.name, urls.len());

            let metrics = MetricsCollector::new();
            let browser = Arc::new(ChromiumBrowser::launch(&config_data.navigation).await?);
            let model = Arc::new(OpenAiVisionModel::from_env(&config_data.inference)?);
            let store = pattern_store(&config_data).await?;

            let pipeline = Pipeline::new(
                NavigationController::new(browser, config_data.navigation.clone()),
                InferenceClient::new(
                    model,
                    governor(&config_data).await?,
                    config_data.inference.clone(),
                    config_data.extraction.clone(),
                ),
                ExtractionEngine::new(
                    store.clone(),
                    config_data.extraction.clone(),
                    &config_data.patterns,
                ),
                store,
                metrics,
            )
            .with_pagination(&config_data.pagination);
            let sinks = Arc::new(ConfiguredSinks::new(
                config_data.output.clone(),
                &config_data.extraction,
            ));
            let orchestrator = JobOrchestrator::new(pipeline, sinks, config_data.concurrency);

            let job_id = orchestrator.submit(urls, &tenant, user).await?;

            let mut progress_bar: Option<ProgressBar> = None;
            let mut _progress_task = None;
            if progress {
                let pb = multi.add(ProgressBar::new(0));
                pb.set_style(ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
                    .progress_chars("#>-"));

                let mut metrics_rx = orchestrator.watch_metrics();
                let pb_clone = pb.clone();
                progress_bar = Some(pb);
                _progress_task = Some(tokio::spawn(async move {
                    while metrics_rx.changed().await.is_ok() {
                        let snapshot: MetricsSnapshot = metrics_rx.borrow().clone();
                        pb_clone.set_length(snapshot.urls_queued);
                        pb_clone.set_position(snapshot.urls_processed);
                        pb_clone.set_message(format!(
                            "Records: {} | Cache: {:.0}% | Inference: {}",
                            snapshot.records_emitted,
                            snapshot.cache_hit_rate,
                            snapshot.inference_calls
                        ));
                    }
                }));
            }

            let status = tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Cancelling job {}...", job_id);
                    orchestrator.cancel(job_id)?;
                    orchestrator.wait(job_id).await?
                }
                status = orchestrator.wait(job_id) => status?,
            };

            if let Some(task) = _progress_task {
                task.abort();
            }
            if let Some(pb) = progress_bar {
                let final_metrics = orchestrator.get_metrics();
                pb.set_style(ProgressStyle::default_bar()
                    .template("✅ [{elapsed_precise}] [{bar:40.green/blue}] {pos}/{len} {msg}")?
                    .progress_chars("#>-"));
                pb.finish_with_message(format!(
                    "Records: {} | Cache: {:.0}% | Inference: {} - {}",
                    final_metrics.records_emitted,
                    final_metrics.cache_hit_rate,
                    final_metrics.inference_calls,
                    status.job.status
                ));
            }

            print_status(&status);
            let final_metrics = orchestrator.get_metrics();
            println!("   Duplicates Dropped: {}", final_metrics.duplicates_dropped);
            println!("   Total Time: {:.1}s", final_metrics.elapsed_seconds);
        }
        Commands::Check { config } => match ConfigLoader::load(&config) {
            Ok(cfg) => {
                println!("✅ Config is valid:");
                println!("   Name: {}", cfg.name);
                println!(
                    "   Fields: {}",
                    cfg.extraction
                        .fields
                        .iter()
                        .map(|f| f.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                println!("   Concurrency: {}", cfg.concurrency);
                println!("   Max Pages: {}", cfg.pagination.max_pages);
                println!("   Model: {}", cfg.inference.model);
            }
            Err(e) => {
                eprintln!("❌ Config error: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Budget { config, tenant } => {
            let config_data = ConfigLoader::load(&config)?;
            let governor = governor(&config_data).await?;
            let budget = governor.budget(&tenant).await?;
            println!("Tenant {}:", budget.tenant_id);
            println!(
                "   Period: {} .. {} (billing day {})",
                budget.period_start.format("%Y-%m-%d"),
                budget.period_end.format("%Y-%m-%d"),
                config_data.budget.billing_day
            );
            println!("   Consumed: {:.4} of {:.4}", budget.consumed, budget.limit);
            println!("   Remaining: {:.4}", budget.remaining());
            println!(
                "   State: {:?}",
                budget.state(config_data.budget.near_limit_ratio)
            );
        }
        Commands::SetLimit {
            config,
            tenant,
            limit,
        } => {
            if !(limit.is_finite() && limit >= 0.0) {
                anyhow::bail!("limit must be a non-negative number");
            }
            let config_data = ConfigLoader::load(&config)?;
            governor(&config_data).await?.set_limit(&tenant, limit).await?;
            println!("✅ Limit for {} set to {:.4}", tenant, limit);
        }
        Commands::Patterns { config } => {
            let config_data = ConfigLoader::load(&config)?;
            let store = pattern_store(&config_data).await?;
            for pattern in store.list().await? {
                println!(
                    "{}  confidence {:.3}  hits {}  failures {}  {}",
                    pattern.signature.key(),
                    pattern.confidence,
                    pattern.hits,
                    pattern.consecutive_failures,
                    pattern.stability()
                );
                println!("   container: {}", pattern.container);
                for (name, selector) in &pattern.fields {
                    println!("   {}: {}", name, selector);
                }
                if let Some(next_page) = &pattern.next_page {
                    println!("   next page: {}", next_page);
                }
            }
        }
        Commands::Evict { config, signature } => {
            let signature = parse_signature(&signature)?;
            let config_data = ConfigLoader::load(&config)?;
            let store = pattern_store(&config_data).await?;
            if store.evict(&signature).await? {
                println!("✅ Evicted {}", signature);
            } else {
                println!("No pattern stored for {}", signature);
            }
        }
        Commands::History { config, signature } => {
            let signature = signature.as_deref().map(parse_signature).transpose()?;
            let config_data = ConfigLoader::load(&config)?;
            let store = pattern_store(&config_data).await?;
            for entry in store.history(signature.as_ref()).await? {
                println!(
                    "{}  {:<8} {}  confidence {:.3}  {}  {}{}",
                    entry.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.event,
                    entry.signature,
                    entry.confidence,
                    entry.stability,
                    entry.container,
                    entry
                        .reason
                        .as_deref()
                        .map(|r| format!("  ({})", r))
                        .unwrap_or_default()
                );
            }
        }
    }

    Ok(())
}
