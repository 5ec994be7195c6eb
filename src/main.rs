use anyhow::Result;
use clap::Parser;
use ratekeeper::audit::TracingSink;
use ratekeeper::config::RootConfig;
use ratekeeper::engine::RateLimitEngine;
use ratekeeper::metrics::Metrics;
use ratekeeper::resolver::ResolveContext;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ratekeeper", about = "Embeddable rate-limiting core, demonstration driver")]
struct Cli {
    /// Path to policy config file (.toml or .json)
    #[arg(short, long, default_value = "ratekeeper.toml")]
    config: PathBuf,

    /// Limiter name to drive requests against
    #[arg(short, long, default_value = "demo")]
    limiter: String,

    /// Number of try_acquire calls to drive
    #[arg(short, long, default_value_t = 20)]
    requests: u32,

    /// Simulated caller identity, bound to #user[id] in key templates
    #[arg(long, default_value = "alice")]
    user_id: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    init_tracing();
    let metrics = Metrics::install();

    let config = RootConfig::load(&cli.config)?;
    let engine = RateLimitEngine::new(config, Arc::new(TracingSink));

    let ctx = ResolveContext {
        user: [("id".to_string(), cli.user_id.clone())].into_iter().collect(),
        ip: "127.0.0.1".to_string(),
        args: Vec::new(),
        headers: Default::default(),
    };

    for i in 0..cli.requests {
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        match engine.try_acquire(&cli.limiter, &ctx, 1, now_ms).await {
            Ok(decision) => {
                tracing::info!(
                    request = i,
                    allowed = decision.allowed,
                    remaining = decision.remaining,
                    delay_ms = decision.delay_ms,
                    "decision"
                );
                if !decision.allowed {
                    let pd = ratekeeper::problem::from_decision(
                        &decision,
                        &Default::default(),
                        now_ms,
                    );
                    println!("{}", pd.body);
                } else if decision.delay_ms > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(decision.delay_ms)).await;
                }
            }
            Err(e) => {
                tracing::error!(request = i, error = %e, "try_acquire failed");
            }
        }
    }

    engine.shutdown(std::time::Duration::from_secs(5)).await;
    println!("{}", metrics.render());
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}
