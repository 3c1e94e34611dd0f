use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{Duration, sleep};
use tracing::{error, info, warn};

use shared::breaker::{BreakerBoard, BreakerSettings};
use shared::config::ProcessorConfig;
use shared::guardian::GuardianThresholds;
use shared::limiter::RateLimiter;
use shared::prompts;
use shared::providers::ProviderRegistry;
use shared::providers::adapter::{ProviderAdapter, ProviderCaller};
use shared::repos::Store;
use shared::telemetry::Telemetry;
use shared::tier::Tier;

use crate::runs::RunRegistry;
use crate::scheduler::LaunchError;

mod http;
mod orchestrator;
mod retry;
mod runs;
mod scheduler;

const EXIT_FATAL: i32 = 1;
const EXIT_GUARDIAN_BLOCK: i32 = 2;
const EXIT_CONFIG: i32 = 3;

/// Explicit dependency graph for the whole engine, built once at startup and
/// threaded through workers. The breaker and limiter know nothing about the
/// orchestrator; the orchestrator composes them.
pub(crate) struct Engine {
    pub(crate) config: ProcessorConfig,
    pub(crate) store: Store,
    pub(crate) registry: ProviderRegistry,
    pub(crate) caller: Arc<dyn ProviderCaller>,
    pub(crate) limiter: RateLimiter,
    pub(crate) breakers: BreakerBoard,
    pub(crate) telemetry: Telemetry,
    pub(crate) runs: RunRegistry,
    pub(crate) guardian_thresholds: GuardianThresholds,
}

enum Mode {
    Serve,
    Once { tier: Tier, limit: Option<i64> },
}

fn parse_mode(args: &[String]) -> Result<Mode, String> {
    match args {
        [] => Ok(Mode::Serve),
        [flag, rest @ ..] if flag == "--once" => match rest {
            [tier] => Ok(Mode::Once {
                tier: parse_tier(tier)?,
                limit: None,
            }),
            [tier, limit] => Ok(Mode::Once {
                tier: parse_tier(tier)?,
                limit: Some(
                    limit
                        .parse::<i64>()
                        .map_err(|_| format!("invalid limit: {limit}"))?,
                ),
            }),
            _ => Err("usage: processor [--once <tier> [limit]]".to_string()),
        },
        _ => Err("usage: processor [--once <tier> [limit]]".to_string()),
    }
}

fn parse_tier(value: &str) -> Result<Tier, String> {
    Tier::parse(value).ok_or_else(|| format!("unknown tier: {value}"))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "processor=debug,shared=debug".to_string()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = match parse_mode(&args) {
        Ok(mode) => mode,
        Err(message) => {
            error!("{message}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let config = match ProcessorConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("failed to read processor config: {err}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let store = match Store::connect(&config.database_url, config.database_max_connections).await {
        Ok(store) => store,
        Err(err) => {
            error!("failed to connect to postgres: {err}");
            std::process::exit(EXIT_FATAL);
        }
    };
    if let Err(err) = store.run_migrations().await {
        error!("failed to run migrations: {err}");
        std::process::exit(EXIT_FATAL);
    }
    if let Err(err) = store.seed_prompt_templates(prompts::active_templates()).await {
        error!("failed to seed prompt templates: {err}");
        std::process::exit(EXIT_FATAL);
    }

    let registry = ProviderRegistry::from_env();
    let enabled = registry.list_enabled();
    if enabled.is_empty() {
        error!("no provider API keys configured; refusing to start");
        std::process::exit(EXIT_CONFIG);
    }
    info!(
        providers = enabled.len(),
        source = %config.source,
        shadow_mode = config.shadow_mode,
        "processor starting"
    );

    let caller: Arc<dyn ProviderCaller> = match ProviderAdapter::new(config.per_call_timeout_ms) {
        Ok(adapter) => Arc::new(adapter),
        Err(err) => {
            error!("{err}");
            std::process::exit(EXIT_FATAL);
        }
    };

    let limiter = RateLimiter::for_registry(&registry);
    let breakers = BreakerBoard::new(BreakerSettings {
        failure_threshold: config.circuit_failure_threshold,
        base_cooldown: Duration::from_millis(config.circuit_cooldown_ms),
        ..BreakerSettings::default()
    });

    let engine = Arc::new(Engine {
        config,
        store,
        registry,
        caller,
        limiter,
        breakers,
        telemetry: Telemetry::new(),
        runs: RunRegistry::new(),
        guardian_thresholds: GuardianThresholds::default(),
    });

    match mode {
        Mode::Once { tier, limit } => {
            let code = run_once(engine, tier, limit).await;
            std::process::exit(code);
        }
        Mode::Serve => serve(engine).await,
    }
}

async fn run_once(engine: Arc<Engine>, tier: Tier, limit: Option<i64>) -> i32 {
    match scheduler::launch_run(engine, tier, limit, true).await {
        Ok(started) => match started.handle.await {
            Ok(summary) if summary.outcome == "failed" => EXIT_FATAL,
            Ok(_) => 0,
            Err(err) => {
                error!("run task aborted: {err}");
                EXIT_FATAL
            }
        },
        Err(LaunchError::GuardianBlocked(_)) => EXIT_GUARDIAN_BLOCK,
        Err(err) => {
            error!("run failed to start: {err}");
            EXIT_FATAL
        }
    }
}

async fn serve(engine: Arc<Engine>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if engine.config.schedule_enabled {
        tokio::spawn(scheduler::scheduler_loop(
            engine.clone(),
            shutdown_rx.clone(),
        ));
    } else {
        warn!("scheduler disabled; runs start only via the trigger endpoint");
    }
    tokio::spawn(scheduler::sweeper_loop(engine.clone(), shutdown_rx.clone()));

    let listener = match tokio::net::TcpListener::bind(&engine.config.bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(bind_addr = %engine.config.bind_addr, "failed to bind control plane: {err}");
            std::process::exit(EXIT_FATAL);
        }
    };
    info!(bind_addr = %engine.config.bind_addr, "control plane listening");

    let app = http::build_router(engine.clone());
    let server = tokio::spawn({
        let mut shutdown = shutdown_rx.clone();
        async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await;
            if let Err(err) = result {
                error!("control plane server error: {err}");
            }
        }
    });

    wait_for_signal().await;
    info!("shutdown signal received; stopping claims and draining in-flight domains");

    let _ = shutdown_tx.send(true);
    engine.runs.cancel_all();

    // In-flight tensors finish within the per-domain wall cap; anything
    // slower loses its lease to the sweeper on the next start.
    let deadline =
        Duration::from_millis(engine.config.per_domain_timeout_ms) + Duration::from_secs(30);
    let drain_started = tokio::time::Instant::now();
    while engine.runs.active_count() > 0 {
        if drain_started.elapsed() > deadline {
            warn!(
                active_runs = engine.runs.active_count(),
                "drain deadline reached, exiting with runs still active"
            );
            break;
        }
        sleep(Duration::from_millis(500)).await;
    }

    let _ = server.await;
    info!("processor stopped");
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(err) => {
                error!("failed to install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
