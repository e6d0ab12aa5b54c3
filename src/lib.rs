use config::Config;
use handler::HandlerRegistry;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod broker;
pub mod clock;
pub mod config;
pub mod consumer;
pub mod db;
pub mod dead_letter;
pub mod dispatch;
pub mod duration;
pub mod error;
pub mod handler;
pub mod header;
pub mod message;
pub mod retry;
pub mod service;
pub mod timer;

/// Returns a builder for the main application.
///
/// Every topic in `handlers` gets its own consumer loop. The dispatch engine's
/// topics are always served; passing a handler for one of them is an error.
#[bon::builder(finish_fn = start)]
pub async fn run(config: Option<Config>, handlers: Option<HandlerRegistry>) -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("INTERLINK_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("INTERLINK_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = match config {
        Some(config) => config,
        None => Config::load()?,
    };

    let service = service::Service::connect_with(config).await?;

    let mut registry = handlers.unwrap_or_default();
    service.register_dispatch(&mut registry)?;

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    for topic in registry.topics() {
        let Some(handler) = registry.get(&topic) else {
            continue;
        };
        let consumer = service.consumer(topic, handler);
        let cancel = cancel.clone();
        tasks.spawn(async move { consumer.run(cancel).await });
    }

    let tick = service.config().timer_tick();

    let timers = [
        timer::Timer::new("retry", service.retry_scheduler(), service.clock(), tick),
        timer::Timer::new("dispatch", service.dispatch_engine(), service.clock(), tick),
    ];

    for timer in timers {
        let cancel = cancel.clone();
        tasks.spawn(async move {
            timer.run(cancel).await;
            Ok(())
        });
    }

    let mut failed = None;

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("shutdown requested");
        }
        Some(res) = tasks.join_next() => {
            // A consumer stopped on its own. Bring everything down.
            if let Err(error) = res? {
                tracing::error!(error = %error, "consumer failed");
                failed = Some(error);
            }
        }
    }

    cancel.cancel();

    while let Some(res) = tasks.join_next().await {
        if let Err(error) = res? {
            tracing::error!(error = %error, "task failed during shutdown");
            failed.get_or_insert(error);
        }
    }

    match failed {
        Some(error) => Err(error.into()),
        None => Ok(()),
    }
}
