use std::sync::Arc;

use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    SqlitePool,
};

use crate::{
    broker::{Broker, SqliteBroker},
    clock::{Clock, SystemClock},
    config::Config,
    consumer::ConsumerLoop,
    dead_letter::{DeadLetterHandler, DeadLetterRecord},
    dispatch::DispatchEngine,
    error::Error,
    handler::{Handler, HandlerRegistry},
    retry::{RetryRecord, RetryScheduler, TransientFailureHandler},
};

/// The durable store plus every component wired against it.
pub struct Service {
    db: SqlitePool,
    config: Config,
    clock: Arc<dyn Clock>,
    broker: Arc<dyn Broker>,
    retry: Arc<RetryScheduler>,
    transient: Arc<TransientFailureHandler>,
    dead_letters: Arc<DeadLetterHandler>,
    dispatch: Arc<DispatchEngine>,
}

#[bon::bon]
impl Service {
    pub async fn connect() -> eyre::Result<Self> {
        Self::connect_with(Config::default()).await
    }

    pub async fn connect_with(config: Config) -> eyre::Result<Self> {
        Self::builder().config(config).connect().await
    }

    /// Opens the store, runs migrations and wires components. Without a
    /// broker, topics live in the same database.
    #[builder(start_fn = builder, finish_fn = connect)]
    pub async fn open(
        config: Config,
        broker: Option<Arc<dyn Broker>>,
        clock: Option<Arc<dyn Clock>>,
    ) -> eyre::Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(config.db_path())
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal)
            .optimize_on_close(true, None)
            .auto_vacuum(SqliteAutoVacuum::Full);

        let pool = SqlitePoolOptions::new().connect_with(opts).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock));
        let broker = broker.unwrap_or_else(|| Arc::new(SqliteBroker::new(pool.clone())));

        let dead_letters = Arc::new(DeadLetterHandler::new(
            pool.clone(),
            broker.clone(),
            clock.clone(),
            config.service_name.clone(),
        ));

        let retry = Arc::new(RetryScheduler::new(
            pool.clone(),
            broker.clone(),
            clock.clone(),
            config.claim_lease(),
        ));

        let transient = Arc::new(
            TransientFailureHandler::new(
                retry.clone(),
                dead_letters.clone(),
                clock.clone(),
                config.service_name.clone(),
                config.retry_delay(),
            )
            .with_retries_enabled(config.retry_enabled)
            .with_max_retries(config.max_retries),
        );

        let dispatch = Arc::new(DispatchEngine::new(
            pool.clone(),
            broker.clone(),
            clock.clone(),
            &config,
        ));

        tracing::info!(
            db_path = config.db_path(),
            service_name = %config.service_name,
            "service connected"
        );

        Ok(Self {
            db: pool,
            config,
            clock,
            broker,
            retry,
            transient,
            dead_letters,
            dispatch,
        })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        self.broker.clone()
    }

    pub fn retry_scheduler(&self) -> Arc<RetryScheduler> {
        self.retry.clone()
    }

    pub fn transient_handler(&self) -> Arc<TransientFailureHandler> {
        self.transient.clone()
    }

    pub fn dead_letter_handler(&self) -> Arc<DeadLetterHandler> {
        self.dead_letters.clone()
    }

    pub fn dispatch_engine(&self) -> Arc<DispatchEngine> {
        self.dispatch.clone()
    }

    /// Registers the dispatch engine for each topic it consumes.
    pub fn register_dispatch(&self, registry: &mut HandlerRegistry) -> Result<(), Error> {
        for topic in self.dispatch.topics().inbound() {
            registry.register(topic, self.dispatch.clone())?;
        }
        Ok(())
    }

    /// A consumer for `topic` in this service's group.
    pub fn consumer(&self, topic: impl Into<String>, handler: Arc<dyn Handler>) -> ConsumerLoop {
        ConsumerLoop::builder()
            .topic(topic)
            .group_id(self.config.group_id())
            .broker(self.broker.clone())
            .handler(handler)
            .transient(self.transient.clone())
            .dead_letters(self.dead_letters.clone())
            .poll_timeout(self.config.poll_timeout())
            .poll_backoff(self.config.poll_backoff())
            .build()
    }

    /// Quarantined records across services, for triage.
    pub async fn dead_letters(
        &self,
        service_name: Option<&str>,
        facility_id: Option<&str>,
    ) -> eyre::Result<Vec<DeadLetterRecord>> {
        let mut conn = self.db.acquire().await?;
        DeadLetterRecord::list(&mut conn, service_name, facility_id).await
    }

    /// Pending retries across services.
    pub async fn pending_retries(&self) -> eyre::Result<Vec<RetryRecord>> {
        let mut conn = self.db.acquire().await?;
        RetryRecord::list(&mut conn, None).await
    }
}
