#![allow(dead_code)]

use std::{ops::Deref, sync::Arc};

use chrono::{DateTime, Utc};
use interlink::{
    broker::InMemoryBroker, clock::ManualClock, config::Config, header::HeaderKey,
    message::OutboundMessage, service::Service,
};
use tempfile::TempDir;

pub struct TmpService {
    svc: Service,
    pub broker: InMemoryBroker,
    pub clock: ManualClock,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpService {
    type Target = Service;

    fn deref(&self) -> &Self::Target {
        &self.svc
    }
}

impl TmpService {
    /// Drops the service and connects a fresh one to the same database.
    pub async fn reopen(self) -> TmpService {
        let config = self.svc.config().clone();
        self.svc.db().close().await;

        TmpService {
            svc: connect(config, &self.broker, &self.clock).await,
            broker: self.broker,
            clock: self.clock,
            tmpdir: self.tmpdir,
        }
    }
}

pub fn start() -> DateTime<Utc> {
    DateTime::from_timestamp(1_735_689_600, 0).unwrap()
}

pub async fn setup() -> TmpService {
    setup_with(|_| {}).await
}

pub async fn setup_with(configure: impl FnOnce(&mut Config)) -> TmpService {
    let tmpdir = tempfile::tempdir().unwrap();

    let mut config = Config {
        db_path: Some(
            tmpdir
                .path()
                .join("interlink.db")
                .to_string_lossy()
                .to_string(),
        ),
        ..Config::default()
    };
    configure(&mut config);

    let broker = InMemoryBroker::new();
    let clock = ManualClock::new(start());

    TmpService {
        svc: connect(config, &broker, &clock).await,
        broker,
        clock,
        tmpdir,
    }
}

async fn connect(config: Config, broker: &InMemoryBroker, clock: &ManualClock) -> Service {
    Service::builder()
        .config(config)
        .broker(Arc::new(broker.clone()))
        .clock(Arc::new(clock.clone()))
        .connect()
        .await
        .unwrap()
}

/// A JSON message keyed by facility, carrying a correlation id.
pub fn message(facility_id: &str, correlation_id: &str, value: serde_json::Value) -> OutboundMessage {
    OutboundMessage::json(facility_id, &value)
        .unwrap()
        .with_header(HeaderKey::CorrelationId, correlation_id.to_owned())
}
