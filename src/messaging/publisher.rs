//! Message bus publishers wrapping events in a MassTransit-compatible envelope

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lapin::{
    options::{BasicPublishOptions, ExchangeDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::messaging::DomainEvent;

const CONTENT_TYPE: &str = "application/vnd.masstransit+json";

/// Envelope wrapping every published message, matching the consumer-side
/// MassTransit wire contract.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<'a> {
    message_id: String,
    message_type: Vec<String>,
    headers: serde_json::Map<String, serde_json::Value>,
    message: &'a DomainEvent,
    sent_time: DateTime<Utc>,
    host: HostInfo,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HostInfo {
    machine_name: &'static str,
    process_name: &'static str,
    assembly: &'static str,
    assembly_version: &'static str,
}

impl HostInfo {
    fn current() -> Self {
        Self {
            machine_name: "lattice-mesh",
            process_name: "lattice-mesh",
            assembly: "lattice-mesh",
            assembly_version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Generate an ascending unique ID (unix nanoseconds).
pub fn generate_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    nanos.to_string()
}

/// Event bus abstraction so components can publish without knowing the transport.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: DomainEvent) -> Result<()>;
}

/// AMQP-backed publisher using fanout exchanges.
pub struct AmqpPublisher {
    channel: Channel,
    // Keeps the connection alive for the lifetime of the publisher.
    _connection: Connection,
}

impl AmqpPublisher {
    /// Connect to the given AMQP URL and open a channel.
    pub async fn connect(url: &str) -> Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        Ok(Self {
            channel,
            _connection: connection,
        })
    }
}

#[async_trait]
impl EventPublisher for AmqpPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        let exchange = event.exchange_name();

        let envelope = Envelope {
            message_id: generate_id(),
            message_type: vec![event.message_type_urn()],
            headers: serde_json::Map::new(),
            message: &event,
            sent_time: Utc::now(),
            host: HostInfo::current(),
        };
        let body = serde_json::to_vec(&envelope)?;

        self.channel
            .exchange_declare(
                &exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        self.channel
            .basic_publish(
                &exchange,
                "",
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default().with_content_type(CONTENT_TYPE.into()),
            )
            .await?;

        Ok(())
    }
}

/// Publisher used when no bus URL is configured: logs the event and succeeds.
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        info!(
            event_type = event.event_name(),
            exchange = %event.exchange_name(),
            "event published (no-op)"
        );
        Ok(())
    }
}

/// In-memory publisher that records events, for tests.
#[derive(Default)]
pub struct CollectingPublisher {
    events: Mutex<Vec<DomainEvent>>,
}

impl CollectingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published so far.
    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventPublisher for CollectingPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Build a publisher for the optionally-configured bus URL.
///
/// An empty or missing URL yields the no-op publisher. A configured URL that
/// cannot be reached is a startup failure.
pub async fn connect_publisher(url: Option<&str>) -> Result<Arc<dyn EventPublisher>> {
    match url {
        Some(url) if !url.is_empty() => {
            let publisher = AmqpPublisher::connect(url).await?;
            info!(url = %url, "connected to message bus");
            Ok(Arc::new(publisher))
        }
        _ => {
            warn!("message bus URL not configured, using no-op publisher");
            Ok(Arc::new(NoopPublisher))
        }
    }
}
