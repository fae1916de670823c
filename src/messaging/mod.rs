//! Domain events and the message bus publisher
//!
//! Events are wrapped in a MassTransit-compatible envelope and published to
//! fanout exchanges. When no bus URL is configured, publishing degrades to a
//! logged no-op so event emission never gates a state transition.

mod events;
mod publisher;

pub use events::{
    DomainEvent, ServiceDeregisteredEvent, ServiceHealthChangedEvent, ServiceRegisteredEvent,
};
pub use publisher::{
    connect_publisher, generate_id, AmqpPublisher, CollectingPublisher, EventPublisher,
    NoopPublisher,
};
