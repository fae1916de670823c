//! Event types published to the message bus

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Published when a service instance registers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRegisteredEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub service_id: String,
    pub service_name: String,
    pub address: String,
    pub port: u16,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub metadata: HashMap<String, String>,
}

/// Published when a service instance deregisters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDeregisteredEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub service_id: String,
    pub service_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Published when an instance's health status transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealthChangedEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub service_id: String,
    pub service_name: String,
    pub previous_status: String,
    pub current_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check_output: Option<String>,
}

/// Message namespace shared by all mesh events.
const NAMESPACE: &str = "LatticeMesh.Common.Messaging";

/// Any event the control plane can publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DomainEvent {
    Registered(ServiceRegisteredEvent),
    Deregistered(ServiceDeregisteredEvent),
    HealthChanged(ServiceHealthChangedEvent),
}

impl DomainEvent {
    /// Short event type name, e.g. `ServiceRegisteredEvent`.
    pub fn event_name(&self) -> &'static str {
        match self {
            DomainEvent::Registered(_) => "ServiceRegisteredEvent",
            DomainEvent::Deregistered(_) => "ServiceDeregisteredEvent",
            DomainEvent::HealthChanged(_) => "ServiceHealthChangedEvent",
        }
    }

    /// Message type URN carried in the envelope.
    pub fn message_type_urn(&self) -> String {
        format!("urn:message:{}:{}", NAMESPACE, self.event_name())
    }

    /// Fanout exchange this event is published to.
    pub fn exchange_name(&self) -> String {
        format!("{}:{}", NAMESPACE, self.event_name())
    }
}
