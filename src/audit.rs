//! Audit trail of authentication events.
//!
//! Sinks never block and never fail the request that emits an event.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Severity stored with every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warning,
    Error,
    Debug,
    Success,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Error => "error",
            Level::Debug => "debug",
            Level::Success => "success",
        }
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub level: Level,
    pub message: String,
    pub email: Option<String>,
    pub role: Option<String>,
    pub ip: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

impl AuditEvent {
    /// Create a new [`AuditEvent`].
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            email: None,
            role: None,
            ip: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn ip(mut self, ip: Option<&str>) -> Self {
        self.ip = ip.map(str::to_owned);
        self
    }

    pub fn attribute(mut self, key: &str, value: impl ToString) -> Self {
        self.attributes.insert(key.to_owned(), value.to_string());
        self
    }
}

/// Destination of audit events.
pub trait AuditSink: Send + Sync {
    /// Hand an event over. Must return immediately.
    fn record(&self, event: AuditEvent);
}

/// Sink writing events as tracing records.
#[derive(Debug, Default, Clone)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, event: AuditEvent) {
        let attributes = serde_json::to_string(&event.attributes).unwrap_or_default();
        tracing::info!(
            target: "audit",
            severity = event.level.as_str(),
            email = event.email.as_deref(),
            role = event.role.as_deref(),
            ip = event.ip.as_deref(),
            %attributes,
            "{}",
            event.message
        );
    }
}
