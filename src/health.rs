//! Aggregated health report
//!
//! Components register a [`HealthProvider`] under a key. The report is a
//! JSON object with a fixed header (`api-version`, `timestamp`, `uptime`)
//! followed by one entry per provider that has something to say, and is
//! healthy only if every provider is.

use chrono::{DateTime, Local};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::amqp::supervisor::SupervisorHandle;

pub const API_VERSION: &str = "v0";
pub const RESERVED_KEYS: [&str; 3] = ["api-version", "timestamp", "uptime"];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HealthError {
    #[error("Health key '{0}' is reserved")]
    ReservedKey(String),

    #[error("Health key '{0}' is already registered")]
    DuplicateKey(String),
}

pub trait HealthProvider: Send + Sync {
    /// Optional details for the report and whether this component is healthy
    fn health(&self) -> (Option<Value>, bool);
}

#[derive(Clone)]
pub struct HealthRegistry {
    started: DateTime<Local>,
    providers: BTreeMap<String, Arc<dyn HealthProvider>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            started: Local::now(),
            providers: BTreeMap::new(),
        }
    }

    pub fn add_provider(
        &mut self,
        key: impl Into<String>,
        provider: Arc<dyn HealthProvider>,
    ) -> Result<(), HealthError> {
        let key = key.into();
        if RESERVED_KEYS.contains(&key.as_str()) {
            return Err(HealthError::ReservedKey(key));
        }
        if self.providers.contains_key(&key) {
            return Err(HealthError::DuplicateKey(key));
        }
        debug!("Registered health provider {}", key);
        self.providers.insert(key, provider);
        Ok(())
    }

    pub fn remove_provider(&mut self, key: &str) -> Option<Arc<dyn HealthProvider>> {
        self.providers.remove(key)
    }

    pub fn report(&self) -> (Value, bool) {
        let now = Local::now();
        let mut report = Map::new();
        report.insert("api-version".into(), API_VERSION.into());
        report.insert("timestamp".into(), now.to_rfc3339().into());
        report.insert(
            "uptime".into(),
            (now - self.started).num_seconds().max(0).into(),
        );

        let mut healthy = true;
        for (key, provider) in &self.providers {
            let (details, status) = provider.health();
            if let Some(details) = details {
                report.insert(key.clone(), details);
            }
            healthy &= status;
        }
        (Value::Object(report), healthy)
    }
}

/// Reports the crate version; always healthy
#[derive(Clone, Debug, Default)]
pub struct VersionHealthProvider;

impl HealthProvider for VersionHealthProvider {
    fn health(&self) -> (Option<Value>, bool) {
        (Some(env!("CARGO_PKG_VERSION").into()), true)
    }
}

impl HealthProvider for SupervisorHandle {
    fn health(&self) -> (Option<Value>, bool) {
        let report = SupervisorHandle::health(self);
        let healthy = report.healthy;
        (serde_json::to_value(report).ok(), healthy)
    }
}
