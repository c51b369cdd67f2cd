// ABOUTME: Shared data models for the CI test helpers
// ABOUTME: JSON report emitted by the connection check binary

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Backend;

/// Outcome of checking one backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckReport {
    pub backend: Backend,
    pub server: String,
    pub database: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(rename = "addressCount", default)]
    pub address_count: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CheckReport {
    pub fn success(
        backend: Backend,
        server: String,
        database: String,
        version: String,
        address_count: i32,
    ) -> Self {
        Self {
            backend,
            server,
            database,
            version: Some(version),
            address_count: Some(address_count),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(backend: Backend, server: String, database: String, error: String) -> Self {
        Self {
            backend,
            server,
            database,
            version: None,
            address_count: None,
            error: Some(error),
            timestamp: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
