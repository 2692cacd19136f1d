//! Health reporting per logical operation.

use std::collections::BTreeMap;
use std::error::Error;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

pub const SCOPE_NODES_ADD: &str = "nodes-add";
pub const SCOPE_NODES_UPDATE: &str = "nodes-update";
pub const SCOPE_NODES_DELETE: &str = "nodes-delete";
pub const SCOPE_BACKGROUND_SYNC: &str = "background-sync";
pub const SCOPE_CHECKPOINT_WRITER: &str = "node-checkpoint-writer";

/// Sink the manager reports operation outcomes to.
pub trait Health: Send + Sync {
    fn ok(&self, scope: &str, message: &str);

    fn degraded(&self, scope: &str, message: &str, error: &(dyn Error + 'static));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Ok,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub level: Level,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// In-process health sink keeping the last status of every scope.
#[derive(Debug, Default)]
pub struct HealthReporter {
    scopes: RwLock<BTreeMap<String, HealthStatus>>,
}

impl HealthReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, scope: &str) -> Option<HealthStatus> {
        self.scopes.read().get(scope).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, HealthStatus> {
        self.scopes.read().clone()
    }

    /// `true` when no scope is degraded.
    pub fn is_healthy(&self) -> bool {
        self.scopes
            .read()
            .values()
            .all(|s| s.level == Level::Ok)
    }

    fn set(&self, scope: &str, level: Level, message: &str, error: Option<String>) {
        self.scopes.write().insert(
            scope.to_string(),
            HealthStatus {
                level,
                message: message.to_string(),
                error,
                updated_at: Utc::now(),
            },
        );
    }
}

impl Health for HealthReporter {
    fn ok(&self, scope: &str, message: &str) {
        self.set(scope, Level::Ok, message, None);
    }

    fn degraded(&self, scope: &str, message: &str, error: &(dyn Error + 'static)) {
        tracing::warn!(scope, error = %error, "{message}");
        self.set(scope, Level::Degraded, message, Some(error.to_string()));
    }
}
