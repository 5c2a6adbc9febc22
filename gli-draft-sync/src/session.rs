//! Per-session state shared by recovery and backup: the user's
//! preferences and session bookkeeping.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

pub type SharedSession = Arc<RwLock<SessionState>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserPreferences {
    pub auto_save_enabled: bool,
    /// Autosave debounce window in milliseconds.
    pub auto_save_interval: u64,
    pub theme: String,
    pub language: String,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            auto_save_enabled: true,
            auto_save_interval: 1000,
            theme: "light".into(),
            language: "es".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_start: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub page_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub preferences: UserPreferences,
    pub info: SessionInfo,
}

impl SessionState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            preferences: UserPreferences::default(),
            info: SessionInfo {
                session_start: now,
                last_activity: now,
                page_url: None,
            },
        }
    }

    pub fn shared(now: DateTime<Utc>) -> SharedSession {
        Arc::new(RwLock::new(Self::new(now)))
    }

    /// Record user activity; never moves backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.info.last_activity {
            self.info.last_activity = now;
        }
    }

    /// Start a new session after a recovery.
    pub fn restart(&mut self, now: DateTime<Utc>) {
        self.info.session_start = now;
        self.info.last_activity = now;
    }
}
