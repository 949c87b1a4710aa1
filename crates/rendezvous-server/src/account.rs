//! Persistent account records.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered user. `online` mirrors whether a live session exists and is
/// reset on every load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub secret: String,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub friends: BTreeSet<String>,
    /// Address advertised at the most recent login.
    #[serde(default)]
    pub last_address: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_login: Option<DateTime<Utc>>,
}

impl Account {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
            online: false,
            friends: BTreeSet::new(),
            last_address: None,
            created_at: Utc::now(),
            last_login: None,
        }
    }

    pub fn is_friend(&self, other: &str) -> bool {
        self.friends.contains(other)
    }

    pub fn summary(&self) -> AccountSummary {
        AccountSummary {
            username: self.username.clone(),
            online: self.online,
            friends: self.friends.iter().cloned().collect(),
            address: self.last_address.clone(),
            created_at: self.created_at,
            last_login: self.last_login,
        }
    }
}

/// Account view exposed through the admin API. Never carries the secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSummary {
    pub username: String,
    pub online: bool,
    pub friends: Vec<String>,
    pub address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}
