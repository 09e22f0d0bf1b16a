//! Standard connection components.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::systems::Component;

// ── Verify ───────────────────────────────────────────────────────

/// Liveness and ban bookkeeping for one connection.
#[derive(Debug)]
pub struct Verify {
    state: Mutex<VerifyState>,
}

#[derive(Debug)]
struct VerifyState {
    last_active: Instant,
    banned_until: Option<DateTime<Utc>>,
}

impl Default for Verify {
    fn default() -> Self {
        Self {
            state: Mutex::new(VerifyState {
                last_active: Instant::now(),
                banned_until: None,
            }),
        }
    }
}

impl Component for Verify {}

impl Verify {
    /// Record activity now.
    pub fn touch(&self) {
        self.state.lock().last_active = Instant::now();
    }

    pub fn last_active(&self) -> Instant {
        self.state.lock().last_active
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active().elapsed()
    }

    pub fn ban(&self, until: DateTime<Utc>) {
        self.state.lock().banned_until = Some(until);
    }

    pub fn unban(&self) {
        self.state.lock().banned_until = None;
    }

    pub fn banned_until(&self) -> Option<DateTime<Utc>> {
        self.state.lock().banned_until
    }

    /// A ban is recorded and still in the future.
    pub fn is_banned(&self) -> bool {
        self.banned_until().is_some_and(|until| until > Utc::now())
    }

    /// A ban is recorded but has lapsed.
    pub fn ban_expired(&self) -> bool {
        self.banned_until().is_some_and(|until| until <= Utc::now())
    }
}

// ── PermissionGroup ──────────────────────────────────────────────

/// Ordered privilege levels; higher levels may run everything lower ones can.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    Guest,
    #[default]
    Client,
    Admin,
    Terminal,
}

impl std::fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Guest => write!(f, "guest"),
            Self::Client => write!(f, "client"),
            Self::Admin => write!(f, "admin"),
            Self::Terminal => write!(f, "terminal"),
        }
    }
}

#[derive(Debug, Default)]
pub struct PermissionGroup {
    level: RwLock<PermissionLevel>,
}

impl Component for PermissionGroup {}

impl PermissionGroup {
    pub fn new(level: PermissionLevel) -> Self {
        Self {
            level: RwLock::new(level),
        }
    }

    pub fn level(&self) -> PermissionLevel {
        *self.level.read()
    }

    pub fn set_level(&self, level: PermissionLevel) {
        *self.level.write() = level;
    }

    pub fn allows(&self, required: PermissionLevel) -> bool {
        self.level() >= required
    }
}

// ── ClientComponent ──────────────────────────────────────────────

/// Stable identity of the peer behind a connection.
#[derive(Debug, Default)]
pub struct ClientComponent {
    identity: RwLock<ClientIdentity>,
}

#[derive(Debug, Default, Clone)]
struct ClientIdentity {
    user_id: String,
    name: String,
}

impl Component for ClientComponent {}

impl ClientComponent {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            identity: RwLock::new(ClientIdentity {
                user_id: user_id.into(),
                name: name.into(),
            }),
        }
    }

    /// The user id, if one has been assigned.
    pub fn user_id(&self) -> Option<String> {
        let identity = self.identity.read();
        (!identity.user_id.is_empty()).then(|| identity.user_id.clone())
    }

    pub fn name(&self) -> String {
        self.identity.read().name.clone()
    }

    pub fn set_user_id(&self, user_id: impl Into<String>) {
        self.identity.write().user_id = user_id.into();
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.identity.write().name = name.into();
    }
}
