use std::fmt;
use std::time::Duration;

use studysync_api_types::CurrentUser;
use tokio::time::Instant;

use crate::error::SyncError;

const DEFAULT_IDENTITY_PATH: &str = "/api/me";
const DEFAULT_THROTTLE_WINDOW: Duration = Duration::from_secs(5 * 60);
const DEFAULT_REVALIDATE_INTERVAL: Duration = Duration::from_secs(30 * 60);
const DEFAULT_INITIAL_CHECK_DELAY: Duration = Duration::from_secs(1);

/// The client's belief about its session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Validity {
    /// No check has completed since start or sign-out.
    #[default]
    Unknown,
    Valid,
    Invalid,
}

impl Validity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        }
    }
}

impl fmt::Display for Validity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the session monitor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub validity: Validity,
    pub identity: Option<CurrentUser>,
    /// Completion time of the last identity round-trip.
    pub last_validated_at: Option<Instant>,
    pub is_checking: bool,
    /// Diagnostic recorded when the server rejected a session believed valid.
    pub last_mismatch: Option<SyncError>,
}

impl SessionState {
    /// Whether the client currently assumes it is signed in.
    pub fn is_authenticated(&self) -> bool {
        self.validity == Validity::Valid || self.identity.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub identity_path: String,
    /// Store key the identity payload is cached under.
    pub identity_key: String,
    /// Minimum spacing of unforced round-trips.
    pub throttle_window: Duration,
    pub revalidate_interval: Duration,
    /// Delay before the first check after an identity becomes known.
    pub initial_check_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            identity_path: DEFAULT_IDENTITY_PATH.to_string(),
            identity_key: DEFAULT_IDENTITY_PATH.to_string(),
            throttle_window: DEFAULT_THROTTLE_WINDOW,
            revalidate_interval: DEFAULT_REVALIDATE_INTERVAL,
            initial_check_delay: DEFAULT_INITIAL_CHECK_DELAY,
        }
    }
}

impl From<&crate::config::SessionSettings> for SessionConfig {
    fn from(settings: &crate::config::SessionSettings) -> Self {
        Self {
            identity_path: settings.identity_path.clone(),
            identity_key: settings.identity_path.clone(),
            throttle_window: settings.throttle_window,
            revalidate_interval: settings.revalidate_interval,
            initial_check_delay: settings.initial_check_delay,
        }
    }
}
