// Sync core configuration
//
// SyncConfig is plain data: it can be built directly, deserialized, or read
// from FLOWDESK_* environment variables (after loading a .env file).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Configuration for the editor sync core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base URL of the workflow API
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Directory holding the durable state file
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Quiet window after the last edit before an autosave fires
    #[serde(default = "default_autosave_debounce", with = "duration_millis")]
    pub autosave_debounce: Duration,

    /// Pause after cancelling a running execution before starting a new one
    #[serde(default = "default_stop_settle", with = "duration_millis")]
    pub stop_settle_interval: Duration,

    /// Entries fetched per history page (also used for reconciliation)
    #[serde(default = "default_history_page_size")]
    pub history_page_size: u32,
}

fn default_api_url() -> String {
    "http://localhost:8765".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".flowdesk")
}

fn default_autosave_debounce() -> Duration {
    Duration::from_millis(1000)
}

fn default_stop_settle() -> Duration {
    Duration::from_millis(500)
}

fn default_history_page_size() -> u32 {
    50
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            state_dir: default_state_dir(),
            autosave_debounce: default_autosave_debounce(),
            stop_settle_interval: default_stop_settle(),
            history_page_size: default_history_page_size(),
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// Loads `.env` if present. Unparseable numeric values fall back to the
    /// default with a warning.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(url) = lookup("FLOWDESK_API_URL") {
            config.api_url = url;
        }
        if let Some(dir) = lookup("FLOWDESK_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "FLOWDESK_AUTOSAVE_DEBOUNCE_MS") {
            config.autosave_debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "FLOWDESK_STOP_SETTLE_MS") {
            config.stop_settle_interval = Duration::from_millis(ms);
        }
        if let Some(size) = parse_var::<u32>(&lookup, "FLOWDESK_HISTORY_PAGE_SIZE") {
            config.history_page_size = size.max(1);
        }
        config
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    pub fn with_autosave_debounce(mut self, debounce: Duration) -> Self {
        self.autosave_debounce = debounce;
        self
    }

    pub fn with_stop_settle_interval(mut self, interval: Duration) -> Self {
        self.stop_settle_interval = interval;
        self
    }

    pub fn with_history_page_size(mut self, size: u32) -> Self {
        self.history_page_size = size.max(1);
        self
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable configuration value");
            None
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
