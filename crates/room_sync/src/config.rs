use std::{fs, path::Path, str::FromStr, time::Duration};

use serde::Deserialize;
use tracing::warn;

pub const CONFIG_FILE: &str = "room_sync.toml";
pub const ENV_PREFIX: &str = "ROOM_SYNC__";
pub const MAX_JITTER_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub page_size: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub backoff_jitter_ms: u64,
    pub max_reconnect_attempts: u32,
    pub subscribe_timeout_ms: u64,
    pub typing_republish_ms: u64,
    pub typing_idle_ms: u64,
    pub read_receipt_debounce_ms: u64,
    pub write_retry_attempts: u32,
    pub write_retry_base_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            backoff_base_ms: 1000,
            backoff_cap_ms: 30_000,
            backoff_jitter_ms: MAX_JITTER_MS,
            max_reconnect_attempts: 5,
            subscribe_timeout_ms: 10_000,
            typing_republish_ms: 4000,
            typing_idle_ms: 3000,
            read_receipt_debounce_ms: 1000,
            write_retry_attempts: 3,
            write_retry_base_ms: 500,
        }
    }
}

impl SyncConfig {
    pub fn validate(mut self) -> Self {
        if self.page_size == 0 {
            self.page_size = Self::default().page_size;
        }
        if self.max_reconnect_attempts == 0 {
            self.max_reconnect_attempts = 1;
        }
        if self.write_retry_attempts == 0 {
            self.write_retry_attempts = 1;
        }
        self.backoff_jitter_ms = self.backoff_jitter_ms.min(MAX_JITTER_MS);
        if self.backoff_cap_ms < self.backoff_base_ms {
            self.backoff_cap_ms = self.backoff_base_ms;
        }
        self.typing_idle_ms = self.typing_idle_ms.clamp(2000, 5000);
        self
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub fn typing_republish(&self) -> Duration {
        Duration::from_millis(self.typing_republish_ms)
    }

    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }

    pub fn read_receipt_debounce(&self) -> Duration {
        Duration::from_millis(self.read_receipt_debounce_ms)
    }
}

pub fn load_config() -> SyncConfig {
    load_config_from(Path::new(CONFIG_FILE), |key| std::env::var(key).ok())
}

pub fn load_config_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> SyncConfig {
    let mut config = SyncConfig::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<SyncConfig>(&raw) {
            Ok(file_cfg) => config = file_cfg,
            Err(err) => warn!(path = %path.display(), %err, "config: ignoring unparseable file"),
        }
    }

    override_from_env(&env, "PAGE_SIZE", &mut config.page_size);
    override_from_env(&env, "BACKOFF_BASE_MS", &mut config.backoff_base_ms);
    override_from_env(&env, "BACKOFF_CAP_MS", &mut config.backoff_cap_ms);
    override_from_env(&env, "BACKOFF_JITTER_MS", &mut config.backoff_jitter_ms);
    override_from_env(
        &env,
        "MAX_RECONNECT_ATTEMPTS",
        &mut config.max_reconnect_attempts,
    );
    override_from_env(&env, "SUBSCRIBE_TIMEOUT_MS", &mut config.subscribe_timeout_ms);
    override_from_env(&env, "TYPING_REPUBLISH_MS", &mut config.typing_republish_ms);
    override_from_env(&env, "TYPING_IDLE_MS", &mut config.typing_idle_ms);
    override_from_env(
        &env,
        "READ_RECEIPT_DEBOUNCE_MS",
        &mut config.read_receipt_debounce_ms,
    );
    override_from_env(&env, "WRITE_RETRY_ATTEMPTS", &mut config.write_retry_attempts);
    override_from_env(&env, "WRITE_RETRY_BASE_MS", &mut config.write_retry_base_ms);

    config.validate()
}

fn override_from_env<T: FromStr>(env: &impl Fn(&str) -> Option<String>, field: &str, slot: &mut T) {
    let key = format!("{ENV_PREFIX}{field}");
    let Some(raw) = env(&key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value = %raw, "config: ignoring unparseable override"),
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
