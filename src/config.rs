use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_ACTIVITY_BUFFER_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_ACTIVITY_BUFFER_MAX_FILES: usize = 5;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub api_base_url: String,
    pub api_token: Option<SecretString>,
    pub request_timeout_secs: u64,
    pub task_poll_interval_ms: u64,
    pub task_decay_secs: u64,
    pub activity_enabled_by_default: bool,
    pub activity_batch_size: usize,
    pub activity_buffer_max_bytes: u64,
    pub activity_buffer_max_files: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub api_base_url: String,
    pub has_api_token: bool,
    pub request_timeout_secs: u64,
    pub task_poll_interval_ms: u64,
    pub task_decay_secs: u64,
    pub activity_enabled_by_default: bool,
    pub activity_batch_size: usize,
    pub activity_buffer_max_bytes: u64,
    pub activity_buffer_max_files: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            api_base_url: env::var("API_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8000".to_string()),
            api_token: env::var("API_TOKEN")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            request_timeout_secs: parse_u64("API_REQUEST_TIMEOUT_SECS", 10),
            task_poll_interval_ms: parse_u64("TASK_POLL_INTERVAL_MS", 2_000),
            task_decay_secs: parse_u64("TASK_DECAY_SECS", 3),
            activity_enabled_by_default: parse_bool("ACTIVITY_LOG_ENABLED", true),
            activity_batch_size: parse_usize("ACTIVITY_BATCH_SIZE", 25),
            activity_buffer_max_bytes: parse_u64(
                "ACTIVITY_BUFFER_MAX_BYTES",
                DEFAULT_ACTIVITY_BUFFER_MAX_BYTES,
            ),
            activity_buffer_max_files: parse_usize(
                "ACTIVITY_BUFFER_MAX_FILES",
                DEFAULT_ACTIVITY_BUFFER_MAX_FILES,
            )
            .max(1),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            api_base_url: self.api_base_url.clone(),
            has_api_token: self.api_token.is_some(),
            request_timeout_secs: self.request_timeout_secs,
            task_poll_interval_ms: self.task_poll_interval_ms,
            task_decay_secs: self.task_decay_secs,
            activity_enabled_by_default: self.activity_enabled_by_default,
            activity_batch_size: self.activity_batch_size,
            activity_buffer_max_bytes: self.activity_buffer_max_bytes,
            activity_buffer_max_files: self.activity_buffer_max_files,
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}
