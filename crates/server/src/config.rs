use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::Context;
use server_api::{
    bus::DEFAULT_QUEUE_CAPACITY,
    presence::{PresenceConfig, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_TYPING_TIMEOUT},
};
use tracing::warn;

pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_UNCLAIMED_ATTACHMENT_TTL: Duration = Duration::from_secs(60 * 60);
/// Three attachments at the per-file cap plus multipart framing.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 31 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub heartbeat_interval: Duration,
    pub keepalive_interval: Duration,
    pub typing_timeout: Duration,
    pub sweep_interval: Duration,
    pub connection_queue_capacity: usize,
    pub max_upload_bytes: usize,
    pub unclaimed_attachment_ttl: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/server.db".into(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            connection_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            unclaimed_attachment_ttl: DEFAULT_UNCLAIMED_ATTACHMENT_TTL,
        }
    }
}

impl Settings {
    pub fn presence_config(&self) -> PresenceConfig {
        PresenceConfig {
            heartbeat_interval: self.heartbeat_interval,
            typing_timeout: self.typing_timeout,
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        match raw.parse::<toml::Table>() {
            Ok(file_cfg) => apply_file_settings(&mut settings, &file_cfg),
            Err(error) => warn!(%error, "ignoring unparsable server.toml"),
        }
    }

    apply_env_settings(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file_settings(settings: &mut Settings, file_cfg: &toml::Table) {
    let text = |key: &str| file_cfg.get(key).and_then(toml::Value::as_str);
    let number = |key: &str| {
        file_cfg
            .get(key)
            .and_then(toml::Value::as_integer)
            .and_then(|v| u64::try_from(v).ok())
    };

    if let Some(v) = text("bind_addr") {
        settings.server_bind = v.to_string();
    }
    if let Some(v) = text("database_url") {
        settings.database_url = v.to_string();
    }
    if let Some(v) = number("heartbeat_interval_secs") {
        settings.heartbeat_interval = Duration::from_secs(v);
    }
    if let Some(v) = number("keepalive_interval_secs") {
        settings.keepalive_interval = Duration::from_secs(v);
    }
    if let Some(v) = number("typing_timeout_ms") {
        settings.typing_timeout = Duration::from_millis(v);
    }
    if let Some(v) = number("sweep_interval_ms") {
        settings.sweep_interval = Duration::from_millis(v);
    }
    if let Some(v) = number("connection_queue_capacity") {
        settings.connection_queue_capacity = v as usize;
    }
    if let Some(v) = number("max_upload_bytes") {
        settings.max_upload_bytes = v as usize;
    }
    if let Some(v) = number("unclaimed_attachment_ttl_secs") {
        settings.unclaimed_attachment_ttl = Duration::from_secs(v);
    }
}

fn apply_env_settings(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = var("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Some(v) = var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = var("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = parsed::<u64>(&var, "APP__HEARTBEAT_INTERVAL_SECS") {
        settings.heartbeat_interval = Duration::from_secs(v);
    }
    if let Some(v) = parsed::<u64>(&var, "APP__KEEPALIVE_INTERVAL_SECS") {
        settings.keepalive_interval = Duration::from_secs(v);
    }
    if let Some(v) = parsed::<u64>(&var, "APP__TYPING_TIMEOUT_MS") {
        settings.typing_timeout = Duration::from_millis(v);
    }
    if let Some(v) = parsed::<u64>(&var, "APP__SWEEP_INTERVAL_MS") {
        settings.sweep_interval = Duration::from_millis(v);
    }
    if let Some(v) = parsed::<usize>(&var, "APP__CONNECTION_QUEUE_CAPACITY") {
        settings.connection_queue_capacity = v;
    }
    if let Some(v) = parsed::<usize>(&var, "APP__MAX_UPLOAD_BYTES") {
        settings.max_upload_bytes = v;
    }
    if let Some(v) = parsed::<u64>(&var, "APP__UNCLAIMED_ATTACHMENT_TTL_SECS") {
        settings.unclaimed_attachment_ttl = Duration::from_secs(v);
    }

    // Zero intervals would make tokio's interval panic.
    let floor = Duration::from_millis(10);
    settings.heartbeat_interval = settings.heartbeat_interval.max(floor);
    settings.keepalive_interval = settings.keepalive_interval.max(floor);
    settings.sweep_interval = settings.sweep_interval.max(floor);
}

fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring invalid numeric setting");
            None
        }
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        if is_windows_absolute(path) {
            return format!("sqlite:{}", path.replace('\\', "/"));
        }
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        if is_windows_absolute(&path) {
            return format!("sqlite:{path}");
        }
        return format!("sqlite://{path}");
    }

    if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    let path = raw_database_url.replace('\\', "/");
    if is_windows_absolute(&path) {
        format!("sqlite:{path}")
    } else {
        format!("sqlite://{path}")
    }
}

fn is_windows_absolute(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'/' || bytes[2] == b'\\')
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
