use std::{path::Path, time::Duration};

use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::Deserialize;

use crate::error::{ClientError, ClientResult};

const SETTINGS_FILE_STEM: &str = "client";
const ENV_PREFIX: &str = "APP";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientSettings {
    pub server_url: String,
    #[serde(default)]
    pub ws_url: Option<String>,
    pub database_url: String,
    pub refresh_threshold_secs: i64,
    pub typing_debounce_ms: u64,
    pub chat_page_size: u32,
    pub message_page_size: u32,
    pub chat_cache_limit: u32,
    pub message_cache_limit: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            ws_url: None,
            database_url: "sqlite://./data/client.db".into(),
            refresh_threshold_secs: 60,
            typing_debounce_ms: 300,
            chat_page_size: 20,
            message_page_size: 50,
            chat_cache_limit: 50,
            message_cache_limit: 100,
        }
    }
}

impl ClientSettings {
    pub fn typing_debounce(&self) -> Duration {
        Duration::from_millis(self.typing_debounce_ms)
    }

    /// Push endpoint; derived from `server_url` unless configured explicitly.
    pub fn resolved_ws_url(&self) -> ClientResult<String> {
        if let Some(ws_url) = &self.ws_url {
            return Ok(ws_url.trim_end_matches('/').to_string());
        }
        let server_url = self.server_url.trim_end_matches('/');
        let ws_base = if server_url.starts_with("https://") {
            server_url.replacen("https://", "wss://", 1)
        } else if server_url.starts_with("http://") {
            server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(ClientError::Config(
                "server_url must start with http:// or https://".into(),
            ));
        };
        Ok(format!("{ws_base}/ws"))
    }

    pub fn validate(&self) -> ClientResult<()> {
        url::Url::parse(&self.server_url)
            .map_err(|err| ClientError::Config(format!("invalid server_url: {err}")))?;
        self.resolved_ws_url()?;
        if self.chat_page_size == 0 || self.message_page_size == 0 {
            return Err(ClientError::Config("page sizes must be positive".into()));
        }
        Ok(())
    }
}

/// Defaults, then `client.toml` in the working directory if present, then
/// `APP__*` environment variables.
pub fn load_settings() -> ClientResult<ClientSettings> {
    load_settings_from(Path::new(SETTINGS_FILE_STEM))
}

pub fn load_settings_from(path: &Path) -> ClientResult<ClientSettings> {
    let builder = defaults()?
        .add_source(File::from(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );
    finish(builder)
}

pub fn settings_from_toml(raw: &str) -> ClientResult<ClientSettings> {
    finish(defaults()?.add_source(File::from_str(raw, FileFormat::Toml)))
}

fn defaults() -> ClientResult<ConfigBuilder<config::builder::DefaultState>> {
    let d = ClientSettings::default();
    Config::builder()
        .set_default("server_url", d.server_url)
        .and_then(|b| b.set_default("database_url", d.database_url))
        .and_then(|b| b.set_default("refresh_threshold_secs", d.refresh_threshold_secs))
        .and_then(|b| b.set_default("typing_debounce_ms", d.typing_debounce_ms as i64))
        .and_then(|b| b.set_default("chat_page_size", i64::from(d.chat_page_size)))
        .and_then(|b| b.set_default("message_page_size", i64::from(d.message_page_size)))
        .and_then(|b| b.set_default("chat_cache_limit", i64::from(d.chat_cache_limit)))
        .and_then(|b| b.set_default("message_cache_limit", i64::from(d.message_cache_limit)))
        .map_err(|err| ClientError::Config(err.to_string()))
}

fn finish(builder: ConfigBuilder<config::builder::DefaultState>) -> ClientResult<ClientSettings> {
    let mut settings: ClientSettings = builder
        .build()
        .and_then(Config::try_deserialize)
        .map_err(|err| ClientError::Config(err.to_string()))?;
    settings.database_url = normalize_database_url(&settings.database_url);
    settings.validate()?;
    Ok(settings)
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return ClientSettings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
