// =============================================================================
// Runtime Configuration - recorder settings with atomic save
// =============================================================================
//
// Every tunable lives here. All fields carry a serde default so that adding a
// field never breaks loading an older config file. Environment variables
// override whatever the file says.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    [
        "BTCUSDT", "ETHUSDT", "BNBUSDT", "ADAUSDT", "XRPUSDT", "DOGEUSDT", "SOLUSDT",
        "MATICUSDT", "DOTUSDT", "LTCUSDT", "SHIBUSDT", "AVAXUSDT", "TRXUSDT", "UNIUSDT",
        "LINKUSDT",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_ws_base() -> String {
    "wss://stream.binance.com:9443".to_string()
}

fn default_rest_base() -> String {
    "https://api.binance.com".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:4000".to_string()
}

fn default_data_path() -> PathBuf {
    PathBuf::from("data/candles.jsonl")
}

/// Which `CandleStore` implementation backs the recorder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Append-only JSON-lines file at `data_path`.
    #[default]
    Jsonl,
    Memory,
}

impl std::str::FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jsonl" | "file" => Ok(Self::Jsonl),
            "memory" | "mem" => Ok(Self::Memory),
            other => anyhow::bail!("unknown candle store kind: {other}"),
        }
    }
}

fn default_page_size() -> u32 {
    1000
}

fn default_broadcast_capacity() -> usize {
    4096
}

fn default_feed_channel_capacity() -> usize {
    10_000
}

fn default_query_days() -> i64 {
    7
}

fn default_max_query_days() -> i64 {
    30
}

fn default_recent_limit() -> usize {
    15
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Upstream -----------------------------------------------------------

    /// Symbols subscribed on the trade stream and covered by backfill.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// WebSocket base, without the `/stream` path.
    #[serde(default = "default_ws_base")]
    pub ws_base: String,

    /// REST base used for kline history.
    #[serde(default = "default_rest_base")]
    pub rest_base: String,

    /// Bars requested per history page (capped at 1000).
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    // --- Local --------------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default)]
    pub store: StoreKind,

    /// JSON-lines candle file.
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,

    /// Live events buffered per subscriber before it starts losing them.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,

    /// Parsed trades buffered between the socket reader and the pipeline.
    #[serde(default = "default_feed_channel_capacity")]
    pub feed_channel_capacity: usize,

    // --- Read path ----------------------------------------------------------

    /// Range query window when the caller names none.
    #[serde(default = "default_query_days")]
    pub default_query_days: i64,

    #[serde(default = "default_max_query_days")]
    pub max_query_days: i64,

    /// Candles per symbol returned by the recent-candles view.
    #[serde(default = "default_recent_limit")]
    pub recent_limit: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            ws_base: default_ws_base(),
            rest_base: default_rest_base(),
            page_size: default_page_size(),
            bind_addr: default_bind_addr(),
            store: StoreKind::default(),
            data_path: default_data_path(),
            broadcast_capacity: default_broadcast_capacity(),
            feed_channel_capacity: default_feed_channel_capacity(),
            default_query_days: default_query_days(),
            max_query_days: default_max_query_days(),
            recent_limit: default_recent_limit(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = config.symbols.len(),
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply environment overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup. Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(list) = get("CANDLE_SYMBOLS") {
            let symbols: Vec<String> = list
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if symbols.is_empty() {
                anyhow::bail!("CANDLE_SYMBOLS names no symbols");
            }
            self.symbols = symbols;
        }
        if let Some(ws) = get("BINANCE_WS_ENDPOINT") {
            self.ws_base = ws;
        }
        if let Some(rest) = get("BINANCE_REST_URL") {
            self.rest_base = rest;
        }
        if let Some(addr) = get("CANDLE_BIND_ADDR") {
            self.bind_addr = addr;
        } else if let Some(port) = get("PORT") {
            let port: u16 = port
                .trim()
                .parse()
                .with_context(|| format!("PORT is not a valid port number: {port}"))?;
            self.bind_addr = format!("0.0.0.0:{port}");
        }
        if let Some(kind) = get("CANDLE_STORE") {
            self.store = kind.parse()?;
        }
        if let Some(path) = get("CANDLE_DATA_PATH") {
            self.data_path = PathBuf::from(path);
        }
        Ok(())
    }
}
