use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const BACKEND_URL_ENV: &str = "PHOTOJOURNAL_BACKEND_URL";
pub const ANON_KEY_ENV: &str = "PHOTOJOURNAL_ANON_KEY";

fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".photojournal")
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppConfig {
    pub log_level: String,
    pub backend_url: String,
    pub backend_anon_key: String,
    pub transform_url: String,
    pub cache_path: PathBuf,
    pub image_cache_entries: usize,
    pub image_cache_bytes: usize,
    pub fetch_timeout_secs: u64,
    pub signed_url_expiry_secs: u64,
    pub feed_page_size: usize,
    pub refresh_interval_minutes: u64,
    pub debug_console: bool,
    pub trace_spans: bool,
}

#[derive(Debug, Default)]
pub struct AppConfigOverrides {
    pub log_level: Option<String>,
    pub backend_url: Option<String>,
    pub feed_page_size: Option<usize>,
    pub refresh_interval_minutes: Option<u64>,
    pub debug_console: bool,
    pub trace_spans: bool,
}

impl AppConfig {
    pub fn default_path() -> PathBuf {
        default_base_dir().join("config")
    }

    /// Read `path` (or `~/.photojournal/config`) if it exists, fill the gaps
    /// with defaults, then apply the backend environment variables.
    pub fn load_from(path: Option<PathBuf>) -> Self {
        let path = path.unwrap_or_else(Self::default_path);
        let cfg = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Config file unreadable, using defaults");
                config::Config::default()
            });

        let int = |key: &str, default: i64| cfg.get_int(key).unwrap_or(default).max(0);
        let mut loaded = Self {
            log_level: cfg
                .get_string("log_level")
                .unwrap_or_else(|_| "info".to_string()),
            backend_url: cfg
                .get_string("backend_url")
                .unwrap_or_else(|_| "http://localhost:54321".to_string()),
            backend_anon_key: cfg.get_string("backend_anon_key").unwrap_or_default(),
            transform_url: cfg
                .get_string("transform_url")
                .unwrap_or_else(|_| "http://localhost:8000/transform".to_string()),
            cache_path: cfg
                .get_string("cache_path")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_base_dir()),
            image_cache_entries: int("image_cache_entries", 100) as usize,
            image_cache_bytes: int("image_cache_bytes", 64 * 1024 * 1024) as usize,
            fetch_timeout_secs: int("fetch_timeout_secs", 30) as u64,
            signed_url_expiry_secs: int("signed_url_expiry_secs", 3600) as u64,
            feed_page_size: int("feed_page_size", 20) as usize,
            refresh_interval_minutes: int("refresh_interval_minutes", 5) as u64,
            debug_console: cfg.get_bool("debug_console").unwrap_or(false),
            trace_spans: cfg.get_bool("trace_spans").unwrap_or(false),
        };

        if let Ok(url) = std::env::var(BACKEND_URL_ENV) {
            loaded.backend_url = url;
        }
        if let Ok(key) = std::env::var(ANON_KEY_ENV) {
            loaded.backend_anon_key = key;
        }
        loaded
    }

    pub fn apply_overrides(mut self, ov: &AppConfigOverrides) -> Self {
        if let Some(l) = &ov.log_level {
            self.log_level = l.clone();
        }
        if let Some(url) = &ov.backend_url {
            self.backend_url = url.clone();
        }
        if let Some(n) = ov.feed_page_size {
            self.feed_page_size = n;
        }
        if let Some(m) = ov.refresh_interval_minutes {
            self.refresh_interval_minutes = m;
        }
        if ov.debug_console {
            self.debug_console = true;
        }
        if ov.trace_spans {
            self.trace_spans = true;
        }
        self
    }

    pub fn save_to(&self, path: Option<PathBuf>) -> std::io::Result<()> {
        let path = path.unwrap_or_else(Self::default_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = toml::to_string(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, data)
    }

    pub fn db_path(&self) -> PathBuf {
        self.cache_path.join("cache.sqlite")
    }
}
