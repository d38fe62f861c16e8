use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub github: GitHubConfig,
    pub render: RenderConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8000`).
    pub http_listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_listen: "0.0.0.0:8000".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Artifact cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding one generated card per repository.
    pub dir: String,
    /// Seconds a generated card stays fresh.
    pub ttl_secs: u64,
    /// Upper bound (seconds) on a single card generation, fetch and render
    /// included.
    pub generation_timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: "images".to_string(),
            ttl_secs: 86_400,
            generation_timeout_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// GitHub API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    /// Full URL to the API root.
    pub api_url: String,
    /// Name of the environment variable that holds an optional API token.
    /// Unauthenticated requests work but get a much smaller rate limit.
    pub token_env: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Minimum number of API calls to keep in reserve before refusing to
    /// call upstream.
    pub rate_limit_buffer: u32,
    pub user_agent: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            token_env: "GITHUB_TOKEN".to_string(),
            request_timeout_secs: 10,
            rate_limit_buffer: 5,
            user_agent: concat!("repocard/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Candidate font files, tried in order.
    pub font_paths: Vec<String>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            font_paths: [
                "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
                "/usr/share/fonts/dejavu/DejaVuSans.ttf",
                "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
                "/usr/share/fonts/opentype/noto/NotoSansCJK-Regular.ttc",
                "/usr/share/fonts/truetype/wqy/wqy-microhei.ttc",
                "/System/Library/Fonts/Supplemental/Arial.ttf",
                "/Library/Fonts/Arial.ttf",
                "C:/Windows/Fonts/arial.ttf",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config = parse_config(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    Ok(config)
}

/// Parse and validate a YAML document.  An empty document yields defaults.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = if contents.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(contents)?
    };
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(config.cache.ttl_secs > 0, "cache.ttl_secs must be positive");
    anyhow::ensure!(
        config.cache.generation_timeout_secs > 0,
        "cache.generation_timeout_secs must be positive"
    );
    anyhow::ensure!(!config.cache.dir.is_empty(), "cache.dir must not be empty");
    anyhow::ensure!(
        config.github.request_timeout_secs > 0,
        "github.request_timeout_secs must be positive"
    );
    anyhow::ensure!(
        config.github.api_url.starts_with("http://") || config.github.api_url.starts_with("https://"),
        "github.api_url must be an http(s) URL"
    );
    Ok(())
}
