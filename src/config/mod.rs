use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Document cache bounds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Entries whose last write is older than this are purged by the sweep.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Maximum population after a sweep; oldest entries go first.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Cadence of the background sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_max_entries() -> usize {
    10
}

fn default_sweep_interval_secs() -> u64 {
    300
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            max_entries: default_max_entries(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Image transcoding knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TranscodeSettings {
    /// Master switch. When `false` every image is stored as uploaded.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Images narrower than this are passed through untouched.
    #[serde(default = "default_min_width")]
    pub min_width: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_avif_quality")]
    pub avif_quality: u8,
    /// AVIF encoder speed, 1 (slowest) to 10 (fastest).
    #[serde(default = "default_avif_speed")]
    pub avif_speed: u8,
}

fn default_true() -> bool {
    true
}

fn default_min_width() -> u32 {
    100
}

fn default_jpeg_quality() -> u8 {
    80
}

fn default_avif_quality() -> u8 {
    70
}

fn default_avif_speed() -> u8 {
    8
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_width: default_min_width(),
            jpeg_quality: default_jpeg_quality(),
            avif_quality: default_avif_quality(),
            avif_speed: default_avif_speed(),
        }
    }
}

/// Top-level configuration loaded from `config.yaml`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Parent directory for session working directories.
    /// Defaults to `<tmp>/deckpack-workspace`.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub transcode: TranscodeSettings,
}

impl Config {
    /// Read and parse a YAML configuration file.  A missing file yields
    /// the defaults.
    pub async fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Config::default());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read config file: {}", path.display()));
            }
        };

        let mut config: Config =
            serde_yaml::from_str(&contents).context("failed to parse config YAML")?;
        config.validate()?;

        // Relative workspace roots are anchored at deckpack home.
        if let Some(root) = config.workspace_root.as_mut() {
            if root.is_relative() {
                *root = crate::deckpack_home().join(&*root);
            }
        }

        tracing::debug!(
            workspace_root = %config.workspace_root().display(),
            cache_max = config.cache.max_entries,
            "configuration loaded"
        );

        Ok(config)
    }

    /// Validate semantic constraints that serde cannot enforce.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cache.max_entries == 0 {
            anyhow::bail!("config: cache.max_entries must be at least 1");
        }
        if self.cache.sweep_interval_secs == 0 {
            anyhow::bail!("config: cache.sweep_interval_secs=0 (would create busy loop)");
        }
        for (name, q) in [
            ("jpeg_quality", self.transcode.jpeg_quality),
            ("avif_quality", self.transcode.avif_quality),
        ] {
            if !(1..=100).contains(&q) {
                anyhow::bail!("config: transcode.{name}={q} is outside 1..=100");
            }
        }
        if !(1..=10).contains(&self.transcode.avif_speed) {
            anyhow::bail!(
                "config: transcode.avif_speed={} is outside 1..=10",
                self.transcode.avif_speed
            );
        }
        Ok(())
    }

    /// Effective workspace root.
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("deckpack-workspace"))
    }
}
