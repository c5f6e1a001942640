//! Configuration loading and scorer factory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use mockprep_core::queue::QueueConfig;
use mockprep_core::traits::Scorer;

use crate::http::HttpScorer;
use crate::mock::MockScorer;

/// Environment variable that overrides the HTTP scorer's API key.
pub const SCORER_KEY_ENV: &str = "MOCKPREP_SCORER_KEY";

/// Which scorer answers are delivered to.
///
/// Note: Custom Debug impl masks API keys to prevent accidental exposure in logs.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ScorerConfig {
    Http {
        base_url: String,
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    /// Local mock; nothing leaves the machine.
    Mock {
        /// Fail this many deliveries before accepting.
        #[serde(default)]
        fail_first: usize,
        #[serde(default)]
        latency_ms: u64,
    },
}

impl std::fmt::Debug for ScorerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScorerConfig::Http {
                api_key,
                base_url,
                timeout_secs,
            } => f
                .debug_struct("Http")
                .field("base_url", base_url)
                .field("api_key", &api_key.as_ref().map(|_| "***"))
                .field("timeout_secs", timeout_secs)
                .finish(),
            ScorerConfig::Mock {
                fail_first,
                latency_ms,
            } => f
                .debug_struct("Mock")
                .field("fail_first", fail_first)
                .field("latency_ms", latency_ms)
                .finish(),
        }
    }
}

impl Default for ScorerConfig {
    fn default() -> Self {
        ScorerConfig::Mock {
            fail_first: 0,
            latency_ms: 0,
        }
    }
}

/// Submission queue tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_base_delay() -> u64 {
    2000
}
fn default_max_delay() -> u64 {
    60_000
}
fn default_max_retries() -> u32 {
    8
}
fn default_max_in_flight() -> usize {
    4
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            max_retries: default_max_retries(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl QueueSettings {
    pub fn to_queue_config(&self) -> QueueConfig {
        QueueConfig {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)),
            max_retries: Some(self.max_retries),
            max_in_flight: self.max_in_flight.max(1),
        }
    }
}

/// Session timing and on-disk state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// Root for checkpoints and the submission spool.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_tick_interval() -> u64 {
    1000
}
fn default_state_dir() -> PathBuf {
    PathBuf::from("./mockprep-state")
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            state_dir: default_state_dir(),
        }
    }
}

impl SessionSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.state_dir.join("spool")
    }
}

/// Top-level mockprep configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockprepConfig {
    #[serde(default)]
    pub scorer: ScorerConfig,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub session: SessionSettings,
}

/// Resolve environment variable references like `${VAR_NAME}` in a string.
fn resolve_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    while let Some(start) = result.find("${") {
        if let Some(end) = result[start..].find('}') {
            let var_name = &result[start + 2..start + end];
            let value = std::env::var(var_name).unwrap_or_default();
            result = format!(
                "{}{}{}",
                &result[..start],
                value,
                &result[start + end + 1..]
            );
        } else {
            break;
        }
    }
    result
}

fn resolve_scorer_config(config: &ScorerConfig) -> ScorerConfig {
    match config {
        ScorerConfig::Http {
            base_url,
            api_key,
            timeout_secs,
        } => ScorerConfig::Http {
            base_url: resolve_env_vars(base_url),
            api_key: api_key.as_ref().map(|k| resolve_env_vars(k)),
            timeout_secs: *timeout_secs,
        },
        mock @ ScorerConfig::Mock { .. } => mock.clone(),
    }
}

/// Load configuration from well-known paths.
///
/// Search order:
/// 1. `mockprep.toml` in the current directory
/// 2. `~/.config/mockprep/config.toml`
///
/// Environment variable override: `MOCKPREP_SCORER_KEY`.
pub fn load_config() -> Result<MockprepConfig> {
    load_config_from(None)
}

/// Load config from an explicit path, or search the default locations.
pub fn load_config_from(path: Option<&Path>) -> Result<MockprepConfig> {
    let config_path = if let Some(p) = path {
        if p.exists() {
            Some(p.to_path_buf())
        } else {
            anyhow::bail!("config file not found: {}", p.display());
        }
    } else {
        let local = PathBuf::from("mockprep.toml");
        if local.exists() {
            Some(local)
        } else {
            dirs_path()
                .map(|home| home.join("config.toml"))
                .filter(|global| global.exists())
        }
    };

    let config = match config_path {
        Some(path) => {
            tracing::debug!("loading config from {}", path.display());
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config: {}", path.display()))?;
            parse_config_str(&content)
                .with_context(|| format!("failed to parse config: {}", path.display()))?
        }
        None => MockprepConfig::default(),
    };

    Ok(apply_env(config))
}

/// Parse a config file body.
pub fn parse_config_str(content: &str) -> Result<MockprepConfig> {
    Ok(toml::from_str::<MockprepConfig>(content)?)
}

fn apply_env(mut config: MockprepConfig) -> MockprepConfig {
    if let Ok(key) = std::env::var(SCORER_KEY_ENV) {
        if let ScorerConfig::Http { api_key, .. } = &mut config.scorer {
            *api_key = Some(key);
        }
    }
    config.scorer = resolve_scorer_config(&config.scorer);
    let state_dir = config.session.state_dir.to_string_lossy().into_owned();
    if state_dir.contains("${") {
        config.session.state_dir = PathBuf::from(resolve_env_vars(&state_dir));
    }
    config
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".config").join("mockprep"))
}

/// Create a scorer instance from its configuration.
pub fn create_scorer(config: &ScorerConfig) -> Result<Arc<dyn Scorer>> {
    match config {
        ScorerConfig::Http {
            base_url,
            api_key,
            timeout_secs,
        } => {
            if base_url.trim().is_empty() {
                anyhow::bail!("http scorer needs a base_url");
            }
            let scorer = HttpScorer::new(base_url, api_key.clone(), *timeout_secs)
                .context("failed to create HTTP scorer")?;
            Ok(Arc::new(scorer))
        }
        ScorerConfig::Mock {
            fail_first,
            latency_ms,
        } => Ok(Arc::new(
            MockScorer::failing_first(*fail_first).with_latency(Duration::from_millis(*latency_ms)),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_env_vars_basic() {
        std::env::set_var("_MOCKPREP_TEST_VAR", "hello");
        assert_eq!(resolve_env_vars("${_MOCKPREP_TEST_VAR}"), "hello");
        assert_eq!(
            resolve_env_vars("prefix_${_MOCKPREP_TEST_VAR}_suffix"),
            "prefix_hello_suffix"
        );
        std::env::remove_var("_MOCKPREP_TEST_VAR");
    }

    #[test]
    fn default_config() {
        let config = MockprepConfig::default();
        assert!(matches!(config.scorer, ScorerConfig::Mock { fail_first: 0, .. }));
        assert_eq!(config.queue.base_delay_ms, 2000);
        assert_eq!(config.queue.max_delay_ms, 60_000);
        assert_eq!(config.session.tick_interval_ms, 1000);

        let queue = config.queue.to_queue_config();
        assert_eq!(queue.base_delay, Duration::from_secs(2));
        assert_eq!(queue.max_retries, Some(8));
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[scorer]
type = "http"
base_url = "https://scoring.example.com"
api_key = "sk-test"
timeout_secs = 10

[queue]
base_delay_ms = 500
max_retries = 3

[session]
tick_interval_ms = 250
state_dir = "/var/lib/mockprep"
"#;
        let config = parse_config_str(toml_str).unwrap();
        assert!(matches!(
            config.scorer,
            ScorerConfig::Http {
                timeout_secs: Some(10),
                ..
            }
        ));
        assert_eq!(config.queue.base_delay_ms, 500);
        assert_eq!(config.queue.max_delay_ms, 60_000);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.session.spool_dir(), PathBuf::from("/var/lib/mockprep/spool"));
        assert_eq!(config.session.tick_interval(), Duration::from_millis(250));
    }

    #[test]
    fn debug_masks_api_key() {
        let config = ScorerConfig::Http {
            base_url: "https://scoring.example.com".into(),
            api_key: Some("sk-secret".into()),
            timeout_secs: None,
        };
        let printed = format!("{config:?}");
        assert!(!printed.contains("sk-secret"));
        assert!(printed.contains("***"));
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let err = load_config_from(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(err.to_string().contains("config file not found"));
    }

    #[test]
    fn load_from_file_resolves_env_vars() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mockprep.toml");
        std::fs::write(
            &path,
            r#"
[scorer]
type = "http"
base_url = "${_MOCKPREP_TEST_URL}"
"#,
        )
        .unwrap();
        std::env::set_var("_MOCKPREP_TEST_URL", "https://scoring.test");

        let config = load_config_from(Some(&path)).unwrap();
        std::env::remove_var("_MOCKPREP_TEST_URL");
        match config.scorer {
            ScorerConfig::Http { base_url, .. } => assert_eq!(base_url, "https://scoring.test"),
            other => panic!("unexpected scorer config: {other:?}"),
        }
    }

    #[test]
    fn factory_builds_configured_scorer() {
        let mock = create_scorer(&ScorerConfig::default()).unwrap();
        assert_eq!(mock.name(), "mock");

        let http = create_scorer(&ScorerConfig::Http {
            base_url: "http://localhost:9".into(),
            api_key: None,
            timeout_secs: None,
        })
        .unwrap();
        assert_eq!(http.name(), "http");

        assert!(create_scorer(&ScorerConfig::Http {
            base_url: " ".into(),
            api_key: None,
            timeout_secs: None,
        })
        .is_err());
    }
}
