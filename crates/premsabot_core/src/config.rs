use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "premsabot/0.1";
pub const DEFAULT_SEARCH_API_URL: &str =
    "https://cercadorgovern.extranet.gencat.cat/documents-ca//_search";
pub const DEFAULT_COMMONS_API_URL: &str = "https://commons.wikimedia.org/w/api.php";
pub const DEFAULT_LEDGER_PREFIX: &str = "User:CobainBot/GenCatImages/";
pub const DEFAULT_STATE_DIR: &str = ".premsabot";
pub const DEFAULT_PAGE_SIZE: usize = 250;
pub const DEFAULT_MAX_FILENAME_BYTES: usize = 218;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct BotConfig {
    #[serde(default)]
    pub search: SearchSection,
    #[serde(default)]
    pub commons: CommonsSection,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub upload: UploadSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct SearchSection {
    pub api_url: Option<String>,
    pub page_size: Option<usize>,
    pub timeout_ms: Option<u64>,
    /// Bounds of the randomized delay before each page fetch, in seconds.
    pub delay_min_secs: Option<u64>,
    pub delay_max_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct CommonsSection {
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
    pub ledger_prefix: Option<String>,
    pub timeout_ms: Option<u64>,
    pub rate_limit_read_ms: Option<u64>,
    pub rate_limit_write_ms: Option<u64>,
    pub max_retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct PathsSection {
    pub state_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct UploadSection {
    pub max_filename_bytes: Option<usize>,
}

impl BotConfig {
    /// Resolve the search API URL: env PREMSABOT_SEARCH_API_URL > config > default.
    pub fn search_api_url(&self) -> String {
        env_value(
            "PREMSABOT_SEARCH_API_URL",
            self.search
                .api_url
                .as_deref()
                .unwrap_or(DEFAULT_SEARCH_API_URL),
        )
    }

    /// Resolve the Commons API URL: env COMMONS_API_URL > config > default.
    pub fn commons_api_url(&self) -> String {
        env_value(
            "COMMONS_API_URL",
            self.commons
                .api_url
                .as_deref()
                .unwrap_or(DEFAULT_COMMONS_API_URL),
        )
    }

    /// Resolve user agent: env PREMSABOT_USER_AGENT > config > default.
    pub fn user_agent(&self) -> String {
        env_value(
            "PREMSABOT_USER_AGENT",
            self.commons
                .user_agent
                .as_deref()
                .unwrap_or(DEFAULT_USER_AGENT),
        )
    }

    pub fn ledger_prefix(&self) -> String {
        self.commons
            .ledger_prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_LEDGER_PREFIX.to_string())
    }

    pub fn page_size(&self) -> usize {
        self.search.page_size.unwrap_or(DEFAULT_PAGE_SIZE)
    }

    pub fn delay_bounds_secs(&self) -> (u64, u64) {
        (
            self.search.delay_min_secs.unwrap_or(3),
            self.search.delay_max_secs.unwrap_or(10),
        )
    }

    pub fn max_filename_bytes(&self) -> usize {
        self.upload
            .max_filename_bytes
            .unwrap_or(DEFAULT_MAX_FILENAME_BYTES)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.paths
            .state_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR))
    }

    pub fn batch_path(&self) -> PathBuf {
        self.state_dir().join("gencat_batch.json")
    }

    pub fn queue_path(&self) -> PathBuf {
        self.state_dir().join("gencat_queue.json")
    }

    /// Reject configurations that would fail mid-run: empty endpoints, a zero
    /// page size, or inverted delay bounds.
    pub fn validate(&self) -> Result<()> {
        if self.search_api_url().trim().is_empty() {
            bail!("search API URL is empty");
        }
        if self.commons_api_url().trim().is_empty() {
            bail!("Commons API URL is empty");
        }
        if self.ledger_prefix().trim().is_empty() {
            bail!("ledger page prefix is empty");
        }
        if self.page_size() == 0 {
            bail!("search page size must be at least 1");
        }
        let (min_delay, max_delay) = self.delay_bounds_secs();
        if min_delay > max_delay {
            bail!("delay_min_secs ({min_delay}) exceeds delay_max_secs ({max_delay})");
        }
        if self.max_filename_bytes() < 8 {
            bail!("max_filename_bytes is too small to hold any usable name");
        }
        Ok(())
    }
}

/// Load and parse a BotConfig from a TOML file. Returns defaults if the file
/// doesn't exist.
pub fn load_config(config_path: &Path) -> Result<BotConfig> {
    if !config_path.exists() {
        return Ok(BotConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: BotConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_value(key: &str, default: &str) -> String {
    if let Ok(value) = env::var(key) {
        let trimmed = value.trim().to_string();
        if !trimmed.is_empty() {
            return trimmed;
        }
    }
    default.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_validates() {
        let config = BotConfig::default();
        config.validate().expect("defaults are usable");
        assert_eq!(config.page_size(), DEFAULT_PAGE_SIZE);
        assert_eq!(config.delay_bounds_secs(), (3, 10));
        assert_eq!(config.max_filename_bytes(), 218);
        assert!(config.batch_path().ends_with(".premsabot/gencat_batch.json"));
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/premsabot.toml")).expect("load");
        assert_eq!(config.search_api_url(), DEFAULT_SEARCH_API_URL);
    }

    #[test]
    fn load_config_parses_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("premsabot.toml");
        fs::write(
            &config_path,
            r#"
[search]
api_url = "https://search.example/_search"
page_size = 50

[commons]
api_url = "https://wiki.example/w/api.php"
ledger_prefix = "User:TestBot/Ids/"

[paths]
state_dir = "/var/lib/premsabot"

[upload]
max_filename_bytes = 100
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load");
        assert_eq!(config.search_api_url(), "https://search.example/_search");
        assert_eq!(config.page_size(), 50);
        assert_eq!(config.ledger_prefix(), "User:TestBot/Ids/");
        assert_eq!(config.max_filename_bytes(), 100);
        assert_eq!(
            config.queue_path(),
            PathBuf::from("/var/lib/premsabot/gencat_queue.json")
        );
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("premsabot.toml");
        fs::write(&config_path, "[search\napi_url = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn validate_rejects_inverted_delay_bounds() {
        let config = BotConfig {
            search: SearchSection {
                delay_min_secs: Some(20),
                delay_max_secs: Some(5),
                ..SearchSection::default()
            },
            ..BotConfig::default()
        };
        let error = config.validate().expect_err("must fail");
        assert!(error.to_string().contains("delay_min_secs"));
    }

    #[test]
    fn validate_rejects_zero_page_size() {
        let config = BotConfig {
            search: SearchSection {
                page_size: Some(0),
                ..SearchSection::default()
            },
            ..BotConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
