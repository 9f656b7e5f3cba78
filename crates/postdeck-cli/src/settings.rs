//! Layered settings: defaults, `postdeck.toml`, `POSTDECK_*` environment

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use postdeck_client::{
    BatchConfig, ClientConfig, MultipartStrategy, RetryPolicy, ScheduleConfig, UploadProfile,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings file looked up in the working directory
pub const DEFAULT_SETTINGS_FILE: &str = "postdeck.toml";

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "POSTDECK";

/// Resolved settings for one invocation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Record API endpoint
    pub api_url: String,
    /// Storage API endpoint
    pub storage_url: String,
    /// Bearer token, overriding the saved session
    pub token: Option<String>,
    /// Upload strategy name
    pub strategy: String,
    /// Request timeout for API calls
    pub timeout_secs: u64,
    /// First segment of every media path
    pub folder_prefix: String,
    /// Part size override in bytes
    pub chunk_size: Option<u64>,
    /// Parts in flight override
    pub max_concurrent: Option<usize>,
    /// Attempts per part override
    pub max_attempts: Option<u32>,
    /// Where `session.json` lives
    pub config_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        let client = ClientConfig::default();
        Self {
            api_url: client.api_endpoint,
            storage_url: client.storage_endpoint,
            token: None,
            strategy: MultipartStrategy::default().to_string(),
            timeout_secs: client.timeout.as_secs(),
            folder_prefix: ScheduleConfig::default().folder_prefix,
            chunk_size: None,
            max_concurrent: None,
            max_attempts: None,
            config_dir: None,
        }
    }
}

impl Settings {
    /// Load settings from `file` (or `postdeck.toml` if present) and the environment
    pub fn load(file: Option<&Path>) -> Result<Self> {
        Self::layered(file, Environment::with_prefix(ENV_PREFIX).try_parsing(true))
    }

    /// Load settings from `file` and an explicit environment source
    pub fn layered(file: Option<&Path>, environment: Environment) -> Result<Self> {
        let file_source = match file {
            Some(path) => File::from(path).required(true),
            None => File::from(Path::new(DEFAULT_SETTINGS_FILE)).required(false),
        };

        Config::builder()
            .add_source(file_source)
            .add_source(environment)
            .build()
            .context("failed to read settings")?
            .try_deserialize()
            .context("invalid settings")
    }

    /// Parsed upload strategy
    pub fn strategy(&self) -> Result<MultipartStrategy> {
        self.strategy
            .parse()
            .with_context(|| format!("invalid strategy setting {:?}", self.strategy))
    }

    /// Client configuration carrying `token`
    pub fn client_config(&self, token: Option<String>) -> ClientConfig {
        let mut config = ClientConfig::new(&self.api_url, &self.storage_url)
            .with_timeout(Duration::from_secs(self.timeout_secs));
        config.access_token = token;
        config
    }

    /// Upload profile for `strategy` with any overrides applied
    pub fn profile(&self, strategy: MultipartStrategy) -> Result<UploadProfile> {
        let mut profile = UploadProfile::for_strategy(strategy);
        if let Some(chunk_size) = self.chunk_size {
            profile = profile.with_chunk_size(chunk_size);
        }
        if let Some(max_concurrent) = self.max_concurrent {
            profile = profile.with_max_concurrent(max_concurrent);
        }
        if let Some(max_attempts) = self.max_attempts {
            let retry = RetryPolicy {
                max_attempts,
                ..profile.retry
            };
            profile = profile.with_retry(retry);
        }
        profile.validate().context("invalid upload settings")?;
        Ok(profile)
    }

    /// Saga configuration for `strategy`
    pub fn schedule_config(&self, strategy: MultipartStrategy) -> Result<ScheduleConfig> {
        let batch = BatchConfig::new(strategy).with_profile(self.profile(strategy)?);
        Ok(ScheduleConfig::default()
            .with_folder_prefix(&self.folder_prefix)
            .with_batch(batch))
    }

    /// Directory holding the saved session
    pub fn config_dir(&self) -> PathBuf {
        if let Some(dir) = &self.config_dir {
            return dir.clone();
        }
        if let Some(xdg) = env::var_os("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join("postdeck");
        }
        match env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".config").join("postdeck"),
            None => PathBuf::from(".postdeck"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::Map;
    use std::fs;

    fn no_env() -> Environment {
        Environment::with_prefix(ENV_PREFIX).source(Some(Map::new()))
    }

    fn env(vars: &[(&str, &str)]) -> Environment {
        let map = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<Map<String, String>>();
        Environment::with_prefix(ENV_PREFIX)
            .try_parsing(true)
            .source(Some(map))
    }

    #[test]
    fn test_defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(Settings::layered(Some(&missing), no_env()).is_err());

        let settings: Settings = Config::builder()
            .add_source(no_env())
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.strategy().unwrap(), MultipartStrategy::Multipart);
    }

    #[test]
    fn test_file_then_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("postdeck.toml");
        fs::write(
            &path,
            r#"
api_url = "https://api.file.test"
storage_url = "https://files.file.test"
strategy = "presigned-parts"
max_concurrent = 4
"#,
        )
        .unwrap();

        let settings = Settings::layered(
            Some(&path),
            env(&[
                ("POSTDECK_API_URL", "https://api.env.test"),
                ("POSTDECK_MAX_ATTEMPTS", "5"),
            ]),
        )
        .unwrap();

        assert_eq!(settings.api_url, "https://api.env.test");
        assert_eq!(settings.storage_url, "https://files.file.test");
        assert_eq!(settings.strategy().unwrap(), MultipartStrategy::PresignedParts);

        let profile = settings.profile(MultipartStrategy::PresignedParts).unwrap();
        assert_eq!(profile.max_concurrent, 4);
        assert_eq!(profile.retry.max_attempts, 5);
        assert_eq!(profile.chunk_size, UploadProfile::presigned_parts().chunk_size);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let settings = Settings {
            strategy: "ftp".to_string(),
            max_concurrent: Some(0),
            ..Default::default()
        };
        assert!(settings.strategy().is_err());
        assert!(settings.profile(MultipartStrategy::Multipart).is_err());
    }

    #[test]
    fn test_client_config_and_schedule_config() {
        let settings = Settings {
            folder_prefix: "media".to_string(),
            timeout_secs: 7,
            ..Default::default()
        };
        let client = settings.client_config(Some("tok".to_string()));
        assert_eq!(client.access_token.as_deref(), Some("tok"));
        assert_eq!(client.timeout, Duration::from_secs(7));

        let schedule = settings.schedule_config(MultipartStrategy::Multipart).unwrap();
        assert_eq!(schedule.folder_prefix, "media");
        assert_eq!(schedule.batch.strategy, MultipartStrategy::Multipart);
    }

    #[test]
    fn test_explicit_config_dir() {
        let settings = Settings {
            config_dir: Some(PathBuf::from("/tmp/postdeck-test")),
            ..Default::default()
        };
        assert_eq!(settings.config_dir(), PathBuf::from("/tmp/postdeck-test"));
    }
}
