use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use cardsmith_comfyui::retry::RetryPolicy;
use cardsmith_pipeline::tracker::TrackerConfig;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(()),
        }
    }
}

/// Worker configuration loaded from environment variables.
///
/// Every field has a default suitable for a local ComfyUI install.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub comfyui_url: String,
    pub request_timeout: Duration,
    pub user_records_csv: PathBuf,
    pub keyword_mapping_path: PathBuf,
    pub workflow_template_path: PathBuf,
    /// Holds `P<user_id>.<ext>` reference images.
    pub user_images_dir: PathBuf,
    pub input_seeds_dir: PathBuf,
    /// Pin one style seed. Unset runs every seed found in `input_seeds_dir`.
    pub style_seed_id: Option<String>,
    pub output_dir: PathBuf,
    pub tracker: TrackerConfig,
    pub retry: RetryPolicy,
    pub run_limit: Option<usize>,
    pub run_users: Option<Vec<String>>,
    pub log_format: LogFormat,
}

impl RunnerConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                        | Default                                          |
    /// |--------------------------------|--------------------------------------------------|
    /// | `COMFYUI_URL`                  | `http://127.0.0.1:8188`                          |
    /// | `COMFYUI_REQUEST_TIMEOUT_SECS` | `30`                                             |
    /// | `USER_RECORDS_CSV`             | `data/personalization_seeds/user_preferences.csv`|
    /// | `KEYWORD_MAPPING_PATH`         | `config/keyword_mapping.json`                    |
    /// | `WORKFLOW_TEMPLATE_PATH`       | `config/workflow_template.json`                  |
    /// | `USER_IMAGES_DIR`              | `data/personalization_seeds/images`              |
    /// | `INPUT_SEEDS_DIR`              | `data/input_seeds`                               |
    /// | `STYLE_SEED_ID`                | unset (every seed in `INPUT_SEEDS_DIR`)          |
    /// | `OUTPUT_DIR`                   | `outputs`                                        |
    /// | `MAX_CONCURRENT_JOBS`          | `2`                                              |
    /// | `POLL_INTERVAL_SECS`           | `2`                                              |
    /// | `JOB_TIMEOUT_SECS`             | `300`                                            |
    /// | `RETRY_MAX_ATTEMPTS`           | `5`                                              |
    /// | `RETRY_INITIAL_DELAY_MS`       | `1000`                                           |
    /// | `RETRY_MAX_DELAY_MS`           | `30000`                                          |
    /// | `FORCE_RERUN`                  | `false`                                          |
    /// | `RUN_LIMIT`                    | unset                                            |
    /// | `RUN_USERS`                    | unset (comma-separated user ids)                 |
    /// | `LOG_FORMAT`                   | `text`                                           |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let path = |name: &str, default: &str| PathBuf::from(var(name).unwrap_or_else(|| default.into()));

        let concurrency: usize = parse(&var, "MAX_CONCURRENT_JOBS", 2)?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid {
                var: "MAX_CONCURRENT_JOBS",
                value: "0".into(),
            });
        }

        let tracker = TrackerConfig {
            concurrency,
            poll_interval: Duration::from_secs(parse(&var, "POLL_INTERVAL_SECS", 2)?),
            max_job_duration: Duration::from_secs(parse(&var, "JOB_TIMEOUT_SECS", 300)?),
            force_rerun: parse_bool(&var, "FORCE_RERUN")?,
        };

        let retry = RetryPolicy {
            max_attempts: parse(&var, "RETRY_MAX_ATTEMPTS", 5)?,
            initial_delay: Duration::from_millis(parse(&var, "RETRY_INITIAL_DELAY_MS", 1000)?),
            max_delay: Duration::from_millis(parse(&var, "RETRY_MAX_DELAY_MS", 30_000)?),
            ..RetryPolicy::default()
        };

        let run_limit = match var("RUN_LIMIT") {
            Some(value) => Some(value.parse().map_err(|_| ConfigError::Invalid {
                var: "RUN_LIMIT",
                value,
            })?),
            None => None,
        };

        let run_users = var("RUN_USERS").map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        });

        Ok(Self {
            comfyui_url: var("COMFYUI_URL").unwrap_or_else(|| "http://127.0.0.1:8188".into()),
            request_timeout: Duration::from_secs(parse(&var, "COMFYUI_REQUEST_TIMEOUT_SECS", 30)?),
            user_records_csv: path(
                "USER_RECORDS_CSV",
                "data/personalization_seeds/user_preferences.csv",
            ),
            keyword_mapping_path: path("KEYWORD_MAPPING_PATH", "config/keyword_mapping.json"),
            workflow_template_path: path("WORKFLOW_TEMPLATE_PATH", "config/workflow_template.json"),
            user_images_dir: path("USER_IMAGES_DIR", "data/personalization_seeds/images"),
            input_seeds_dir: path("INPUT_SEEDS_DIR", "data/input_seeds"),
            style_seed_id: var("STYLE_SEED_ID"),
            output_dir: path("OUTPUT_DIR", "outputs"),
            tracker,
            retry,
            run_limit,
            run_users,
            log_format: parse(&var, "LOG_FORMAT", LogFormat::Text)?,
        })
    }

    pub fn state_path(&self) -> PathBuf {
        self.output_dir.join("batch_state.json")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.output_dir.join("final_images")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.output_dir.join("manifest.json")
    }

    pub fn features_path(&self) -> PathBuf {
        self.output_dir.join("features.json")
    }
}

fn parse<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match var(name) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { var: name, value }),
        None => Ok(default),
    }
}

fn parse_bool(var: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<bool, ConfigError> {
    match var(name).map(|v| v.to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no") => Ok(false),
        Some(value) => Err(ConfigError::Invalid { var: name, value }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<RunnerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RunnerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.comfyui_url, "http://127.0.0.1:8188");
        assert_eq!(config.tracker.concurrency, 2);
        assert_eq!(config.tracker.poll_interval, Duration::from_secs(2));
        assert_eq!(config.tracker.max_job_duration, Duration::from_secs(300));
        assert!(!config.tracker.force_rerun);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.state_path(), PathBuf::from("outputs/batch_state.json"));
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.style_seed_id.is_none());
        assert!(config.run_users.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("MAX_CONCURRENT_JOBS", "4"),
            ("JOB_TIMEOUT_SECS", "90"),
            ("RETRY_INITIAL_DELAY_MS", "250"),
            ("FORCE_RERUN", "true"),
            ("RUN_USERS", " 3, 7,,12 "),
            ("RUN_LIMIT", "10"),
            ("LOG_FORMAT", "JSON"),
            ("OUTPUT_DIR", "/tmp/batch"),
            ("STYLE_SEED_ID", "ukiyo"),
        ])
        .unwrap();

        assert_eq!(config.tracker.concurrency, 4);
        assert_eq!(config.tracker.max_job_duration, Duration::from_secs(90));
        assert_eq!(config.retry.initial_delay, Duration::from_millis(250));
        assert!(config.tracker.force_rerun);
        assert_eq!(config.run_users, Some(vec!["3".into(), "7".into(), "12".into()]));
        assert_eq!(config.run_limit, Some(10));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.images_dir(), PathBuf::from("/tmp/batch/final_images"));
        assert_eq!(config.style_seed_id.as_deref(), Some("ukiyo"));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = load(&[("POLL_INTERVAL_SECS", "  "), ("STYLE_SEED_ID", "")]).unwrap();
        assert_eq!(config.tracker.poll_interval, Duration::from_secs(2));
        assert!(config.style_seed_id.is_none());
    }

    #[test]
    fn invalid_values_name_the_variable() {
        assert_matches!(
            load(&[("POLL_INTERVAL_SECS", "soon")]),
            Err(ConfigError::Invalid { var: "POLL_INTERVAL_SECS", value }) if value == "soon"
        );
        assert_matches!(
            load(&[("MAX_CONCURRENT_JOBS", "0")]),
            Err(ConfigError::Invalid { var: "MAX_CONCURRENT_JOBS", .. })
        );
        assert_matches!(
            load(&[("FORCE_RERUN", "maybe")]),
            Err(ConfigError::Invalid { var: "FORCE_RERUN", .. })
        );
        assert_matches!(
            load(&[("LOG_FORMAT", "xml")]),
            Err(ConfigError::Invalid { var: "LOG_FORMAT", .. })
        );
    }
}
