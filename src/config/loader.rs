// Configuration loader: service list parsing with environment variable
// substitution

use super::types::*;
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the recorder configuration (optional) and the service list.
    pub fn load(
        config_path: Option<&Path>,
        service_list_path: &Path,
    ) -> Result<RecorderConfig> {
        let mut config = Self::load_settings(config_path)?;
        config.services = Self::load_service_list(service_list_path)?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Load only the recorder settings, without a service list (bootlog
    /// mode).
    pub fn load_settings(config_path: Option<&Path>) -> Result<RecorderConfig> {
        match config_path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                let content = Self::substitute_env_vars(&content);
                serde_yaml::from_str(&content).context("failed to parse YAML configuration")
            }
            None => Ok(RecorderConfig::default()),
        }
    }

    /// Parse the service list file: `name: [port, should_log, decimation,
    /// qlog_freq, remote_host?]` per entry. Entries with fewer elements get
    /// the trailing fields defaulted.
    pub fn load_service_list(path: &Path) -> Result<Vec<ServiceConfig>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read service list {}", path.display()))?;
        let content = Self::substitute_env_vars(&content);
        Self::parse_service_list(&content)
    }

    fn parse_service_list(content: &str) -> Result<Vec<ServiceConfig>> {
        // BTreeMap for a deterministic subscription order
        let raw: BTreeMap<String, Vec<serde_yaml::Value>> =
            serde_yaml::from_str(content).context("failed to parse service list YAML")?;

        let mut services = Vec::with_capacity(raw.len());
        for (name, fields) in raw {
            if fields.len() < 2 {
                bail!("service '{}': expected at least [port, should_log]", name);
            }
            let port = fields[0]
                .as_u64()
                .with_context(|| format!("service '{}': port must be an integer", name))?;
            let port =
                u16::try_from(port).with_context(|| format!("service '{}': port out of range", name))?;
            let should_log = fields[1]
                .as_bool()
                .with_context(|| format!("service '{}': should_log must be a bool", name))?;
            let qlog_freq = match fields.get(3) {
                Some(v) if !v.is_null() => v
                    .as_i64()
                    .with_context(|| format!("service '{}': qlog_freq must be an integer", name))?
                    as i32,
                _ => 0,
            };
            let remote_host = match fields.get(4) {
                Some(v) if !v.is_null() => Some(
                    v.as_str()
                        .with_context(|| format!("service '{}': host must be a string", name))?
                        .to_string(),
                ),
                _ => None,
            };
            services.push(ServiceConfig {
                name,
                port,
                should_log,
                qlog_freq,
                remote_host,
            });
        }
        Ok(services)
    }

    /// Substitute ${VAR} and ${VAR:-default} patterns with environment variables
    fn substitute_env_vars(content: &str) -> String {
        let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]+))?\}").unwrap();

        re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str());

            match std::env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    if let Some(default) = default_value {
                        default.to_string()
                    } else {
                        // Keep original if no default and var not found
                        format!("${{{}}}", var_name)
                    }
                }
            }
        })
        .to_string()
    }

    /// Validate configuration
    fn validate(config: &RecorderConfig) -> Result<()> {
        if config.recorder.segment_length_seconds <= 0.0 {
            bail!("recorder.segment_length_seconds must be > 0");
        }

        if config.recorder.camera_fps == 0 {
            bail!("recorder.camera_fps must be > 0");
        }

        if config.recorder.log_root.as_os_str().is_empty() {
            bail!("recorder.log_root cannot be empty");
        }

        for service in &config.services {
            if service.qlog_freq < 0 {
                bail!("service '{}': qlog_freq cannot be negative", service.name);
            }
            if service.should_log && service.port == 0 {
                bail!("service '{}': port cannot be 0", service.name);
            }
        }

        let frame_topics = config.services.iter().filter(|s| s.is_frame()).count();
        if frame_topics > 1 {
            bail!("more than one '{}' service entry", FRAME_SERVICE);
        }

        Ok(())
    }
}

/// Default service list location: `../service_list.yaml` relative to the
/// executable, matching how the rest of the stack ships it.
pub fn default_service_list_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|d| d.join("../service_list.yaml")))
        .unwrap_or_else(|| PathBuf::from("service_list.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("TEST_RECORDER_VAR", "test_value");

        let input = "host: ${TEST_RECORDER_VAR}";
        let output = ConfigLoader::substitute_env_vars(input);
        assert_eq!(output, "host: test_value");

        std::env::remove_var("TEST_RECORDER_VAR");
    }

    #[test]
    fn test_env_var_with_default() {
        std::env::remove_var("TEST_RECORDER_VAR2");

        let input = "root: ${TEST_RECORDER_VAR2:-/data/media}";
        let output = ConfigLoader::substitute_env_vars(input);
        assert_eq!(output, "root: /data/media");
    }

    #[test]
    fn test_parse_service_list_full_entries() {
        let yaml = r#"
frame:   [8002, true, 50., 1]
can:     [8006, true, 100., 100]
gps_ext: [8032, true, 10., 1, "192.168.5.10"]
thermal: [8005, false]
"#;
        let services = ConfigLoader::parse_service_list(yaml).unwrap();
        assert_eq!(services.len(), 4);

        let frame = services.iter().find(|s| s.name == "frame").unwrap();
        assert_eq!(frame.port, 8002);
        assert!(frame.should_log);
        assert_eq!(frame.qlog_freq, 1);
        assert!(frame.is_frame());
        assert!(!frame.patch_timestamp());
        assert_eq!(frame.endpoint(), "127.0.0.1:8002");

        let gps = services.iter().find(|s| s.name == "gps_ext").unwrap();
        assert!(gps.patch_timestamp());
        assert_eq!(gps.endpoint(), "192.168.5.10:8032");

        let thermal = services.iter().find(|s| s.name == "thermal").unwrap();
        assert!(!thermal.should_log);
        assert_eq!(thermal.qlog_freq, 0);
    }

    #[test]
    fn test_parse_service_list_null_qlog_freq() {
        let yaml = "sensor: [8010, true, ~, ~]\n";
        let services = ConfigLoader::parse_service_list(yaml).unwrap();
        assert_eq!(services[0].qlog_freq, 0);
    }

    #[test]
    fn test_parse_rejects_short_entry() {
        let yaml = "bad: [8010]\n";
        assert!(ConfigLoader::parse_service_list(yaml).is_err());
    }

    #[test]
    fn test_validation_rejects_negative_qlog_freq() {
        let mut config = RecorderConfig::default();
        config.services.push(ServiceConfig {
            name: "x".into(),
            port: 1,
            should_log: true,
            qlog_freq: -2,
            remote_host: None,
        });
        assert!(ConfigLoader::validate(&config).is_err());
    }

    #[test]
    fn test_validation_rejects_duplicate_frame_topic() {
        let mut config = RecorderConfig::default();
        for port in [1, 2] {
            config.services.push(ServiceConfig {
                name: FRAME_SERVICE.into(),
                port,
                should_log: true,
                qlog_freq: 0,
                remote_host: None,
            });
        }
        let err = ConfigLoader::validate(&config).unwrap_err();
        assert!(err.to_string().contains("frame"));
    }

    #[test]
    fn test_validation_rejects_zero_segment_length() {
        let mut config = RecorderConfig::default();
        config.recorder.segment_length_seconds = 0.0;
        assert!(ConfigLoader::validate(&config).is_err());
    }
}
