// worker settings: defaults, overlaid by MLWORKER_* environment variables,
// then by command line flags.

use std::{env, path::PathBuf, time::Duration};

use mlworker_core::{is_valid_project_key, ValidatorConfig};

use crate::error::{ArtifactError, ConfigError};

pub const ENV_PREFIX: &str = "MLWORKER_";

// Configuration for a worker process
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    // root for artifacts, caches and the bridge socket
    pub home: PathBuf,
    // co-located listener address; port `None` picks a free port
    pub host: String,
    pub port: Option<u16>,
    // STOMP control plane (host:port)
    pub control_addr: String,
    // token presented by co-located workers on CONNECT
    pub internal_token: String,
    // frame limits of the RPC listener
    pub max_receive_message_mb: usize,
    pub max_send_message_mb: usize,
    // largest STOMP reply fragment until the control plane says otherwise
    pub stomp_reply_size: usize,
    // wait for CONNECTED on the control channel
    pub connect_timeout: Duration,
    // in-flight request drain time on shutdown
    pub shutdown_grace: Duration,
    // max delay between bridge reconnect attempts
    pub bridge_max_backoff: Duration,
    pub cache_enabled: bool,
    // shared token required on request envelopes, if set
    pub request_token: Option<String>,
    pub validator: ValidatorConfig,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            home: default_home(),
            host: "localhost".to_string(),
            port: None,
            control_addr: "localhost:9000".to_string(),
            internal_token: "inoki-test-token".to_string(),
            max_receive_message_mb: 1024,
            max_send_message_mb: 1024,
            stomp_reply_size: 8 * 1024,
            connect_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(3),
            bridge_max_backoff: Duration::from_secs(30),
            cache_enabled: true,
            request_token: None,
            validator: ValidatorConfig::default(),
        }
    }
}

fn default_home() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(env::temp_dir)
        .join(".mlworker")
}

impl WorkerSettings {
    // defaults overlaid with the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    // same as `from_env`, reading variables through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));
        let mut settings = Self::default();

        if let Some(home) = var("HOME") {
            if home.trim().is_empty() {
                return Err(ConfigError::MissingHome);
            }
            settings.home = PathBuf::from(home);
        }
        if let Some(host) = var("HOST") {
            settings.host = host;
        }
        if let Some(port) = var("PORT") {
            settings.port = Some(parse("PORT", &port)?);
        }
        if let Some(addr) = var("CONTROL_ADDR") {
            settings.control_addr = addr;
        }
        if let Some(token) = var("INTERNAL_TOKEN") {
            settings.internal_token = token;
        }
        if let Some(mb) = var("MAX_RECEIVE_MESSAGE_MB") {
            settings.max_receive_message_mb = parse("MAX_RECEIVE_MESSAGE_MB", &mb)?;
        }
        if let Some(mb) = var("MAX_SEND_MESSAGE_MB") {
            settings.max_send_message_mb = parse("MAX_SEND_MESSAGE_MB", &mb)?;
        }
        if let Some(size) = var("STOMP_REPLY_SIZE") {
            settings.stomp_reply_size = parse("STOMP_REPLY_SIZE", &size)?;
        }
        if let Some(secs) = var("CONNECT_TIMEOUT_SECS") {
            settings.connect_timeout = Duration::from_secs(parse("CONNECT_TIMEOUT_SECS", &secs)?);
        }
        if let Some(secs) = var("SHUTDOWN_GRACE_SECS") {
            settings.shutdown_grace = Duration::from_secs(parse("SHUTDOWN_GRACE_SECS", &secs)?);
        }
        if let Some(flag) = var("CACHE_ENABLED") {
            settings.cache_enabled = parse("CACHE_ENABLED", &flag)?;
        }
        if let Some(token) = var("REQUEST_TOKEN") {
            settings.request_token = Some(token).filter(|t| !t.is_empty());
        }
        if let Some(rows) = var("MAX_ROWS") {
            settings.validator.max_rows_per_dataframe = parse("MAX_ROWS", &rows)?;
        }

        Ok(settings)
    }

    pub fn max_receive_bytes(&self) -> usize {
        self.max_receive_message_mb.saturating_mul(1024 * 1024)
    }

    pub fn max_send_bytes(&self) -> usize {
        self.max_send_message_mb.saturating_mul(1024 * 1024)
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.home.join("projects")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.home.join("run")
    }

    pub fn socket_path(&self, worker_id: &str) -> PathBuf {
        self.run_dir().join(format!("ml-worker-{worker_id}.sock"))
    }

    pub fn inspection_dir(
        &self,
        project_key: &str,
        inspection_id: i64,
    ) -> Result<PathBuf, ArtifactError> {
        if !is_valid_project_key(project_key) {
            return Err(ArtifactError::InvalidProjectKey(project_key.to_string()));
        }
        Ok(self
            .projects_dir()
            .join(project_key)
            .join("inspections")
            .join(inspection_id.to_string()))
    }
}

fn parse<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
        name: format!("{ENV_PREFIX}{name}"),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_match_the_control_plane() {
        let settings = WorkerSettings::default();
        assert_eq!(settings.control_addr, "localhost:9000");
        assert_eq!(settings.connect_timeout, Duration::from_secs(10));
        assert_eq!(settings.shutdown_grace, Duration::from_secs(3));
        assert!(settings.cache_enabled);
    }

    #[test]
    fn environment_overrides_defaults() {
        let settings = WorkerSettings::from_lookup(lookup(&[
            ("MLWORKER_HOME", "/srv/worker"),
            ("MLWORKER_PORT", "40051"),
            ("MLWORKER_CACHE_ENABLED", "false"),
            ("MLWORKER_MAX_RECEIVE_MESSAGE_MB", "2"),
        ]))
        .expect("settings");
        assert_eq!(settings.home, PathBuf::from("/srv/worker"));
        assert_eq!(settings.port, Some(40051));
        assert!(!settings.cache_enabled);
        assert_eq!(settings.max_receive_bytes(), 2 * 1024 * 1024);
        assert_eq!(
            settings.socket_path("EXTERNAL"),
            PathBuf::from("/srv/worker/run/ml-worker-EXTERNAL.sock")
        );
    }

    #[test]
    fn bad_values_name_the_variable() {
        let err = WorkerSettings::from_lookup(lookup(&[("MLWORKER_PORT", "http")])).unwrap_err();
        assert!(err.to_string().contains("MLWORKER_PORT"));
    }
}
