//! Configuration management for the range relay

use crate::error::{RelayError, Result};
use crate::orchestrator::RelayLimits;
use http::header::HeaderName;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Configuration for the range relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    /// Base URI of the primary fetch target; the client path is appended.
    /// Unset or "off" disables the relay.
    #[serde(default)]
    pub fetch_uri: Option<String>,

    /// Variable slot carrying each fetch's target URI (default: "$relay_uri")
    #[serde(default = "default_uri_var")]
    pub uri_var: String,

    /// Variable slot carrying each fetch's Range value (default: "$relay_range")
    #[serde(default = "default_range_var")]
    pub range_var: String,

    /// Failed or short fetches tolerated per request (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Redirect hops followed per request (default: 5)
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,

    /// Response header carrying the total resource size (default: "X-NP-File-Size")
    #[serde(default = "default_size_header")]
    pub size_header: String,

    /// Address the relay listens on
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Per-fetch timeout in seconds (default: 30)
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Metrics endpoint configuration (optional)
    #[serde(default)]
    pub metrics_endpoint: Option<MetricsEndpointConfig>,
}

/// Configuration for the metrics HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsEndpointConfig {
    /// Whether to enable the metrics endpoint (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind the metrics endpoint to (default: "127.0.0.1:9090")
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsEndpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

fn default_uri_var() -> String {
    "$relay_uri".to_string()
}

fn default_range_var() -> String {
    "$relay_range".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_redirects() -> u32 {
    5
}

fn default_size_header() -> String {
    "X-NP-File-Size".to_string()
}

fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_metrics_address() -> String {
    "127.0.0.1:9090".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            fetch_uri: None,
            uri_var: default_uri_var(),
            range_var: default_range_var(),
            max_retries: default_max_retries(),
            max_redirects: default_max_redirects(),
            size_header: default_size_header(),
            listen_address: default_listen_address(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            metrics_endpoint: None,
        }
    }
}

impl RelayConfig {
    /// Load configuration from a YAML file
    ///
    /// # Returns
    /// * `Ok(RelayConfig)` if loading and validation succeed
    /// * `Err(RelayError::ConfigError)` if the file cannot be read or the config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| RelayError::ConfigError(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: RelayConfig = serde_yaml::from_str(content)
            .map_err(|e| RelayError::ConfigError(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - fetch_uri, when enabled, must be an http(s) URI
    /// - uri_var and range_var must be distinct `$name` variables
    /// - max_retries and fetch_timeout_secs must be > 0
    /// - size_header must be a valid header name
    /// - listen_address and an enabled metrics address must be socket addresses
    pub fn validate(&self) -> Result<()> {
        if let Some(target) = self.fetch_target() {
            if !(target.starts_with("http://") || target.starts_with("https://")) {
                return Err(RelayError::ConfigError(format!(
                    "fetch_uri must start with http:// or https://, got '{}'",
                    target
                )));
            }
        }

        for (field, name) in [("uri_var", &self.uri_var), ("range_var", &self.range_var)] {
            if name.len() < 2 || !name.starts_with('$') {
                return Err(RelayError::ConfigError(format!(
                    "{} must be a variable name starting with '$', got '{}'",
                    field, name
                )));
            }
        }
        if self.uri_var == self.range_var {
            return Err(RelayError::ConfigError(
                "uri_var and range_var must name different variables".to_string(),
            ));
        }

        if self.max_retries == 0 {
            return Err(RelayError::ConfigError(
                "max_retries must be greater than 0".to_string(),
            ));
        }

        if self.fetch_timeout_secs == 0 {
            return Err(RelayError::ConfigError(
                "fetch_timeout_secs must be greater than 0".to_string(),
            ));
        }

        HeaderName::from_bytes(self.size_header.as_bytes()).map_err(|_| {
            RelayError::ConfigError(format!("size_header '{}' is not a valid header name", self.size_header))
        })?;

        parse_address("listen_address", &self.listen_address)?;

        if let Some(metrics) = &self.metrics_endpoint {
            if metrics.enabled {
                parse_address("metrics_endpoint.address", &metrics.address)?;
            }
        }

        Ok(())
    }

    /// The configured fetch target, or `None` when the relay is disabled
    pub fn fetch_target(&self) -> Option<&str> {
        self.fetch_uri
            .as_deref()
            .map(str::trim)
            .filter(|uri| !uri.is_empty() && !uri.eq_ignore_ascii_case("off"))
    }

    pub fn is_enabled(&self) -> bool {
        self.fetch_target().is_some()
    }

    pub fn limits(&self) -> RelayLimits {
        RelayLimits {
            max_retries: self.max_retries,
            max_redirects: self.max_redirects,
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Update configuration from another config
    ///
    /// # Returns
    /// * `Ok(ConfigChanges)` - Description of what changed
    /// * `Err(RelayError)` - If the new configuration is invalid
    pub fn update_from(&mut self, new_config: &RelayConfig) -> Result<ConfigChanges> {
        new_config.validate()?;

        let mut changes = ConfigChanges::default();

        if self.fetch_uri != new_config.fetch_uri {
            changes.fetch_uri_changed = true;
            self.fetch_uri = new_config.fetch_uri.clone();
        }

        if self.uri_var != new_config.uri_var || self.range_var != new_config.range_var {
            changes.variables_changed = true;
            self.uri_var = new_config.uri_var.clone();
            self.range_var = new_config.range_var.clone();
        }

        if self.max_retries != new_config.max_retries {
            changes.max_retries_changed = true;
            self.max_retries = new_config.max_retries;
        }

        if self.max_redirects != new_config.max_redirects {
            changes.max_redirects_changed = true;
            self.max_redirects = new_config.max_redirects;
        }

        if self.size_header != new_config.size_header {
            changes.size_header_changed = true;
            self.size_header = new_config.size_header.clone();
        }

        if self.listen_address != new_config.listen_address {
            changes.listen_address_changed = true;
            self.listen_address = new_config.listen_address.clone();
        }

        if self.fetch_timeout_secs != new_config.fetch_timeout_secs {
            changes.fetch_timeout_changed = true;
            self.fetch_timeout_secs = new_config.fetch_timeout_secs;
        }

        if self.metrics_endpoint != new_config.metrics_endpoint {
            changes.metrics_endpoint_changed = true;
            self.metrics_endpoint = new_config.metrics_endpoint.clone();
        }

        Ok(changes)
    }

    /// Reload configuration from file and apply changes
    pub fn reload_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<ConfigChanges> {
        let new_config = Self::from_file(path)?;
        self.update_from(&new_config)
    }
}

fn parse_address(field: &str, address: &str) -> Result<SocketAddr> {
    address
        .parse()
        .map_err(|e| RelayError::ConfigError(format!("{} '{}' is invalid: {}", field, address, e)))
}

/// Description of configuration changes after hot reload
#[derive(Debug, Default, Clone)]
pub struct ConfigChanges {
    pub fetch_uri_changed: bool,
    pub variables_changed: bool,
    pub max_retries_changed: bool,
    pub max_redirects_changed: bool,
    pub size_header_changed: bool,
    pub listen_address_changed: bool,
    pub fetch_timeout_changed: bool,
    pub metrics_endpoint_changed: bool,
}

impl ConfigChanges {
    /// Check if any changes were made
    pub fn has_changes(&self) -> bool {
        self.fetch_uri_changed
            || self.variables_changed
            || self.max_retries_changed
            || self.max_redirects_changed
            || self.size_header_changed
            || self.listen_address_changed
            || self.fetch_timeout_changed
            || self.metrics_endpoint_changed
    }

    /// Check if the changes only take effect after a restart
    pub fn requires_restart(&self) -> bool {
        self.listen_address_changed || self.fetch_timeout_changed || self.metrics_endpoint_changed
    }

    /// Get a summary of changes
    pub fn summary(&self) -> Vec<String> {
        [
            (self.fetch_uri_changed, "fetch_uri"),
            (self.variables_changed, "uri_var/range_var"),
            (self.max_retries_changed, "max_retries"),
            (self.max_redirects_changed, "max_redirects"),
            (self.size_header_changed, "size_header"),
            (self.listen_address_changed, "listen_address"),
            (self.fetch_timeout_changed, "fetch_timeout_secs"),
            (self.metrics_endpoint_changed, "metrics_endpoint"),
        ]
        .into_iter()
        .filter(|(changed, _)| *changed)
        .map(|(_, name)| name.to_string())
        .collect()
    }
}
