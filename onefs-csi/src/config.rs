//! Resolved driver configuration.
//!
//! The binary parses flags and environment variables with clap and turns them
//! into a [`DriverConfig`]; everything below `main` only sees this struct.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::backend::onefs::OneFsSettings;
use crate::handle::SEPARATOR;
use crate::types::{BackendKind, ServiceMode};

pub const DEFAULT_DRIVER_NAME: &str = "csi-isilon.dellemc.com";
pub const DEFAULT_ACCESS_ZONE: &str = "System";
pub const DEFAULT_BASE_PATH: &str = "/ifs/data/csi";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("base path '{0}' must be absolute")]
    RelativeBasePath(String),

    #[error("access zone '{0}' contains the reserved separator '=_=_='")]
    ReservedSeparator(String),

    #[error("an OneFS endpoint is required when running the controller")]
    MissingEndpoint,
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Clone)]
pub struct DriverConfig {
    pub driver_name: String,
    pub mode: ServiceMode,
    pub node_id: String,
    pub node_ip: Option<String>,
    pub backend: BackendKind,
    /// OneFS platform API base URL, e.g. `https://10.0.0.1:8080`
    pub endpoint: Option<String>,
    pub user: String,
    pub password: String,
    pub insecure: bool,
    /// Default access zone for volumes and export listings
    pub access_zone: String,
    /// Default parent directory of volume directories
    pub base_path: String,
    /// Enforce the hard threshold of volume quotas
    pub quota_enabled: bool,
    /// Connect to the backend on demand before data operations
    pub auto_probe: bool,
    pub allow_omitted_access_mode: bool,
    pub nfs_mount_options: Vec<String>,
    pub request_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_string(),
            mode: ServiceMode::All,
            node_id: String::new(),
            node_ip: None,
            backend: BackendKind::OneFs,
            endpoint: None,
            user: String::new(),
            password: String::new(),
            insecure: false,
            access_zone: DEFAULT_ACCESS_ZONE.to_string(),
            base_path: DEFAULT_BASE_PATH.to_string(),
            quota_enabled: true,
            auto_probe: true,
            allow_omitted_access_mode: false,
            nfs_mount_options: Vec::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl fmt::Debug for DriverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverConfig")
            .field("driver_name", &self.driver_name)
            .field("mode", &self.mode)
            .field("node_id", &self.node_id)
            .field("node_ip", &self.node_ip)
            .field("backend", &self.backend)
            .field("endpoint", &self.endpoint)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("insecure", &self.insecure)
            .field("access_zone", &self.access_zone)
            .field("base_path", &self.base_path)
            .field("quota_enabled", &self.quota_enabled)
            .field("auto_probe", &self.auto_probe)
            .field("allow_omitted_access_mode", &self.allow_omitted_access_mode)
            .field("nfs_mount_options", &self.nfs_mount_options)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl DriverConfig {
    /// Check the settings that would otherwise only fail at the first RPC.
    /// Credentials are left to the probe.
    pub fn validate(&self) -> Result<()> {
        if !self.base_path.starts_with('/') {
            return Err(ConfigError::RelativeBasePath(self.base_path.clone()));
        }
        if self.access_zone.contains(SEPARATOR) {
            return Err(ConfigError::ReservedSeparator(self.access_zone.clone()));
        }
        if self.mode.runs_controller()
            && self.backend == BackendKind::OneFs
            && self.endpoint.as_deref().is_none_or(str::is_empty)
        {
            return Err(ConfigError::MissingEndpoint);
        }
        Ok(())
    }

    /// Host part of the cluster endpoint, used as the NFS server when a
    /// volume carries no service address of its own.
    pub fn endpoint_host(&self) -> Option<String> {
        let endpoint = self.endpoint.as_deref()?;
        let url = reqwest::Url::parse(endpoint).ok()?;
        url.host_str().map(str::to_string)
    }

    /// Settings for the REST client.
    pub fn onefs_settings(&self) -> OneFsSettings {
        OneFsSettings {
            endpoint: self.endpoint.clone().unwrap_or_default(),
            user: self.user.clone(),
            password: self.password.clone(),
            insecure: self.insecure,
            default_zone: self.access_zone.clone(),
            request_timeout: self.request_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller_config() -> DriverConfig {
        DriverConfig {
            endpoint: Some("https://10.0.0.1:8080".to_string()),
            user: "admin".to_string(),
            password: "hunter2".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(controller_config().validate().is_ok());
    }

    #[test]
    fn test_validate_relative_base_path() {
        let config = DriverConfig {
            base_path: "ifs/data".to_string(),
            ..controller_config()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::RelativeBasePath("ifs/data".to_string()))
        );
    }

    #[test]
    fn test_validate_zone_with_separator() {
        let config = DriverConfig {
            access_zone: "a=_=_=b".to_string(),
            ..controller_config()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ReservedSeparator(_))
        ));
    }

    #[test]
    fn test_validate_endpoint_requirement() {
        let config = DriverConfig {
            endpoint: None,
            ..controller_config()
        };
        assert_eq!(config.validate(), Err(ConfigError::MissingEndpoint));

        let node_only = DriverConfig {
            mode: ServiceMode::Node,
            ..config.clone()
        };
        assert!(node_only.validate().is_ok());

        let memory = DriverConfig {
            backend: BackendKind::Memory,
            ..config
        };
        assert!(memory.validate().is_ok());
    }

    #[test]
    fn test_endpoint_host() {
        assert_eq!(
            controller_config().endpoint_host().as_deref(),
            Some("10.0.0.1")
        );
        assert_eq!(DriverConfig::default().endpoint_host(), None);
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", controller_config());
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
