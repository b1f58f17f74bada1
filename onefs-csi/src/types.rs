//! Type-safe wrappers for CSI parameters.
//!
//! These types provide compile-time safety for values that are parsed from
//! the command line, StorageClass parameters and volume contexts. Each type
//! implements `FromStr` for parsing at API boundaries.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::str::FromStr;

/// StorageClass parameter keys.
pub mod params {
    pub const ACCESS_ZONE: &str = "AccessZone";
    pub const ISI_PATH: &str = "IsiPath";
    pub const AZ_SERVICE_IP: &str = "AzServiceIP";
}

/// Keys of the volume context returned by CreateVolume.
pub mod volume_context {
    pub const NAME: &str = "Name";
    pub const ACCESS_ZONE: &str = "AccessZone";
    pub const PATH: &str = "Path";
    pub const AZ_SERVICE_IP: &str = "AzServiceIP";
}

/// Keys of the publish context returned by ControllerPublishVolume.
pub mod publish_context {
    pub const ACCESS_ZONE: &str = "AccessZone";
    pub const PATH: &str = "Path";
    pub const EXPORT_ID: &str = "ExportID";
    pub const SERVICE_ADDRESS: &str = "ServiceAddress";
    pub const READ_ONLY: &str = "ReadOnly";
}

// ============================================================================
// ServiceMode
// ============================================================================

/// Which CSI services this process serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceMode {
    Controller,
    Node,
    /// Controller and node in one process
    #[default]
    All,
}

impl ServiceMode {
    pub const fn runs_controller(self) -> bool {
        matches!(self, ServiceMode::Controller | ServiceMode::All)
    }

    pub const fn runs_node(self) -> bool {
        matches!(self, ServiceMode::Node | ServiceMode::All)
    }
}

impl Display for ServiceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceMode::Controller => write!(f, "controller"),
            ServiceMode::Node => write!(f, "node"),
            ServiceMode::All => write!(f, "all"),
        }
    }
}

impl FromStr for ServiceMode {
    type Err = ServiceModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "controller" => Ok(ServiceMode::Controller),
            "node" => Ok(ServiceMode::Node),
            "all" | "" => Ok(ServiceMode::All),
            _ => Err(ServiceModeParseError(s.to_string())),
        }
    }
}

/// Error returned when parsing an invalid service mode.
#[derive(Debug, Clone)]
pub struct ServiceModeParseError(String);

impl Display for ServiceModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown mode '{}': expected 'controller', 'node', or 'all'",
            self.0
        )
    }
}

impl std::error::Error for ServiceModeParseError {}

// ============================================================================
// BackendKind
// ============================================================================

/// Which backend adapter the controller talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// OneFS platform API over HTTPS
    #[default]
    OneFs,
    /// In-process cluster, for csi-sanity runs
    Memory,
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::OneFs => write!(f, "onefs"),
            BackendKind::Memory => write!(f, "memory"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = BackendKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "onefs" | "isilon" => Ok(BackendKind::OneFs),
            "memory" | "mem" => Ok(BackendKind::Memory),
            _ => Err(BackendKindParseError(s.to_string())),
        }
    }
}

/// Error returned when parsing an invalid backend kind.
#[derive(Debug, Clone)]
pub struct BackendKindParseError(String);

impl Display for BackendKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown backend '{}': expected 'onefs' or 'memory'",
            self.0
        )
    }
}

impl std::error::Error for BackendKindParseError {}

// ============================================================================
// VolumeParameters
// ============================================================================

/// Placement resolved from StorageClass parameters and process defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeParameters {
    pub access_zone: String,
    /// Parent directory of every volume directory
    pub base_path: String,
    pub az_service_ip: Option<String>,
}

impl VolumeParameters {
    /// Resolve parameters, falling back to the given defaults for unset or
    /// empty keys.
    pub fn resolve(
        parameters: &HashMap<String, String>,
        default_zone: &str,
        default_path: &str,
    ) -> Self {
        let get = |key: &str| {
            parameters
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        Self {
            access_zone: get(params::ACCESS_ZONE)
                .unwrap_or(default_zone)
                .to_string(),
            base_path: get(params::ISI_PATH)
                .unwrap_or(default_path)
                .trim_end_matches('/')
                .to_string(),
            az_service_ip: get(params::AZ_SERVICE_IP).map(str::to_string),
        }
    }

    /// Directory backing the named volume.
    pub fn volume_path(&self, name: &str) -> String {
        volume_path(&self.base_path, name)
    }
}

/// Join a base path and a volume name.
pub fn volume_path(base_path: &str, name: &str) -> String {
    format!("{}/{}", base_path.trim_end_matches('/'), name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_mode_from_str() {
        assert_eq!("controller".parse::<ServiceMode>().unwrap(), ServiceMode::Controller);
        assert_eq!("NODE".parse::<ServiceMode>().unwrap(), ServiceMode::Node);
        assert_eq!("all".parse::<ServiceMode>().unwrap(), ServiceMode::All);
        assert_eq!("".parse::<ServiceMode>().unwrap(), ServiceMode::All);
        assert!("both".parse::<ServiceMode>().is_err());
    }

    #[test]
    fn test_service_mode_services() {
        assert!(ServiceMode::Controller.runs_controller());
        assert!(!ServiceMode::Controller.runs_node());
        assert!(ServiceMode::Node.runs_node());
        assert!(!ServiceMode::Node.runs_controller());
        assert!(ServiceMode::All.runs_controller() && ServiceMode::All.runs_node());
        assert_eq!(ServiceMode::All.to_string(), "all");
    }

    #[test]
    fn test_backend_kind_from_str() {
        assert_eq!("onefs".parse::<BackendKind>().unwrap(), BackendKind::OneFs);
        assert_eq!("Memory".parse::<BackendKind>().unwrap(), BackendKind::Memory);
        let err = "nfs".parse::<BackendKind>().unwrap_err();
        assert!(err.to_string().contains("'nfs'"));
    }

    #[test]
    fn test_volume_parameters_defaults() {
        let params = VolumeParameters::resolve(&HashMap::new(), "System", "/ifs/data/csi");
        assert_eq!(params.access_zone, "System");
        assert_eq!(params.base_path, "/ifs/data/csi");
        assert_eq!(params.az_service_ip, None);
        assert_eq!(params.volume_path("v1"), "/ifs/data/csi/v1");
    }

    #[test]
    fn test_volume_parameters_overrides() {
        let mut map = HashMap::new();
        map.insert(params::ACCESS_ZONE.to_string(), "zone-a".to_string());
        map.insert(params::ISI_PATH.to_string(), "/ifs/zone-a/vols/".to_string());
        map.insert(params::AZ_SERVICE_IP.to_string(), "10.1.1.1".to_string());
        map.insert("unrelated".to_string(), "x".to_string());

        let params = VolumeParameters::resolve(&map, "System", "/ifs/data/csi");
        assert_eq!(params.access_zone, "zone-a");
        assert_eq!(params.volume_path("v2"), "/ifs/zone-a/vols/v2");
        assert_eq!(params.az_service_ip.as_deref(), Some("10.1.1.1"));
    }

    #[test]
    fn test_empty_parameter_falls_back() {
        let mut map = HashMap::new();
        map.insert(params::ACCESS_ZONE.to_string(), "  ".to_string());
        let params = VolumeParameters::resolve(&map, "System", "/ifs/data/csi");
        assert_eq!(params.access_zone, "System");
    }
}
