//! Volume capability validation.
//!
//! The cluster only serves filesystem (NFS) access, so block access is always
//! refused. Any of the five named access modes is accepted for mount access.

use std::fmt::{self, Display};

use crate::csi;
use crate::csi::volume_capability::access_mode::Mode;
use crate::error::{CsiError, Result};

// ============================================================================
// AccessMode
// ============================================================================

/// Access mode of a capability, folded down to the modes this plugin knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    SingleWriter,
    SingleReader,
    MultiReader,
    MultiNodeSingleWriter,
    MultiWriter,
    Unknown,
}

impl AccessMode {
    /// Map a raw CSI mode value.
    ///
    /// SINGLE_NODE_SINGLE_WRITER and SINGLE_NODE_MULTI_WRITER require the
    /// SINGLE_NODE_MULTI_WRITER capability, which is not advertised, so they
    /// fold into `Unknown`.
    pub fn from_csi(mode: i32) -> Self {
        match Mode::try_from(mode) {
            Ok(Mode::SingleNodeWriter) => AccessMode::SingleWriter,
            Ok(Mode::SingleNodeReaderOnly) => AccessMode::SingleReader,
            Ok(Mode::MultiNodeReaderOnly) => AccessMode::MultiReader,
            Ok(Mode::MultiNodeSingleWriter) => AccessMode::MultiNodeSingleWriter,
            Ok(Mode::MultiNodeMultiWriter) => AccessMode::MultiWriter,
            Ok(Mode::SingleNodeSingleWriter)
            | Ok(Mode::SingleNodeMultiWriter)
            | Ok(Mode::Unknown)
            | Err(_) => AccessMode::Unknown,
        }
    }

    /// Reader-only modes always get a read-only mount.
    pub fn is_read_only(self) -> bool {
        matches!(self, AccessMode::SingleReader | AccessMode::MultiReader)
    }
}

impl Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessMode::SingleWriter => "single-writer",
            AccessMode::SingleReader => "single-reader",
            AccessMode::MultiReader => "multi-reader",
            AccessMode::MultiNodeSingleWriter => "multi-node-single-writer",
            AccessMode::MultiWriter => "multi-writer",
            AccessMode::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// AccessType
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessType {
    Block,
    Mount {
        fs_type: String,
        mount_flags: Vec<String>,
    },
}

impl AccessType {
    pub fn from_csi(access_type: &csi::volume_capability::AccessType) -> Self {
        match access_type {
            csi::volume_capability::AccessType::Block(_) => AccessType::Block,
            csi::volume_capability::AccessType::Mount(m) => AccessType::Mount {
                fs_type: m.fs_type.clone(),
                mount_flags: m.mount_flags.clone(),
            },
        }
    }
}

/// Access mode of a capability, `None` when the mode message is absent.
pub fn access_mode(cap: &csi::VolumeCapability) -> Option<AccessMode> {
    cap.access_mode.as_ref().map(|m| AccessMode::from_csi(m.mode))
}

/// Access type of a capability, `None` when unset.
pub fn access_type(cap: &csi::VolumeCapability) -> Option<AccessType> {
    cap.access_type.as_ref().map(AccessType::from_csi)
}

/// Mount flags requested by a mount capability.
pub fn mount_flags(cap: &csi::VolumeCapability) -> Vec<String> {
    match access_type(cap) {
        Some(AccessType::Mount { mount_flags, .. }) => mount_flags,
        _ => Vec::new(),
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Check one capability, returning the reason it cannot be served.
pub fn check_capability(cap: &csi::VolumeCapability) -> std::result::Result<(), String> {
    match access_type(cap) {
        None => return Err("volume capability must specify an access type".to_string()),
        Some(AccessType::Block) => {
            return Err("block access type is not supported".to_string());
        }
        Some(AccessType::Mount { .. }) => {}
    }

    match access_mode(cap) {
        None => Err("volume capability must specify an access mode".to_string()),
        Some(AccessMode::Unknown) => Err("unknown or unsupported access mode".to_string()),
        Some(_) => Ok(()),
    }
}

/// Check every capability. All of them must pass; the reasons of the ones that
/// fail are joined into a single message.
pub fn validate_capabilities(caps: &[csi::VolumeCapability]) -> std::result::Result<(), String> {
    if caps.is_empty() {
        return Err("no volume capabilities supplied".to_string());
    }

    let reasons: Vec<String> = caps
        .iter()
        .filter_map(|cap| check_capability(cap).err())
        .collect();

    if reasons.is_empty() {
        Ok(())
    } else {
        Err(reasons.join("; "))
    }
}

/// GetCapacity only evaluates the first capability and refuses an unknown
/// access mode there. Runs before any backend call.
pub fn check_capacity_capabilities(caps: &[csi::VolumeCapability]) -> Result<()> {
    let Some(first) = caps.first() else {
        return Ok(());
    };
    match access_mode(first) {
        Some(AccessMode::Unknown) | None => Err(CsiError::invalid_argument(
            "GetCapacity: unknown access mode in volume capability",
        )),
        Some(_) => Ok(()),
    }
}

/// Whether a publish should be read-only, from the request flag or the mode.
pub fn is_read_only(cap: &csi::VolumeCapability, readonly: bool) -> bool {
    readonly || access_mode(cap).is_some_and(AccessMode::is_read_only)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn mount_capability(mode: Mode) -> csi::VolumeCapability {
        csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Mount(
                csi::volume_capability::MountVolume {
                    fs_type: String::new(),
                    mount_flags: vec![],
                    volume_mount_group: String::new(),
                },
            )),
            access_mode: Some(csi::volume_capability::AccessMode { mode: mode as i32 }),
        }
    }

    fn block_capability(mode: Mode) -> csi::VolumeCapability {
        csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Block(
                csi::volume_capability::BlockVolume {},
            )),
            access_mode: Some(csi::volume_capability::AccessMode { mode: mode as i32 }),
        }
    }

    #[test]
    fn test_access_mode_mapping() {
        assert_eq!(
            AccessMode::from_csi(Mode::SingleNodeWriter as i32),
            AccessMode::SingleWriter
        );
        assert_eq!(
            AccessMode::from_csi(Mode::MultiNodeMultiWriter as i32),
            AccessMode::MultiWriter
        );
        assert_eq!(
            AccessMode::from_csi(Mode::SingleNodeSingleWriter as i32),
            AccessMode::Unknown
        );
        assert_eq!(
            AccessMode::from_csi(Mode::SingleNodeMultiWriter as i32),
            AccessMode::Unknown
        );
        assert_eq!(AccessMode::from_csi(42), AccessMode::Unknown);
    }

    #[test]
    fn test_mount_with_named_modes_validates() {
        let caps: Vec<_> = [
            Mode::SingleNodeWriter,
            Mode::SingleNodeReaderOnly,
            Mode::MultiNodeReaderOnly,
            Mode::MultiNodeSingleWriter,
            Mode::MultiNodeMultiWriter,
        ]
        .into_iter()
        .map(mount_capability)
        .collect();
        assert!(validate_capabilities(&caps).is_ok());
    }

    #[test]
    fn test_block_and_unknown_rejected() {
        let reason = validate_capabilities(&[block_capability(Mode::SingleNodeWriter)]).unwrap_err();
        assert!(reason.contains("block"));

        let reason = validate_capabilities(&[mount_capability(Mode::Unknown)]).unwrap_err();
        assert!(reason.contains("unknown"));
    }

    #[test]
    fn test_validation_is_all_or_nothing() {
        let caps = vec![
            mount_capability(Mode::SingleNodeWriter),
            block_capability(Mode::SingleNodeWriter),
        ];
        assert!(validate_capabilities(&caps).is_err());
        assert!(validate_capabilities(&[]).is_err());
    }

    #[test]
    fn test_missing_parts_rejected() {
        let no_mode = csi::VolumeCapability {
            access_mode: None,
            ..mount_capability(Mode::SingleNodeWriter)
        };
        assert!(check_capability(&no_mode).unwrap_err().contains("access mode"));

        let no_type = csi::VolumeCapability {
            access_type: None,
            ..mount_capability(Mode::SingleNodeWriter)
        };
        assert!(check_capability(&no_type).unwrap_err().contains("access type"));
    }

    #[test]
    fn test_capacity_check_uses_first_capability() {
        assert!(check_capacity_capabilities(&[]).is_ok());
        assert!(check_capacity_capabilities(&[mount_capability(Mode::SingleNodeWriter)]).is_ok());
        assert!(matches!(
            check_capacity_capabilities(&[
                mount_capability(Mode::Unknown),
                mount_capability(Mode::SingleNodeWriter)
            ]),
            Err(CsiError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_is_read_only() {
        assert!(is_read_only(&mount_capability(Mode::MultiNodeReaderOnly), false));
        assert!(is_read_only(&mount_capability(Mode::SingleNodeWriter), true));
        assert!(!is_read_only(&mount_capability(Mode::MultiNodeMultiWriter), false));
    }
}
