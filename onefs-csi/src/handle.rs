//! Volume and snapshot handle codec.
//!
//! Handles are the opaque identifiers handed to the container orchestrator.
//! They carry every piece of backend identity later RPCs need, so no lookup
//! table is kept on the plugin side:
//!
//! ```text
//! volume:   <name>=_=_=<exportID>=_=_=<accessZone>[=_=_=<serviceAddress>]
//! snapshot: <snapshotID>=_=_=<volume handle>
//! ```
//!
//! Incoming strings are decoded into [`VolumeHandle`] / [`SnapshotHandle`]
//! immediately; nothing downstream works on substrings.

use std::fmt::{self, Display};
use std::str::FromStr;

use thiserror::Error;

/// Reserved separator between handle fields.
pub const SEPARATOR: &str = "=_=_=";

/// Field count of a volume handle without a service address.
const LEGACY_FIELDS: usize = 3;
/// Field count of a volume handle carrying a service address.
const EXTENDED_FIELDS: usize = 4;

/// Errors produced while building or parsing a handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandleError {
    #[error("{field} must not be empty")]
    EmptyField { field: &'static str },

    #[error("{field} '{value}' contains the reserved separator '=_=_='")]
    ReservedSeparator { field: &'static str, value: String },

    #[error("handle '{handle}' has {found} fields, expected {expected}")]
    FieldCount {
        handle: String,
        found: usize,
        expected: &'static str,
    },

    #[error("volume name '{value}' {reason}")]
    InvalidName { value: String, reason: &'static str },

    #[error("invalid {field} '{value}' in handle: not a non-negative integer")]
    InvalidId { field: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, HandleError>;

fn check_field(field: &'static str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(HandleError::EmptyField { field });
    }
    // A field ending in "=_" or starting with "_=" would merge with an
    // adjacent separator and split differently on decode.
    if value.contains(SEPARATOR) || value.ends_with("=_") || value.starts_with("_=") {
        return Err(HandleError::ReservedSeparator {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Check that a volume name is usable both as a handle field and as a single
/// directory component under the base path.
pub fn check_volume_name(name: &str) -> Result<()> {
    check_field("volume name", name)?;
    let reason = if name.contains('/') {
        "must not contain '/'"
    } else if name == "." || name == ".." {
        "must not be a relative path component"
    } else if name.chars().any(char::is_control) {
        "must not contain control characters"
    } else {
        return Ok(());
    };
    Err(HandleError::InvalidName {
        value: name.escape_debug().to_string(),
        reason,
    })
}

fn parse_id<T: FromStr>(field: &'static str, value: &str) -> Result<T> {
    // `u32::from_str` accepts a leading '+', which would break the round trip.
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(HandleError::InvalidId {
            field,
            value: value.to_string(),
        });
    }
    value.parse().map_err(|_| HandleError::InvalidId {
        field,
        value: value.to_string(),
    })
}

// ============================================================================
// VolumeHandle
// ============================================================================

/// Decoded volume identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeHandle {
    name: String,
    export_id: u32,
    access_zone: String,
    service_address: Option<String>,
}

impl VolumeHandle {
    /// Build a handle, rejecting empty fields, fields containing [`SEPARATOR`]
    /// and names that are not a single path component.
    pub fn new(
        name: impl Into<String>,
        export_id: u32,
        access_zone: impl Into<String>,
        service_address: Option<String>,
    ) -> Result<Self> {
        let name = name.into();
        let access_zone = access_zone.into();
        check_volume_name(&name)?;
        check_field("access zone", &access_zone)?;
        if let Some(addr) = &service_address {
            check_field("service address", addr)?;
        }
        Ok(Self {
            name,
            export_id,
            access_zone,
            service_address,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn export_id(&self) -> u32 {
        self.export_id
    }

    pub fn access_zone(&self) -> &str {
        &self.access_zone
    }

    pub fn service_address(&self) -> Option<&str> {
        self.service_address.as_deref()
    }

    fn from_fields(handle: &str, fields: &[&str]) -> Result<Self> {
        match fields {
            [name, id, zone] => Self::new(*name, parse_id("export id", id)?, *zone, None),
            [name, id, zone, addr] => Self::new(
                *name,
                parse_id("export id", id)?,
                *zone,
                Some((*addr).to_string()),
            ),
            _ => Err(HandleError::FieldCount {
                handle: handle.to_string(),
                found: fields.len(),
                expected: "3 or 4",
            }),
        }
    }
}

impl Display for VolumeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.name, self.export_id, self.access_zone
        )?;
        if let Some(addr) = &self.service_address {
            write!(f, "{SEPARATOR}{}", addr)?;
        }
        Ok(())
    }
}

impl FromStr for VolumeHandle {
    type Err = HandleError;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.split(SEPARATOR).collect();
        Self::from_fields(s, &fields)
    }
}

// ============================================================================
// SnapshotHandle
// ============================================================================

/// Decoded snapshot identity: backend snapshot id plus the full source volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotHandle {
    snapshot_id: u64,
    source: VolumeHandle,
}

impl SnapshotHandle {
    pub fn new(snapshot_id: u64, source: VolumeHandle) -> Self {
        Self {
            snapshot_id,
            source,
        }
    }

    pub fn snapshot_id(&self) -> u64 {
        self.snapshot_id
    }

    pub fn source(&self) -> &VolumeHandle {
        &self.source
    }
}

impl Display for SnapshotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.snapshot_id, self.source)
    }
}

impl FromStr for SnapshotHandle {
    type Err = HandleError;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.split(SEPARATOR).collect();
        if fields.len() != LEGACY_FIELDS + 1 && fields.len() != EXTENDED_FIELDS + 1 {
            return Err(HandleError::FieldCount {
                handle: s.to_string(),
                found: fields.len(),
                expected: "4 or 5",
            });
        }
        let snapshot_id = parse_id("snapshot id", fields[0])?;
        let source = VolumeHandle::from_fields(s, &fields[1..])?;
        Ok(Self::new(snapshot_id, source))
    }
}
