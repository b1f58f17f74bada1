//! OneFS CSI Driver Library
//!
//! Kubernetes CSI driver that provisions NFS volumes and snapshots on a
//! OneFS-style scale-out NAS cluster through directory quotas and exports.
//!
//! This library provides:
//! - CSI Identity, Controller, and Node service implementations
//! - The backend adapter interface with a OneFS REST client and an
//!   in-memory cluster
//! - Mount utilities for Linux nodes

use tonic::Request;

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod backend;
pub mod capability;
pub mod config;
pub mod controller;
pub mod error;
pub mod handle;
pub mod identity;
pub mod metrics;
pub mod mount;
pub mod node;
pub mod probe;
pub mod session;
pub mod types;

pub use config::DriverConfig;
pub use controller::ControllerService;
pub use error::CsiError;
pub use identity::IdentityService;
pub use node::NodeService;
pub use session::Session;

/// Metadata key carrying the CO's request id.
const REQUEST_ID_KEY: &str = "csi.requestid";

/// Request id for log correlation: the one sent by the CO, or a fresh one.
pub(crate) fn request_id<T>(request: &Request<T>) -> String {
    request
        .metadata()
        .get(REQUEST_ID_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}
