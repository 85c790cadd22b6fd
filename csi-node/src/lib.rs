//! iSCSI SAN CSI Node Plugin Library
//!
//! Node side of a Kubernetes CSI driver for block volumes exported by a
//! storage array over iSCSI. It logs in to the array's portals, formats and
//! mounts the resulting (multipath) device for a workload, and tears the
//! attachment down again.
//!
//! This library provides:
//! - CSI Identity and Node service implementations
//! - The volume lifecycle controller and its admission gate
//! - Session, filesystem and mount management over platform tools
//! - Durable connector records for restart-safe teardown

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod admission;
pub mod config;
pub mod connector;
pub mod error;
pub mod filesystem;
pub mod host;
pub mod identity;
pub mod lifecycle;
pub mod metrics;
pub mod mount;
pub mod node;
pub mod platform;
pub mod session;
pub mod types;

pub use config::NodeConfig;
pub use error::NodeError;
pub use identity::IdentityService;
pub use lifecycle::VolumeLifecycle;
pub use node::NodeService;
