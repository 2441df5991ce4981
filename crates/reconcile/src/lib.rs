//! gkeship reconcile: converge cloud resources toward the deployment config.
//!
//! - [`differ`] decides whether an existing backend service needs an update.
//! - [`clusters`] ensures the configured clusters exist and carry the node port.
//! - [`engine`] runs load-balancer scripts in create or delete mode.

#![forbid(unsafe_code)]

pub mod certs;
pub mod clusters;
pub mod differ;
pub mod dns;
pub mod engine;
pub mod network;

pub use certs::{CertificateReader, CertificateRef, OpensslCertificates};
pub use clusters::{configure_named_port, region_zone, ClusterDefaults, ClusterFailure, ClusterReconciler, ClusterReport};
pub use differ::{backend_update, changed_fields};
pub use dns::{DnsResolver, SystemResolver};
pub use engine::{plan, Invoke, Mode, PlannedTask, ReconciliationEngine, Script, Task};
pub use network::{ensure_network, NetworkRef};
