//! gkeship core: shared error taxonomy, deployment configuration, the
//! cluster/backend data model and `$VAR` substitution.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod model;
pub mod template;

pub use config::{hashed_node_port, load_api_config, DeployConfig, EnvVar, Settings};
pub use error::{Error, ErrorKind, Result};
pub use model::{BackendConfig, Cluster, ClusterSet};
pub use template::{referenced_names, substitute_text, substitute_value, Variables};
