//! filemesh node registry
//!
//! Nodes announce `name -> address` under a TTL lease in a coordination
//! store and renew it in the background. Clients mirror the registered set
//! into a [`NodeDirectory`] by reading the namespace once and then following
//! its change stream.
//!
//! ## Modules
//! - `store`: coordination store trait and event types
//! - `etcd`: etcd v3 JSON gateway client
//! - `memory`: in-process store with the same semantics
//! - `registry`: registration and lease renewal
//! - `discovery`: initial sync plus watch loop
//! - `nodes`: the shared node directory

pub mod discovery;
pub mod error;
pub mod etcd;
pub mod memory;
pub mod nodes;
pub mod registry;
pub mod store;

pub use discovery::{discover, Discovery, DiscoveryOutcome};
pub use error::{RegistryError, Result};
pub use etcd::EtcdGatewayStore;
pub use memory::MemoryCoordinationStore;
pub use nodes::{NodeDirectory, NodeMap};
pub use registry::{register_with_etcd, Registration, RegistrationConfig, Registry};
pub use store::{CoordinationStore, KeyValue, LeaseId, PrefixSnapshot, WatchEvent, WatchStream};
