//! Resources reconciled by stagehand.
//!
//! Each resource computes its status from live state and knows how to
//! create, update and delete itself. Secret stores, the secrets mediator and
//! the state ledger live here too, next to the resources that use them.

pub mod branched_db;
pub mod cdn;
pub mod cdn_keys;
pub mod container;
pub mod distributed_sql;
pub mod ledger;
pub mod managed_db;
pub mod mediator;
pub mod network;
pub mod providers;
pub mod resource;
pub mod secrets;
pub mod stack;
pub mod storage;

#[cfg(test)]
mod testing;

pub use branched_db::BranchedDb;
pub use cdn::{CdnDistribution, UploadReport};
pub use cdn_keys::CdnSigningKeys;
pub use container::ComputeContainer;
pub use distributed_sql::DistributedSqlCluster;
pub use ledger::StateLedger;
pub use managed_db::ManagedDbCluster;
pub use mediator::{DatabaseUrlSource, ErrorLevel, Mediator, SecretsReport};
pub use network::VirtualNetwork;
pub use resource::{Resource, ResourceContext, ResourceKind};
pub use stack::Stack;
pub use storage::ObjectStore;
