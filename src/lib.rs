//! WolfShard - Cluster Coordination and Online Migration for Sharded MySQL
//!
//! A compute node keeps its view of the cluster (instances, global rules,
//! properties, database metadata and statistics) in step with a shared
//! persistence repository, and runs resumable migration jobs that copy
//! sharded tables from a source data source into a target.
//!
//! # Architecture
//!
//! Every node writes cluster changes into the repository and learns about
//! them through repository watches: a single event dispatcher routes each
//! change to the handler subscribed to its key prefix. Cluster-wide process
//! operations (kill, show process list) are trigger keys each node acts on.
//!
//! Migration jobs split each table into inventory units by unique key range,
//! then run dumper → importer pairs over bounded channels, checkpointing
//! positions into the repository so a stopped job resumes where it left off.
//!
//! # Features
//!
//! - File or embedded registry persistence repository with prefix watches
//! - Compute node registration with cluster-unique worker ids
//! - Versioned global rules and properties
//! - Cluster-wide kill and show-process-list
//! - Range-split, rate-limited, resumable inventory migration
//! - Incremental change capture hook after the inventory dump
//! - HTTP admin API

pub mod api;
pub mod cluster;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod repository;
pub mod tuning;

pub use config::WolfShardConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cluster::{ClusterEventDispatcher, ComputeNodeRegistrar, ContextManager, HandlerRegistry};
    pub use crate::config::WolfShardConfig;
    pub use crate::error::{Error, Result};
    pub use crate::pipeline::{IngestPosition, JobStatus, MigrationJob, PipelineDataSource, PipelineSink};
    pub use crate::repository::{open_repository, PersistRepository};
}
