//! Cluster Coordination Module
//!
//! Keeps every compute node's view of cluster metadata in step with the
//! persist repository: instance membership and attributes, global rules,
//! properties, database metadata, statistics, and cluster-wide process
//! operations.

mod context;
mod dispatch;
pub mod handlers;
mod instance;
mod metadata;
mod node;
pub mod paths;
mod persist;
mod process;
mod version;

pub use context::ContextManager;
pub use dispatch::{
    ClusterEventDispatcher, DataChangedEventHandler, HandlerRegistry, HandlerRegistryBuilder,
};
pub use instance::{
    ClusterInstanceRegistry, ClusterSummary, ComputeNodeInstance, InstanceMetaData, InstanceState,
    InstanceType,
};
pub use metadata::{
    ColumnSchema, DatabaseMetaData, IndexSchema, MetaDataManager, SchemaMetaData, StatisticsData,
    StatisticsRow, TableMetaData, TableStatistics,
};
pub use node::{ComputeNodeRegistrar, MAX_WORKER_ID};
pub use persist::MetaDataPersistFacade;
pub use process::{
    ProcessCoordinator, ProcessHandle, ProcessInfo, ProcessOperationLockRegistry, ProcessRegistry,
};
pub use version::ActiveVersionChecker;
