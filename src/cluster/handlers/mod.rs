//! Built-in cluster event handlers.

mod compute_node;
mod database;
mod global_rule;
mod process;
mod properties;
mod statistics;

pub use compute_node::{
    ComputeNodeOnlineHandler, InstanceLabelsHandler, InstanceStateHandler, InstanceWorkerIdHandler,
};
pub use database::{refresh_statistics, ListenerAssistedHandler, ListenerAssistedType};
pub use global_rule::GlobalRuleChangedHandler;
pub use process::{KillProcessHandler, ShowProcessListHandler};
pub use properties::PropertiesChangedHandler;
pub use statistics::StatisticsChangedHandler;

use std::sync::Arc;

use super::dispatch::DataChangedEventHandler;

/// Every handler a compute node subscribes on startup
pub fn default_handlers() -> Vec<Arc<dyn DataChangedEventHandler>> {
    vec![
        Arc::new(ComputeNodeOnlineHandler),
        Arc::new(InstanceStateHandler),
        Arc::new(InstanceLabelsHandler),
        Arc::new(InstanceWorkerIdHandler),
        Arc::new(KillProcessHandler),
        Arc::new(ShowProcessListHandler),
        Arc::new(GlobalRuleChangedHandler),
        Arc::new(PropertiesChangedHandler),
        Arc::new(ListenerAssistedHandler),
        Arc::new(StatisticsChangedHandler),
    ]
}
