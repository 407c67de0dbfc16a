//! Kill-process and show-process-list triggers.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cluster::context::ContextManager;
use crate::cluster::dispatch::DataChangedEventHandler;
use crate::cluster::paths;
use crate::error::Result;
use crate::repository::{ChangeType, DataChangedEvent};

/// Kills local processes on request and wakes the requester when done
pub struct KillProcessHandler;

#[async_trait]
impl DataChangedEventHandler for KillProcessHandler {
    fn subscribed_key(&self) -> &'static str {
        paths::KILL_PROCESS_TRIGGER_ROOT
    }

    fn subscribed_types(&self) -> &'static [ChangeType] {
        &[ChangeType::Added, ChangeType::Deleted]
    }

    async fn handle(&self, context: &Arc<ContextManager>, event: &DataChangedEvent) -> Result<()> {
        let Some((instance_id, process_id)) =
            paths::parse_trigger(paths::KILL_PROCESS_TRIGGER_ROOT, &event.key)
        else {
            return Ok(());
        };
        match event.change_type {
            ChangeType::Added => {
                if !context.instances().is_local(&instance_id).await {
                    return Ok(());
                }
                if context.processes().kill(&process_id) {
                    tracing::info!("Killed process {}", process_id);
                } else {
                    tracing::debug!("Process {} is not running on this instance", process_id);
                }
                context.repository().delete(&event.key).await?;
            }
            ChangeType::Deleted => context.process_locks().notify(&process_id),
            ChangeType::Updated => {}
        }
        Ok(())
    }
}

/// Reports local processes on request and wakes the requester when done
pub struct ShowProcessListHandler;

#[async_trait]
impl DataChangedEventHandler for ShowProcessListHandler {
    fn subscribed_key(&self) -> &'static str {
        paths::SHOW_PROCESS_LIST_TRIGGER_ROOT
    }

    fn subscribed_types(&self) -> &'static [ChangeType] {
        &[ChangeType::Added, ChangeType::Deleted]
    }

    async fn handle(&self, context: &Arc<ContextManager>, event: &DataChangedEvent) -> Result<()> {
        let Some((instance_id, task_id)) =
            paths::parse_trigger(paths::SHOW_PROCESS_LIST_TRIGGER_ROOT, &event.key)
        else {
            return Ok(());
        };
        match event.change_type {
            ChangeType::Added => {
                if !context.instances().is_local(&instance_id).await {
                    return Ok(());
                }
                let mut processes = context.processes().list();
                for process in &mut processes {
                    process.instance_id = instance_id.clone();
                }
                if !processes.is_empty() {
                    context
                        .repository()
                        .persist(
                            &paths::execution_node(&task_id, &instance_id),
                            &serde_json::to_string(&processes)?,
                        )
                        .await?;
                }
                context.repository().delete(&event.key).await?;
            }
            ChangeType::Deleted => context.process_locks().notify(&task_id),
            ChangeType::Updated => {}
        }
        Ok(())
    }
}
