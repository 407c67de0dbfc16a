//! Compute node online/offline and attribute handlers.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cluster::context::ContextManager;
use crate::cluster::dispatch::DataChangedEventHandler;
use crate::cluster::instance::InstanceState;
use crate::cluster::paths;
use crate::cluster::persist::{parse_labels, parse_worker_id};
use crate::error::{Error, Result};
use crate::repository::{ChangeType, DataChangedEvent};

/// Tracks instances coming online and going offline
pub struct ComputeNodeOnlineHandler;

#[async_trait]
impl DataChangedEventHandler for ComputeNodeOnlineHandler {
    fn subscribed_key(&self) -> &'static str {
        paths::ONLINE_ROOT
    }

    fn subscribed_types(&self) -> &'static [ChangeType] {
        &[ChangeType::Added, ChangeType::Deleted]
    }

    async fn handle(&self, context: &Arc<ContextManager>, event: &DataChangedEvent) -> Result<()> {
        let Some((instance_type, instance_id)) = paths::parse_online_instance(&event.key) else {
            return Ok(());
        };
        match event.change_type {
            ChangeType::Added => {
                let instance = context
                    .load_instance(instance_type, &instance_id, &event.value)
                    .await?;
                context.instances().add(instance).await;
            }
            ChangeType::Deleted => {
                context.instances().remove(&instance_id).await;
            }
            ChangeType::Updated => {}
        }
        Ok(())
    }
}

async fn update_instance<F>(context: &ContextManager, instance_id: &str, attribute: &str, update: F)
where
    F: FnOnce(&mut crate::cluster::ComputeNodeInstance),
{
    if !context.instances().update(instance_id, update).await {
        tracing::debug!("Ignoring {} change for unknown instance {}", attribute, instance_id);
    }
}

/// Applies instance state changes; deletions are ignored
pub struct InstanceStateHandler;

#[async_trait]
impl DataChangedEventHandler for InstanceStateHandler {
    fn subscribed_key(&self) -> &'static str {
        paths::STATUS_ROOT
    }

    fn subscribed_types(&self) -> &'static [ChangeType] {
        &[ChangeType::Added, ChangeType::Updated]
    }

    async fn handle(&self, context: &Arc<ContextManager>, event: &DataChangedEvent) -> Result<()> {
        let Some(instance_id) = paths::parse_instance_attribute(paths::STATUS_ROOT, &event.key) else {
            return Ok(());
        };
        let state = InstanceState::parse(&event.value)
            .ok_or_else(|| Error::Repository(format!("Invalid instance state '{}'", event.value)))?;
        update_instance(context, &instance_id, "state", |instance| instance.state = state).await;
        Ok(())
    }
}

/// Applies instance label changes; deletions are ignored
pub struct InstanceLabelsHandler;

#[async_trait]
impl DataChangedEventHandler for InstanceLabelsHandler {
    fn subscribed_key(&self) -> &'static str {
        paths::LABELS_ROOT
    }

    fn subscribed_types(&self) -> &'static [ChangeType] {
        &[ChangeType::Added, ChangeType::Updated]
    }

    async fn handle(&self, context: &Arc<ContextManager>, event: &DataChangedEvent) -> Result<()> {
        let Some(instance_id) = paths::parse_instance_attribute(paths::LABELS_ROOT, &event.key) else {
            return Ok(());
        };
        let labels = parse_labels(&event.value)?;
        update_instance(context, &instance_id, "labels", |instance| instance.labels = labels).await;
        Ok(())
    }
}

/// Applies worker id assignments; deletions are ignored
pub struct InstanceWorkerIdHandler;

#[async_trait]
impl DataChangedEventHandler for InstanceWorkerIdHandler {
    fn subscribed_key(&self) -> &'static str {
        paths::WORKER_ID_ROOT
    }

    fn subscribed_types(&self) -> &'static [ChangeType] {
        &[ChangeType::Added, ChangeType::Updated]
    }

    async fn handle(&self, context: &Arc<ContextManager>, event: &DataChangedEvent) -> Result<()> {
        let Some(instance_id) = paths::parse_instance_attribute(paths::WORKER_ID_ROOT, &event.key) else {
            return Ok(());
        };
        let worker_id = parse_worker_id(&event.value)?;
        update_instance(context, &instance_id, "worker id", |instance| instance.worker_id = worker_id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::test_support::context;
    use crate::cluster::{InstanceMetaData, InstanceType};

    #[tokio::test]
    async fn test_online_then_offline() {
        let context = context("local", InstanceType::Proxy);
        let metadata = InstanceMetaData::new("jdbc-1", InstanceType::Jdbc);
        context.persist().persist_instance_labels("jdbc-1", &["blue".to_string()]).await.unwrap();

        let key = paths::online_instance(InstanceType::Jdbc, "jdbc-1");
        let value = serde_json::to_string(&metadata).unwrap();
        ComputeNodeOnlineHandler
            .handle(&context, &DataChangedEvent::new(key.clone(), value.clone(), ChangeType::Added))
            .await
            .unwrap();
        ComputeNodeOnlineHandler
            .handle(&context, &DataChangedEvent::new(key.clone(), value.clone(), ChangeType::Added))
            .await
            .unwrap();

        let instance = context.instances().get("jdbc-1").await.unwrap();
        assert_eq!(instance.labels, vec!["blue".to_string()]);
        assert_eq!(context.instances().all().await.len(), 2);

        ComputeNodeOnlineHandler
            .handle(&context, &DataChangedEvent::new(key, value, ChangeType::Deleted))
            .await
            .unwrap();
        assert!(context.instances().get("jdbc-1").await.is_none());
    }

    #[tokio::test]
    async fn test_empty_attribute_values_are_normalized() {
        let context = context("local", InstanceType::Proxy);
        context.instances().update("local", |i| {
            i.labels = vec!["a".into()];
            i.worker_id = Some(4);
        }).await;

        InstanceLabelsHandler
            .handle(
                &context,
                &DataChangedEvent::new(paths::instance_labels("local"), "", ChangeType::Updated),
            )
            .await
            .unwrap();
        InstanceWorkerIdHandler
            .handle(
                &context,
                &DataChangedEvent::new(paths::instance_worker_id("local"), "", ChangeType::Updated),
            )
            .await
            .unwrap();

        let local = context.instances().local().await;
        assert!(local.labels.is_empty());
        assert_eq!(local.worker_id, None);
    }

    #[tokio::test]
    async fn test_state_change_and_deletion_ignored() {
        let context = context("local", InstanceType::Proxy);
        let event = DataChangedEvent::new(paths::instance_state("local"), "CIRCUIT_BREAK", ChangeType::Updated);
        InstanceStateHandler.handle(&context, &event).await.unwrap();
        assert_eq!(context.instances().local().await.state, InstanceState::CircuitBreak);

        assert!(!InstanceStateHandler.subscribed_types().contains(&ChangeType::Deleted));

        let bad = DataChangedEvent::new(paths::instance_state("local"), "MAYBE", ChangeType::Updated);
        assert!(InstanceStateHandler.handle(&context, &bad).await.is_err());
    }
}
