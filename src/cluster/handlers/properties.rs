//! Properties changes.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cluster::context::ContextManager;
use crate::cluster::dispatch::DataChangedEventHandler;
use crate::cluster::paths;
use crate::cluster::version::ActiveVersionChecker;
use crate::error::{Error, Result};
use crate::repository::{ChangeType, DataChangedEvent};

/// Reloads properties when their active version moves
pub struct PropertiesChangedHandler;

#[async_trait]
impl DataChangedEventHandler for PropertiesChangedHandler {
    fn subscribed_key(&self) -> &'static str {
        paths::PROPS_ROOT
    }

    fn subscribed_types(&self) -> &'static [ChangeType] {
        &[ChangeType::Added, ChangeType::Updated]
    }

    async fn handle(&self, context: &Arc<ContextManager>, event: &DataChangedEvent) -> Result<()> {
        if event.key != paths::PROPS_ACTIVE_VERSION {
            return Ok(());
        }
        if !ActiveVersionChecker::check_same(context.repository().as_ref(), event).await? {
            return Ok(());
        }
        let props = context
            .persist()
            .load_properties(&event.value)
            .await?
            .ok_or_else(|| Error::MissingConfiguration(format!("properties version {}", event.value)))?;
        tracing::info!("Properties changed to version {} ({} entries)", event.value.trim(), props.len());
        context.alter_properties(props).await;
        Ok(())
    }
}
