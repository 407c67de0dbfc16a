//! Global rule configuration changes.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cluster::context::ContextManager;
use crate::cluster::dispatch::DataChangedEventHandler;
use crate::cluster::paths;
use crate::cluster::version::ActiveVersionChecker;
use crate::error::{Error, Result};
use crate::repository::{ChangeType, DataChangedEvent};

/// Reloads a global rule when its active version moves
pub struct GlobalRuleChangedHandler;

#[async_trait]
impl DataChangedEventHandler for GlobalRuleChangedHandler {
    fn subscribed_key(&self) -> &'static str {
        paths::RULES_ROOT
    }

    fn subscribed_types(&self) -> &'static [ChangeType] {
        &[ChangeType::Added, ChangeType::Updated]
    }

    async fn handle(&self, context: &Arc<ContextManager>, event: &DataChangedEvent) -> Result<()> {
        // Version bodies are written before the pointer; only the pointer matters
        let Some(rule_name) = paths::parse_rule_active_version(&event.key) else {
            return Ok(());
        };
        if !ActiveVersionChecker::check_same(context.repository().as_ref(), event).await? {
            return Ok(());
        }
        let config = context
            .persist()
            .load_global_rule(&rule_name, &event.value)
            .await?
            .ok_or_else(|| {
                Error::MissingConfiguration(format!("global rule {} version {}", rule_name, event.value))
            })?;
        context.alter_global_rule(&rule_name, config).await;
        tracing::info!("Global rule {} changed to version {}", rule_name, event.value.trim());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::test_support::context;
    use crate::cluster::InstanceType;

    #[tokio::test]
    async fn test_applies_current_version() {
        let context = context("local", InstanceType::Proxy);
        context
            .persist()
            .alter_global_rule("sql_parser", &serde_json::json!({"cache": 128}))
            .await
            .unwrap();

        let event = DataChangedEvent::new(paths::rule_active_version("sql_parser"), "0", ChangeType::Added);
        GlobalRuleChangedHandler.handle(&context, &event).await.unwrap();
        assert_eq!(context.global_rule("sql_parser").await.unwrap()["cache"], 128);
    }

    #[tokio::test]
    async fn test_stale_version_is_skipped() {
        let context = context("local", InstanceType::Proxy);
        let persist = context.persist();
        persist.alter_global_rule("r", &serde_json::json!({"v": 0})).await.unwrap();
        persist.alter_global_rule("r", &serde_json::json!({"v": 1})).await.unwrap();

        let stale = DataChangedEvent::new(paths::rule_active_version("r"), "0", ChangeType::Updated);
        GlobalRuleChangedHandler.handle(&context, &stale).await.unwrap();
        assert!(context.global_rule("r").await.is_none());

        let current = DataChangedEvent::new(paths::rule_active_version("r"), "1", ChangeType::Updated);
        GlobalRuleChangedHandler.handle(&context, &current).await.unwrap();
        assert_eq!(context.global_rule("r").await.unwrap()["v"], 1);
    }

    #[tokio::test]
    async fn test_missing_version_body_is_an_error() {
        let context = context("local", InstanceType::Proxy);
        context
            .repository()
            .persist(&paths::rule_active_version("ghost"), "7")
            .await
            .unwrap();

        let event = DataChangedEvent::new(paths::rule_active_version("ghost"), "7", ChangeType::Added);
        let result = GlobalRuleChangedHandler.handle(&context, &event).await;
        assert!(matches!(result, Err(Error::MissingConfiguration(_))));
    }

    #[tokio::test]
    async fn test_version_body_keys_are_ignored() {
        let context = context("local", InstanceType::Proxy);
        let event = DataChangedEvent::new(paths::rule_version("r", 0), "{}", ChangeType::Added);
        GlobalRuleChangedHandler.handle(&context, &event).await.unwrap();
        assert!(context.global_rules().await.is_empty());
    }
}
