//! Active version checks for versioned configuration events.

use crate::error::Result;
use crate::repository::{DataChangedEvent, PersistRepository};

/// Guards versioned configuration handlers against stale events
///
/// An `active_version` event can arrive after the pointer has already moved
/// on; applying it would roll the local view back to an older version.
pub struct ActiveVersionChecker;

impl ActiveVersionChecker {
    /// Whether the event carries the version currently committed at its key
    pub async fn check_same(repository: &dyn PersistRepository, event: &DataChangedEvent) -> Result<bool> {
        let committed = repository.get(&event.key).await?;
        match committed {
            Some(value) if value.trim() == event.value.trim() => Ok(true),
            Some(value) => {
                tracing::warn!(
                    "Skip stale version {} for {}, active version is {}",
                    event.value,
                    event.key,
                    value
                );
                Ok(false)
            }
            None => {
                tracing::warn!("Skip version {} for {}, key no longer exists", event.value, event.key);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{ChangeType, RegistryRepository};

    #[tokio::test]
    async fn test_check_same() {
        let repo = RegistryRepository::open_in_memory().unwrap();
        repo.persist("/props/active_version", "2").await.unwrap();

        let current = DataChangedEvent::new("/props/active_version", "2", ChangeType::Updated);
        let stale = DataChangedEvent::new("/props/active_version", "1", ChangeType::Updated);
        let gone = DataChangedEvent::new("/rules/x/active_version", "0", ChangeType::Added);

        assert!(ActiveVersionChecker::check_same(&repo, &current).await.unwrap());
        assert!(!ActiveVersionChecker::check_same(&repo, &stale).await.unwrap());
        assert!(!ActiveVersionChecker::check_same(&repo, &gone).await.unwrap());
    }
}
