//! Compute Node Registration
//!
//! Publishes this node's attributes and online marker, and reserves a
//! cluster-unique worker id for it.

use std::sync::Arc;

use rand::Rng;

use super::context::ContextManager;
use super::paths;
use crate::error::{Error, Result};

/// Worker ids are handed out from `0..MAX_WORKER_ID`
pub const MAX_WORKER_ID: i64 = 1024;

/// Registers the local node with the cluster
pub struct ComputeNodeRegistrar {
    context: Arc<ContextManager>,
}

impl ComputeNodeRegistrar {
    pub fn new(context: Arc<ContextManager>) -> Self {
        Self { context }
    }

    /// Publish attributes, reserve a worker id, then mark the node online.
    ///
    /// The online marker is written last so that peers loading this node on
    /// its online event see the attributes already in place.
    pub async fn online(&self) -> Result<i64> {
        let local = self.context.instances().local().await;
        let persist = self.context.persist();
        let instance_id = local.id().to_string();

        let worker_id = self.reserve_worker_id(&instance_id).await?;
        persist.persist_instance_worker_id(&instance_id, worker_id).await?;
        persist.persist_instance_labels(&instance_id, &local.labels).await?;
        persist.persist_instance_state(&instance_id, local.state).await?;
        persist.persist_instance_online(&local.metadata).await?;

        self.context
            .instances()
            .update(&instance_id, |instance| instance.worker_id = Some(worker_id))
            .await;
        tracing::info!(
            "Compute node {} ({}) online with worker id {}",
            instance_id,
            local.instance_type(),
            worker_id
        );
        Ok(worker_id)
    }

    /// Remove the online marker and release the worker id
    pub async fn offline(&self) -> Result<()> {
        let local = self.context.instances().local().await;
        let persist = self.context.persist();
        persist.persist_instance_offline(&local.metadata).await?;

        if let Some(worker_id) = persist.load_instance_worker_id(local.id()).await? {
            let reservation = paths::worker_id_reservation(worker_id);
            let repository = self.context.repository();
            if repository.get(&reservation).await?.as_deref() == Some(local.id()) {
                repository.delete(&reservation).await?;
            }
        }
        tracing::info!("Compute node {} offline", local.id());
        Ok(())
    }

    /// Reuse this instance's reservation, or claim a free worker id
    pub async fn reserve_worker_id(&self, instance_id: &str) -> Result<i64> {
        let repository = self.context.repository();
        if let Some(existing) = self.context.persist().load_instance_worker_id(instance_id).await? {
            let reservation = paths::worker_id_reservation(existing);
            match repository.get(&reservation).await? {
                Some(owner) if owner == instance_id => return Ok(existing),
                None => {
                    if repository.persist_exclusive(&reservation, instance_id).await? {
                        return Ok(existing);
                    }
                }
                Some(_) => {}
            }
        }

        let start = rand::thread_rng().gen_range(0..MAX_WORKER_ID);
        for offset in 0..MAX_WORKER_ID {
            let candidate = (start + offset) % MAX_WORKER_ID;
            if repository
                .persist_exclusive(&paths::worker_id_reservation(candidate), instance_id)
                .await?
            {
                tracing::debug!("Reserved worker id {} for {}", candidate, instance_id);
                return Ok(candidate);
            }
        }
        Err(Error::Internal(format!(
            "No free worker id left for instance {}",
            instance_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::test_support::context_with_repository;
    use crate::cluster::InstanceType;
    use crate::repository::{PersistRepository, RegistryRepository};

    #[tokio::test]
    async fn test_online_publishes_and_reuses_worker_id() {
        let repository: Arc<dyn PersistRepository> =
            Arc::new(RegistryRepository::open_in_memory().unwrap());
        let context = context_with_repository("p1", InstanceType::Proxy, Arc::clone(&repository));
        let registrar = ComputeNodeRegistrar::new(Arc::clone(&context));

        let first = registrar.online().await.unwrap();
        assert!(repository
            .exists(&paths::online_instance(InstanceType::Proxy, "p1"))
            .await
            .unwrap());
        assert_eq!(context.instances().local().await.worker_id, Some(first));

        let second = registrar.online().await.unwrap();
        assert_eq!(first, second);

        registrar.offline().await.unwrap();
        assert!(!repository
            .exists(&paths::online_instance(InstanceType::Proxy, "p1"))
            .await
            .unwrap());
        assert!(!repository
            .exists(&paths::worker_id_reservation(first))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_worker_ids_are_unique() {
        let repository: Arc<dyn PersistRepository> =
            Arc::new(RegistryRepository::open_in_memory().unwrap());
        let a = ComputeNodeRegistrar::new(context_with_repository("a", InstanceType::Proxy, Arc::clone(&repository)));
        let b = ComputeNodeRegistrar::new(context_with_repository("b", InstanceType::Jdbc, Arc::clone(&repository)));

        assert_ne!(a.online().await.unwrap(), b.online().await.unwrap());
    }
}
