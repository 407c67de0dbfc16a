//! Compute Node Instances
//!
//! Instance metadata, runtime attributes and the registry of compute nodes
//! currently known to be online.

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Kind of compute node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceType {
    /// Standalone proxy process serving client connections
    #[default]
    Proxy,
    /// Driver embedded in an application process
    Jdbc,
}

impl InstanceType {
    /// Path segment used in repository keys
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceType::Proxy => "proxy",
            InstanceType::Jdbc => "jdbc",
        }
    }

    /// Parse a repository path segment
    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "proxy" => Some(InstanceType::Proxy),
            "jdbc" => Some(InstanceType::Jdbc),
            _ => None,
        }
    }
}

impl std::fmt::Display for InstanceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Runtime state of a compute node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    #[default]
    Ok,
    /// Node refuses traffic
    CircuitBreak,
    /// Node only serves reads
    ReadOnly,
}

impl InstanceState {
    /// Parse a persisted state value; empty means [`InstanceState::Ok`]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "" | "OK" => Some(InstanceState::Ok),
            "CIRCUIT_BREAK" => Some(InstanceState::CircuitBreak),
            "READ_ONLY" => Some(InstanceState::ReadOnly),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Ok => "OK",
            InstanceState::CircuitBreak => "CIRCUIT_BREAK",
            InstanceState::ReadOnly => "READ_ONLY",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Static description of a compute node, persisted under its online key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMetaData {
    pub id: String,
    #[serde(rename = "type")]
    pub instance_type: InstanceType,
    /// Address other nodes and operators can reach this node at
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub version: String,
}

impl InstanceMetaData {
    pub fn new(id: impl Into<String>, instance_type: InstanceType) -> Self {
        Self {
            id: id.into(),
            instance_type,
            address: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// A compute node with its mutable runtime attributes
///
/// Two instances are the same node when their ids match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeNodeInstance {
    pub metadata: InstanceMetaData,
    pub state: InstanceState,
    pub labels: Vec<String>,
    pub worker_id: Option<i64>,
    pub online_since: chrono::DateTime<chrono::Utc>,
}

impl ComputeNodeInstance {
    pub fn new(metadata: InstanceMetaData) -> Self {
        Self {
            metadata,
            state: InstanceState::Ok,
            labels: Vec::new(),
            worker_id: None,
            online_since: chrono::Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn instance_type(&self) -> InstanceType {
        self.metadata.instance_type
    }
}

impl PartialEq for ComputeNodeInstance {
    fn eq(&self, other: &Self) -> bool {
        self.metadata.id == other.metadata.id
    }
}

impl Eq for ComputeNodeInstance {}

/// Summary of the known compute nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub total_instances: usize,
    pub proxy_instances: usize,
    pub jdbc_instances: usize,
    pub circuit_broken: usize,
}

/// Registry of online compute nodes, including this one
pub struct ClusterInstanceRegistry {
    /// This node
    local: RwLock<ComputeNodeInstance>,
    /// Other online nodes
    instances: RwLock<Vec<ComputeNodeInstance>>,
}

impl ClusterInstanceRegistry {
    /// Create a registry for the local node
    pub fn new(local: ComputeNodeInstance) -> Self {
        Self {
            local: RwLock::new(local),
            instances: RwLock::new(Vec::new()),
        }
    }

    /// Snapshot of the local node
    pub async fn local(&self) -> ComputeNodeInstance {
        self.local.read().await.clone()
    }

    pub async fn local_id(&self) -> String {
        self.local.read().await.metadata.id.clone()
    }

    pub async fn is_local(&self, instance_id: &str) -> bool {
        self.local.read().await.metadata.id == instance_id
    }

    /// Add or replace a node; re-adding the same id keeps one entry
    pub async fn add(&self, instance: ComputeNodeInstance) {
        if self.is_local(instance.id()).await {
            return;
        }
        let mut instances = self.instances.write().await;
        instances.retain(|each| each != &instance);
        tracing::info!(
            "Compute node {} ({}) is online",
            instance.id(),
            instance.instance_type()
        );
        instances.push(instance);
    }

    /// Remove a node; returns the removed entry
    pub async fn remove(&self, instance_id: &str) -> Option<ComputeNodeInstance> {
        let mut instances = self.instances.write().await;
        let position = instances.iter().position(|each| each.id() == instance_id)?;
        tracing::info!("Compute node {} went offline", instance_id);
        Some(instances.remove(position))
    }

    /// Look up a node (local or remote)
    pub async fn get(&self, instance_id: &str) -> Option<ComputeNodeInstance> {
        {
            let local = self.local.read().await;
            if local.id() == instance_id {
                return Some(local.clone());
            }
        }
        self.instances
            .read()
            .await
            .iter()
            .find(|each| each.id() == instance_id)
            .cloned()
    }

    /// Apply `update` to the node with `instance_id`; returns false when unknown
    pub async fn update<F>(&self, instance_id: &str, update: F) -> bool
    where
        F: FnOnce(&mut ComputeNodeInstance),
    {
        {
            let mut local = self.local.write().await;
            if local.id() == instance_id {
                update(&mut local);
                return true;
            }
        }
        let mut instances = self.instances.write().await;
        match instances.iter_mut().find(|each| each.id() == instance_id) {
            Some(instance) => {
                update(instance);
                true
            }
            None => false,
        }
    }

    /// Every known node, local first
    pub async fn all(&self) -> Vec<ComputeNodeInstance> {
        let mut result = vec![self.local().await];
        result.extend(self.instances.read().await.iter().cloned());
        result
    }

    /// Ids of every known node of the given type
    pub async fn ids_of_type(&self, instance_type: InstanceType) -> Vec<String> {
        self.all()
            .await
            .into_iter()
            .filter(|each| each.instance_type() == instance_type)
            .map(|each| each.metadata.id)
            .collect()
    }

    /// Ids of every known node
    pub async fn ids(&self) -> Vec<String> {
        self.all().await.into_iter().map(|each| each.metadata.id).collect()
    }

    /// Get cluster summary
    pub async fn summary(&self) -> ClusterSummary {
        let all = self.all().await;
        ClusterSummary {
            total_instances: all.len(),
            proxy_instances: all
                .iter()
                .filter(|each| each.instance_type() == InstanceType::Proxy)
                .count(),
            jdbc_instances: all
                .iter()
                .filter(|each| each.instance_type() == InstanceType::Jdbc)
                .count(),
            circuit_broken: all
                .iter()
                .filter(|each| each.state == InstanceState::CircuitBreak)
                .count(),
        }
    }
}
