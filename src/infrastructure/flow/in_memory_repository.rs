//! In-memory flow repository implementation

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::DomainError;
use crate::domain::flow::{FlowDefinition, FlowRepository};

/// In-memory implementation of FlowRepository, versions kept per code
#[derive(Debug, Default)]
pub struct InMemoryFlowRepository {
    flows: Arc<RwLock<HashMap<String, BTreeMap<u32, FlowDefinition>>>>,
}

impl InMemoryFlowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a repository pre-populated with flows
    pub fn with_flows(flows: Vec<FlowDefinition>) -> Self {
        let mut map: HashMap<String, BTreeMap<u32, FlowDefinition>> = HashMap::new();
        for flow in flows {
            map.entry(flow.code().as_str().to_string())
                .or_default()
                .insert(flow.version(), flow);
        }

        Self {
            flows: Arc::new(RwLock::new(map)),
        }
    }
}

#[async_trait]
impl FlowRepository for InMemoryFlowRepository {
    async fn get_by_code(
        &self,
        code: &str,
        version: Option<u32>,
    ) -> Result<Option<FlowDefinition>, DomainError> {
        let flows = self.flows.read().await;
        let Some(versions) = flows.get(code) else {
            return Ok(None);
        };

        let flow = match version {
            Some(version) => versions.get(&version),
            None => versions.values().next_back(),
        };
        Ok(flow.cloned())
    }

    async fn save(&self, flow: FlowDefinition) -> Result<(), DomainError> {
        let mut flows = self.flows.write().await;
        flows
            .entry(flow.code().as_str().to_string())
            .or_default()
            .insert(flow.version(), flow);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flow::FlowCode;

    fn create_flow(code: &str, version: u32) -> FlowDefinition {
        FlowDefinition::new(FlowCode::new(code).unwrap(), format!("{} v{}", code, version))
            .with_version(version)
    }

    #[tokio::test]
    async fn test_get_latest_and_pinned_version() {
        let repo = InMemoryFlowRepository::with_flows(vec![
            create_flow("support", 1),
            create_flow("support", 3),
            create_flow("support", 2),
        ]);

        let latest = repo.get_by_code("support", None).await.unwrap().unwrap();
        assert_eq!(latest.version(), 3);

        let pinned = repo.get_by_code("support", Some(2)).await.unwrap().unwrap();
        assert_eq!(pinned.name(), "support v2");

        assert!(repo.get_by_code("support", Some(9)).await.unwrap().is_none());
        assert!(repo.get_by_code("billing", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_replaces_same_version() {
        let repo = InMemoryFlowRepository::new();
        repo.save(create_flow("support", 1)).await.unwrap();

        let renamed = FlowDefinition::new(FlowCode::new("support").unwrap(), "renamed");
        repo.save(renamed).await.unwrap();

        let flow = repo.get_by_code("support", Some(1)).await.unwrap().unwrap();
        assert_eq!(flow.name(), "renamed");
    }
}
