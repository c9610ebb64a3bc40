//! Flow repository trait

use async_trait::async_trait;

use super::entity::FlowDefinition;
use crate::domain::error::DomainError;

#[cfg(test)]
use mockall::automock;

/// Source of flow definitions, used to load subprocess children
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FlowRepository: Send + Sync + std::fmt::Debug {
    /// Get a flow by code; the latest version when `version` is None
    async fn get_by_code(
        &self,
        code: &str,
        version: Option<u32>,
    ) -> Result<Option<FlowDefinition>, DomainError>;

    /// Store a flow version, replacing an existing one with the same code and version
    async fn save(&self, flow: FlowDefinition) -> Result<(), DomainError>;
}
