//! Closed set of node kinds

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of a flow node
///
/// Unrecognised type names deserialize to [`NodeType::Unknown`] so that
/// validation can report them instead of failing the whole document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    End,
    Reply,
    Wait,
    Selector,
    HttpRequest,
    Loop,
    Subprocess,
    KnowledgeRetrieval,
    VectorStore,
    VectorSearch,
    Code,
    VariableSave,
    Llm,
    IntentRecognition,
    DocumentParse,
    #[serde(other)]
    Unknown,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Reply => "reply",
            Self::Wait => "wait",
            Self::Selector => "selector",
            Self::HttpRequest => "http_request",
            Self::Loop => "loop",
            Self::Subprocess => "subprocess",
            Self::KnowledgeRetrieval => "knowledge_retrieval",
            Self::VectorStore => "vector_store",
            Self::VectorSearch => "vector_search",
            Self::Code => "code",
            Self::VariableSave => "variable_save",
            Self::Llm => "llm",
            Self::IntentRecognition => "intent_recognition",
            Self::DocumentParse => "document_parse",
            Self::Unknown => "unknown",
        }
    }

    /// Control nodes are interpreted by the scheduler and never reach a runner
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Self::Selector | Self::Loop | Self::Subprocess | Self::Wait
        )
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_type_serialization() {
        let json = serde_json::to_string(&NodeType::HttpRequest).unwrap();
        assert_eq!(json, "\"http_request\"");

        let parsed: NodeType = serde_json::from_str("\"variable_save\"").unwrap();
        assert_eq!(parsed, NodeType::VariableSave);
    }

    #[test]
    fn test_unrecognised_type_is_unknown() {
        let parsed: NodeType = serde_json::from_str("\"image_generation\"").unwrap();
        assert_eq!(parsed, NodeType::Unknown);
    }

    #[test]
    fn test_control_types() {
        assert!(NodeType::Selector.is_control());
        assert!(NodeType::Wait.is_control());
        assert!(!NodeType::Reply.is_control());
        assert!(!NodeType::Start.is_control());
    }

    #[test]
    fn test_display_matches_serde_name() {
        assert_eq!(NodeType::KnowledgeRetrieval.to_string(), "knowledge_retrieval");
    }
}
