pub mod config;
pub mod error;
pub mod federation_gateway;
pub mod merge_resolver;
pub mod merged_type;
pub mod query_executor;
pub mod query_planner;
pub mod request_builder;
pub mod result_merger;
pub mod schema_graph;
pub mod schema_registry;
pub mod selection;

pub use config::StitchingConfig;
pub use error::{DelegationError, ExecutionError};
pub use federation_gateway::{DelegationRequest, FederationGateway};
pub use merge_resolver::{KeyArgResolver, MergeRequest, MergeResolver};
pub use merged_type::MergedTypeInfo;
pub use query_executor::{ExecutionResult, Executor, SubRequest, Subscriber};
pub use query_planner::{DelegationPlan, DelegationPlanner, DelegationStage};
pub use request_builder::{DelegationTarget, SubRequestBuilder};
pub use result_merger::{OperationScope, ResultMerger};
pub use schema_graph::{ScalarCodec, SchemaGraph, TypeKind, TypeRef};
pub use schema_registry::{
    InMemorySchemaRegistry, MergedTypeConfig, SchemaRegistry, StitchedSchema, Subschema,
    SubschemaId,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::HashMap, fmt};

pub const TYPENAME_FIELD: &str = "__typename";

#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLRequest {
    pub query: String,
    pub variables: Option<Value>,
    pub operation_name: Option<String>,
    #[serde(skip)]
    pub auth_headers: Option<HashMap<String, String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct GraphQLResponse {
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
}

/// One segment of a response path.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(index) => write!(f, "{}", index),
            PathSegment::Key(key) => f.write_str(key),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathSegment>>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
    /// The errors this one was combined from, when several errors landed on
    /// the same null position.
    #[serde(skip)]
    pub original_errors: Vec<GraphQLError>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        GraphQLError {
            message: message.into(),
            path: None,
            extensions: Map::new(),
            original_errors: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_path(mut self, path: Vec<PathSegment>) -> Self {
        self.path = Some(path);
        self
    }

    /// Folds several errors into one whose message lists every original
    /// message on its own line.
    pub fn combine(mut errors: Vec<GraphQLError>) -> GraphQLError {
        if errors.len() == 1 {
            return errors.remove(0);
        }
        let message = errors
            .iter()
            .map(|error| error.message.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        GraphQLError {
            message,
            path: None,
            extensions: Map::new(),
            original_errors: errors,
        }
    }
}

impl From<ExecutionError> for GraphQLError {
    fn from(error: ExecutionError) -> Self {
        GraphQLError::new(error.message)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        })
    }
}

/// Per-request values handed through to every executor call.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub headers: HashMap<String, String>,
}
