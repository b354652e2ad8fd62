use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{
    ExecutionError, GraphQLError, OperationKind, RequestContext, Subschema, selection::Document,
};

/// A standalone operation for one subschema. The document defines every
/// variable and fragment it references.
#[derive(Debug, Clone)]
pub struct SubRequest {
    pub document: Document,
    pub variables: Map<String, Value>,
    pub operation: OperationKind,
    /// Response key of the single root field, as it appears in `data`.
    pub root_field: String,
}

impl SubRequest {
    pub fn query(&self) -> String {
        self.document.to_string()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ExecutionResult {
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
}

impl ExecutionResult {
    pub fn from_data(data: Value) -> Self {
        ExecutionResult {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    pub fn from_error(error: GraphQLError) -> Self {
        ExecutionResult {
            data: None,
            errors: vec![error],
        }
    }
}

/// Runs a query or mutation against one backend.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        request: SubRequest,
        context: &RequestContext,
    ) -> Result<ExecutionResult, ExecutionError>;
}

/// Opens a subscription against one backend. Dropping the returned stream
/// must end the upstream subscription.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(
        &self,
        request: SubRequest,
        context: &RequestContext,
    ) -> Result<BoxStream<'static, ExecutionResult>, ExecutionError>;
}

/// Executes `request` on `subschema`, folding an executor failure into the
/// error list of the result. Nothing is retried.
pub(crate) async fn execute_on(
    subschema: &Subschema,
    request: SubRequest,
    context: &RequestContext,
) -> ExecutionResult {
    debug!(
        subschema = %subschema.name,
        operation = %request.operation,
        root_field = %request.root_field,
        "Dispatching sub-request"
    );
    match subschema.executor.execute(request, context).await {
        Ok(result) => result,
        Err(error) => {
            warn!(subschema = %subschema.name, %error, "Sub-request failed");
            ExecutionResult::from_error(error.into())
        }
    }
}
