#![allow(dead_code)]

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use portkey_stitch::{
    ExecutionError, ExecutionResult, Executor, GraphQLError, GraphQLRequest, RequestContext,
    SubRequest, Subscriber,
};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};

/// One sub-request as a subschema received it.
#[derive(Debug, Clone)]
pub struct Call {
    pub subschema: String,
    pub root_field: String,
    pub query: String,
    pub variables: Map<String, Value>,
}

/// Shared record of every sub-request, in dispatch order.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn subschemas(&self) -> Vec<String> {
        self.calls().into_iter().map(|call| call.subschema).collect()
    }

    fn push(&self, subschema: &str, request: &SubRequest) {
        self.0.lock().unwrap().push(Call {
            subschema: subschema.to_string(),
            root_field: request.root_field.clone(),
            query: request.query(),
            variables: request.variables.clone(),
        });
    }
}

type Responder = dyn Fn(&SubRequest) -> Result<ExecutionResult, ExecutionError> + Send + Sync;

/// In-memory backend answering every sub-request through a closure.
pub struct MockExecutor {
    name: String,
    log: CallLog,
    respond: Box<Responder>,
}

impl MockExecutor {
    pub fn new<F>(name: &str, log: &CallLog, respond: F) -> Arc<Self>
    where
        F: Fn(&SubRequest) -> Result<ExecutionResult, ExecutionError> + Send + Sync + 'static,
    {
        Arc::new(MockExecutor {
            name: name.to_string(),
            log: log.clone(),
            respond: Box::new(respond),
        })
    }

    /// A backend that always answers with `data`.
    pub fn fixed(name: &str, log: &CallLog, data: Value) -> Arc<Self> {
        MockExecutor::new(name, log, move |_| Ok(ExecutionResult::from_data(data.clone())))
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn execute(
        &self,
        request: SubRequest,
        _context: &RequestContext,
    ) -> Result<ExecutionResult, ExecutionError> {
        self.log.push(&self.name, &request);
        (self.respond)(&request)
    }
}

/// Replays a fixed list of events for every subscription.
pub struct ReplaySubscriber {
    pub name: String,
    pub log: CallLog,
    pub events: Vec<ExecutionResult>,
}

#[async_trait]
impl Subscriber for ReplaySubscriber {
    async fn subscribe(
        &self,
        request: SubRequest,
        _context: &RequestContext,
    ) -> Result<BoxStream<'static, ExecutionResult>, ExecutionError> {
        self.log.push(&self.name, &request);
        Ok(futures::stream::iter(self.events.clone()).boxed())
    }
}

pub fn request(query: &str) -> GraphQLRequest {
    GraphQLRequest {
        query: query.to_string(),
        ..Default::default()
    }
}

pub fn error_at(message: &str, path: Value) -> GraphQLError {
    GraphQLError::new(message).with_path(serde_json::from_value(path).unwrap())
}
