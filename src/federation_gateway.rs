use futures::{
    StreamExt,
    future::join_all,
    stream::{self, BoxStream},
};
use graphql_parser::query::{Definition, OperationDefinition, parse_query};
use serde_json::{Map, Value};
use std::{path::Path, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use crate::{
    DelegationError, Executor, GraphQLError, GraphQLRequest, GraphQLResponse, OperationKind,
    PathSegment, RequestContext, StitchedSchema, StitchingConfig, SubRequestBuilder, Subschema,
    TYPENAME_FIELD,
    request_builder::DelegationTarget,
    result_merger::{OperationScope, ResultMerger, merged_field},
    schema_registry::SchemaRegistry,
    selection::{
        Field, FieldCollector, Fragments, SelectionSet, const_value_to_json, parse_selection_set,
        plain_field,
    },
};

/// A field delegated by hand to one named subschema, with its arguments
/// given as values.
#[derive(Debug, Clone)]
pub struct DelegationRequest {
    pub subschema: String,
    pub operation: OperationKind,
    pub field_name: String,
    pub args: Map<String, Value>,
    /// Selection on the returned value, e.g. `{ id title }`. Leave empty for
    /// leaf fields.
    pub selection_set: Option<String>,
    pub context: RequestContext,
}

struct PreparedOperation {
    kind: OperationKind,
    selection_set: SelectionSet,
    scope: OperationScope,
}

pub struct FederationGateway {
    schema_registry: Arc<RwLock<Box<dyn SchemaRegistry + Send + Sync>>>,
}

impl FederationGateway {
    pub fn new(schema_registry: Box<dyn SchemaRegistry + Send + Sync>) -> Self {
        FederationGateway {
            schema_registry: Arc::new(RwLock::new(schema_registry)),
        }
    }

    pub async fn register_subschema(&self, subschema: Subschema) -> Result<(), DelegationError> {
        let mut schema_registry = self.schema_registry.write().await;
        schema_registry.register_subschema(subschema).await
    }

    /// Registers every subgraph of the configuration at `config_path`.
    pub async fn load_config<F>(
        &self,
        config_path: impl AsRef<Path>,
        executor_for: F,
    ) -> Result<(), DelegationError>
    where
        F: FnMut(&str) -> Option<Arc<dyn Executor>>,
    {
        let config = StitchingConfig::load(config_path)?;
        for subschema in config.into_subschemas(executor_for)? {
            self.register_subschema(subschema).await?;
        }
        Ok(())
    }

    async fn schema(&self) -> Result<Arc<StitchedSchema>, DelegationError> {
        let schema_registry = self.schema_registry.read().await;
        schema_registry.get_schema().await
    }

    #[instrument(level = "debug", skip_all, fields(operation_name = ?request.operation_name))]
    pub async fn process_request(
        &self,
        request: GraphQLRequest,
    ) -> Result<GraphQLResponse, DelegationError> {
        let operation = prepare(request)?;
        if operation.kind == OperationKind::Subscription {
            return Err(DelegationError::SubscriptionsUnsupported(
                "the gateway (use `subscribe` for subscription operations)".to_string(),
            ));
        }

        let schema = self.schema().await?;
        let root_type = root_type_name(&schema, operation.kind)?;
        let scope = &operation.scope;
        let collector = FieldCollector {
            schema: schema.gateway(),
            fragments: &scope.fragments,
            variables: &scope.variables,
        };
        let collected = collector.collect(root_type, &[&operation.selection_set]);
        debug!(kind = %operation.kind, root_fields = collected.len(), "Resolving operation");

        let merger = ResultMerger::new(&schema, scope);
        let results = match operation.kind {
            // Mutation fields run one after another, in selection order.
            OperationKind::Mutation => {
                let mut results = Vec::with_capacity(collected.len());
                for nodes in collected.values() {
                    let result =
                        resolve_root_field(&schema, &merger, operation.kind, root_type, nodes)
                            .await;
                    results.push(result);
                }
                results
            }
            _ => {
                join_all(collected.values().map(|nodes| {
                    resolve_root_field(&schema, &merger, operation.kind, root_type, nodes)
                }))
                .await
            }
        };

        let mut data = Map::new();
        let mut bubbled = false;
        for (key, result) in collected.keys().zip(results) {
            match result? {
                Some(value) => {
                    data.insert(key.clone(), value);
                }
                None => bubbled = true,
            }
        }

        Ok(GraphQLResponse {
            data: Some(if bubbled { Value::Null } else { Value::Object(data) }),
            errors: merger.into_errors(),
        })
    }

    /// Opens the subscription of `request` upstream. Every upstream event is
    /// completed on its own and wrapped under the field's response key;
    /// dropping the returned stream drops the upstream one.
    #[instrument(level = "debug", skip_all, fields(operation_name = ?request.operation_name))]
    pub async fn subscribe(
        &self,
        request: GraphQLRequest,
    ) -> Result<BoxStream<'static, GraphQLResponse>, DelegationError> {
        let operation = prepare(request)?;
        if operation.kind != OperationKind::Subscription {
            return Err(DelegationError::UnknownOperation(format!(
                "expected a subscription, found a {}",
                operation.kind
            )));
        }

        let schema = self.schema().await?;
        let root_type = root_type_name(&schema, operation.kind)?.to_string();
        let scope = Arc::new(operation.scope);
        let (key, field) = {
            let collector = FieldCollector {
                schema: schema.gateway(),
                fragments: &scope.fragments,
                variables: &scope.variables,
            };
            let collected = collector.collect(&root_type, &[&operation.selection_set]);
            let Some((key, nodes)) = collected.first() else {
                return Err(DelegationError::QueryParse(
                    "subscription selects no field".to_string(),
                ));
            };
            (key.clone(), merged_field(nodes)?)
        };

        let ty = schema
            .gateway()
            .field(&root_type, &field.name)
            .map(|definition| definition.ty.clone())
            .ok_or_else(|| DelegationError::UnroutableField {
                type_name: root_type.clone(),
                field_name: field.name.clone(),
            })?;
        let owner = schema
            .root_field_owner(operation.kind, &field.name)
            .ok_or_else(|| DelegationError::UnroutableField {
                type_name: root_type.clone(),
                field_name: field.name.clone(),
            })?;
        let subschema = schema.subschema(owner);
        let subscriber = subschema
            .subscriber
            .clone()
            .ok_or_else(|| DelegationError::SubscriptionsUnsupported(subschema.name.clone()))?;

        let builder = SubRequestBuilder {
            stitched: &schema,
            fragments: &scope.fragments,
            variable_definitions: &scope.variable_definitions,
            variable_values: &scope.variables,
        };
        let sub_request = builder.build(DelegationTarget {
            subschema: owner,
            source_parent_type: &root_type,
            source_field_name: &field.name,
            target_field_name: &field.name,
            arguments: &field.arguments,
            overrides: Map::new(),
            selection_set: field.selection_set.clone(),
        })?;
        let root_field = sub_request.root_field.clone();
        debug!(subschema = %subschema.name, field = %field.name, "Opening upstream subscription");

        let upstream = match subscriber.subscribe(sub_request, &scope.context).await {
            Ok(upstream) => upstream,
            Err(error) => {
                warn!(subschema = %subschema.name, %error, "Subscription failed");
                let response = GraphQLResponse {
                    data: None,
                    errors: vec![error.into()],
                };
                return Ok(stream::once(async move { response }).boxed());
            }
        };

        let schema = schema.clone();
        Ok(upstream
            .then(move |event| {
                let schema = schema.clone();
                let scope = scope.clone();
                let field = field.clone();
                let ty = ty.clone();
                let root_field = root_field.clone();
                let key = key.clone();
                async move {
                    let merger = ResultMerger::new(&schema, &scope);
                    let path = vec![PathSegment::Key(key.clone())];
                    let merged = merger
                        .merge(owner, event, &root_field, &ty, &[&field], path)
                        .await;
                    match merged {
                        Ok(Some(value)) => {
                            let mut data = Map::new();
                            data.insert(key, value);
                            GraphQLResponse {
                                data: Some(Value::Object(data)),
                                errors: merger.into_errors(),
                            }
                        }
                        Ok(None) => GraphQLResponse {
                            data: Some(Value::Null),
                            errors: merger.into_errors(),
                        },
                        Err(error) => GraphQLResponse {
                            data: None,
                            errors: vec![GraphQLError::new(error.to_string())],
                        },
                    }
                }
            })
            .boxed())
    }

    /// Delegates one root field to the named subschema with explicit
    /// arguments and completes the result.
    #[instrument(
        level = "debug",
        skip_all,
        fields(subschema = %request.subschema, field = %request.field_name)
    )]
    pub async fn delegate_to_schema(
        &self,
        request: DelegationRequest,
    ) -> Result<GraphQLResponse, DelegationError> {
        if request.operation == OperationKind::Subscription {
            return Err(DelegationError::SubscriptionsUnsupported(request.subschema));
        }
        let schema = self.schema().await?;
        let subschema = schema
            .subschema_by_name(&request.subschema)
            .ok_or_else(|| {
                DelegationError::Config(format!("unknown subschema \"{}\"", request.subschema))
            })?;
        let root_type = root_type_name(&schema, request.operation)?;

        let mut field = plain_field(&request.field_name);
        if let Some(selection_set) = &request.selection_set {
            field.selection_set = parse_selection_set(selection_set)?;
        }
        let scope = OperationScope {
            context: request.context,
            ..Default::default()
        };

        let merger = ResultMerger::new(&schema, &scope);
        let value = merger
            .delegate(subschema, root_type, &[&field], request.args)
            .await?;

        let mut data = Map::new();
        data.insert(request.field_name, value.unwrap_or(Value::Null));
        Ok(GraphQLResponse {
            data: Some(Value::Object(data)),
            errors: merger.into_errors(),
        })
    }
}

fn root_type_name(schema: &StitchedSchema, kind: OperationKind) -> Result<&str, DelegationError> {
    schema
        .gateway()
        .root_type_name(kind)
        .ok_or_else(|| DelegationError::MissingRootType {
            subschema: "gateway".to_string(),
            operation: kind.to_string(),
        })
}

async fn resolve_root_field<'a>(
    schema: &'a StitchedSchema,
    merger: &ResultMerger<'a>,
    kind: OperationKind,
    root_type: &str,
    nodes: &[&'a Field],
) -> Result<Option<Value>, DelegationError> {
    let Some(first) = nodes.first() else {
        return Err(DelegationError::EmptyFieldNodes);
    };
    let field_name = &first.name;
    if field_name == TYPENAME_FIELD {
        return Ok(Some(Value::String(root_type.to_string())));
    }
    let owner = schema
        .root_field_owner(kind, field_name)
        .ok_or_else(|| DelegationError::UnroutableField {
            type_name: root_type.to_string(),
            field_name: field_name.clone(),
        })?;
    merger.delegate(owner, root_type, nodes, Map::new()).await
}

/// Parses the client document and picks the operation to run.
fn prepare(request: GraphQLRequest) -> Result<PreparedOperation, DelegationError> {
    let document = parse_query::<String>(&request.query)
        .map_err(|e| DelegationError::QueryParse(e.to_string()))?
        .into_static();

    let mut fragments = Fragments::new();
    let mut operations = Vec::new();
    for definition in document.definitions {
        match definition {
            Definition::Fragment(fragment) => {
                fragments.insert(fragment.name.clone(), fragment);
            }
            Definition::Operation(OperationDefinition::SelectionSet(set)) => {
                operations.push((None, OperationKind::Query, Vec::new(), set));
            }
            Definition::Operation(OperationDefinition::Query(query)) => {
                operations.push((
                    query.name,
                    OperationKind::Query,
                    query.variable_definitions,
                    query.selection_set,
                ));
            }
            Definition::Operation(OperationDefinition::Mutation(mutation)) => operations.push((
                mutation.name,
                OperationKind::Mutation,
                mutation.variable_definitions,
                mutation.selection_set,
            )),
            Definition::Operation(OperationDefinition::Subscription(subscription)) => {
                operations.push((
                    subscription.name,
                    OperationKind::Subscription,
                    subscription.variable_definitions,
                    subscription.selection_set,
                ))
            }
        }
    }

    let (_, kind, variable_definitions, selection_set) = match &request.operation_name {
        Some(name) => {
            let index = operations
                .iter()
                .position(|(operation_name, ..)| operation_name.as_deref() == Some(name.as_str()))
                .ok_or_else(|| DelegationError::UnknownOperation(name.clone()))?;
            operations.swap_remove(index)
        }
        None if operations.len() == 1 => operations.remove(0),
        None if operations.is_empty() => {
            return Err(DelegationError::QueryParse("document contains no operation".to_string()));
        }
        None => return Err(DelegationError::AmbiguousOperation),
    };

    let mut variables = match request.variables {
        Some(Value::Object(variables)) => variables,
        _ => Map::new(),
    };
    for definition in &variable_definitions {
        if let Some(default) = &definition.default_value {
            if !variables.contains_key(&definition.name) {
                variables.insert(definition.name.clone(), const_value_to_json(default));
            }
        }
    }

    Ok(PreparedOperation {
        kind,
        selection_set,
        scope: OperationScope {
            fragments,
            variable_definitions,
            variables,
            context: RequestContext {
                headers: request.auth_headers.unwrap_or_default(),
            },
        },
    })
}
