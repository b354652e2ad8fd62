//! Folds sub-request results back into the client's response tree.
//!
//! Values are completed against the gateway schema and the client's own
//! selections: errors are rebased onto client paths, nulls bubble to the
//! nearest nullable position, and objects of merged types are completed
//! with further delegations planned per object.

use futures::future::{self, BoxFuture, FutureExt, join_all};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};
use tracing::{debug, warn};

use crate::{
    DelegationError, DelegationPlanner, DelegationStage, ExecutionResult, GraphQLError,
    MergedTypeInfo, PathSegment, RequestContext, StitchedSchema, SubRequestBuilder, SubschemaId,
    TYPENAME_FIELD, TypeRef,
    query_executor::execute_on,
    request_builder::DelegationTarget,
    schema_graph::TypeDef,
    selection::{Field, FieldCollector, Fragments, VariableDefinition, response_key},
};

/// The parts of a client operation every delegation made for it needs.
#[derive(Debug, Clone, Default)]
pub struct OperationScope {
    pub fragments: Fragments,
    pub variable_definitions: Vec<VariableDefinition>,
    pub variables: Map<String, Value>,
    pub context: RequestContext,
}

enum MergeAbort {
    /// The value became null at a non-null position; the enclosing nullable
    /// position turns null. Its error has already been recorded.
    NullBubble,
    Fatal(DelegationError),
}

impl From<DelegationError> for MergeAbort {
    fn from(error: DelegationError) -> Self {
        MergeAbort::Fatal(error)
    }
}

type Completion = Result<Value, MergeAbort>;

/// An error whose path is relative to the position being completed.
struct RelativeError {
    error: GraphQLError,
    path: Vec<PathSegment>,
}

impl RelativeError {
    /// Strips the root field segment off a sub-request error. Errors without
    /// a path, or with a foreign root, belong to the root field itself.
    fn rooted_at(error: GraphQLError, root_field: &str) -> Self {
        let path = match &error.path {
            Some(path) if path.first() == Some(&PathSegment::Key(root_field.to_string())) => {
                path[1..].to_vec()
            }
            _ => Vec::new(),
        };
        RelativeError { error, path }
    }
}

type ErrorsByKey = HashMap<String, Vec<RelativeError>>;

fn group_by_key(errors: Vec<RelativeError>) -> (Vec<RelativeError>, ErrorsByKey) {
    let mut here = Vec::new();
    let mut by_key = ErrorsByKey::new();
    for mut error in errors {
        match error.path.first() {
            Some(PathSegment::Key(key)) => {
                let key = key.clone();
                error.path.remove(0);
                by_key.entry(key).or_default().push(error);
            }
            _ => here.push(error),
        }
    }
    (here, by_key)
}

fn group_by_index(
    errors: Vec<RelativeError>,
) -> (Vec<RelativeError>, HashMap<usize, Vec<RelativeError>>) {
    let mut here = Vec::new();
    let mut by_index: HashMap<usize, Vec<RelativeError>> = HashMap::new();
    for mut error in errors {
        match error.path.first() {
            Some(PathSegment::Index(index)) => {
                let index = *index;
                error.path.remove(0);
                by_index.entry(index).or_default().push(error);
            }
            _ => here.push(error),
        }
    }
    (here, by_index)
}

fn child_path(path: &[PathSegment], segment: impl Into<PathSegment>) -> Vec<PathSegment> {
    let mut child = path.to_vec();
    child.push(segment.into());
    child
}

fn describe(path: &[PathSegment]) -> String {
    path.iter().map(ToString::to_string).collect::<Vec<_>>().join(".")
}

/// Several selections of one response key, folded into a single field.
pub(crate) fn merged_field(nodes: &[&Field]) -> Result<Field, DelegationError> {
    let Some((first, rest)) = nodes.split_first() else {
        return Err(DelegationError::EmptyFieldNodes);
    };
    let mut field = (*first).clone();
    for node in rest {
        field
            .selection_set
            .items
            .extend(node.selection_set.items.iter().cloned());
    }
    Ok(field)
}

/// What one merge delegation returned for an object.
struct MergeFetch {
    target: SubschemaId,
    value: Option<Value>,
    errors: Vec<RelativeError>,
}

/// Completes delegated values for one client operation and collects the
/// errors placed in its response.
pub struct ResultMerger<'a> {
    stitched: &'a StitchedSchema,
    scope: &'a OperationScope,
    errors: Mutex<Vec<GraphQLError>>,
}

impl<'a> ResultMerger<'a> {
    pub fn new(stitched: &'a StitchedSchema, scope: &'a OperationScope) -> Self {
        ResultMerger {
            stitched,
            scope,
            errors: Mutex::new(Vec::new()),
        }
    }

    pub fn into_errors(self) -> Vec<GraphQLError> {
        self.errors.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn builder(&self) -> SubRequestBuilder<'a> {
        SubRequestBuilder {
            stitched: self.stitched,
            fragments: &self.scope.fragments,
            variable_definitions: &self.scope.variable_definitions,
            variable_values: &self.scope.variables,
        }
    }

    fn record(&self, error: GraphQLError, path: &[PathSegment]) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error.with_path(path.to_vec()));
    }

    fn record_relative(&self, error: RelativeError, path: &[PathSegment]) {
        let mut absolute = path.to_vec();
        absolute.extend(error.path);
        self.record(error.error, &absolute);
    }

    /// Delegates the field selected by `nodes` on the root type
    /// `parent_type` to `subschema` and completes its value.
    ///
    /// `Ok(None)` means the field was non-null and its null bubbled past it.
    pub async fn delegate(
        &self,
        subschema: SubschemaId,
        parent_type: &str,
        nodes: &[&'a Field],
        overrides: Map<String, Value>,
    ) -> Result<Option<Value>, DelegationError> {
        let field = merged_field(nodes)?;
        let definition = self
            .stitched
            .gateway()
            .field(parent_type, &field.name)
            .ok_or_else(|| DelegationError::UnroutableField {
                type_name: parent_type.to_string(),
                field_name: field.name.clone(),
            })?;

        let request = self.builder().build(DelegationTarget {
            subschema,
            source_parent_type: parent_type,
            source_field_name: &field.name,
            target_field_name: &field.name,
            arguments: &field.arguments,
            overrides,
            selection_set: field.selection_set.clone(),
        })?;
        let root_field = request.root_field.clone();
        let result = execute_on(
            self.stitched.subschema(subschema),
            request,
            &self.scope.context,
        )
        .await;

        let path = vec![PathSegment::Key(response_key(&field).to_string())];
        self.merge(subschema, result, &root_field, &definition.ty, nodes, path)
            .await
    }

    /// Completes the value of `root_field` in a raw sub-request result as
    /// the client field selected by `nodes` at `path`.
    pub async fn merge(
        &self,
        subschema: SubschemaId,
        result: ExecutionResult,
        root_field: &str,
        ty: &TypeRef,
        nodes: &[&'a Field],
        path: Vec<PathSegment>,
    ) -> Result<Option<Value>, DelegationError> {
        let raw = result
            .data
            .as_ref()
            .and_then(|data| data.get(root_field))
            .cloned();
        let errors = result
            .errors
            .into_iter()
            .map(|error| RelativeError::rooted_at(error, root_field))
            .collect();

        match self
            .complete(ty, raw, errors, nodes.to_vec(), subschema, path)
            .await
        {
            Ok(value) => Ok(Some(value)),
            Err(MergeAbort::NullBubble) => Ok(None),
            Err(MergeAbort::Fatal(error)) => Err(error),
        }
    }

    fn complete<'s>(
        &'s self,
        ty: &'s TypeRef,
        raw: Option<Value>,
        errors: Vec<RelativeError>,
        nodes: Vec<&'a Field>,
        source: SubschemaId,
        path: Vec<PathSegment>,
    ) -> BoxFuture<'s, Completion> {
        async move {
            match ty {
                TypeRef::NonNull(inner) => {
                    match self.complete_nullable(inner, raw, errors, nodes, source, &path).await? {
                        Value::Null => {
                            self.record(
                                GraphQLError::new(format!(
                                    "Cannot return null for non-nullable field \"{}\".",
                                    describe(&path)
                                )),
                                &path,
                            );
                            Err(MergeAbort::NullBubble)
                        }
                        value => Ok(value),
                    }
                }
                _ => match self.complete_nullable(ty, raw, errors, nodes, source, &path).await {
                    Err(MergeAbort::NullBubble) => Ok(Value::Null),
                    other => other,
                },
            }
        }
        .boxed()
    }

    async fn complete_nullable(
        &self,
        ty: &TypeRef,
        raw: Option<Value>,
        errors: Vec<RelativeError>,
        nodes: Vec<&'a Field>,
        source: SubschemaId,
        path: &[PathSegment],
    ) -> Completion {
        let raw = match raw {
            None | Some(Value::Null) => return self.complete_null(errors, path),
            Some(raw) => raw,
        };

        match ty {
            TypeRef::NonNull(_) => {
                self.complete(ty, Some(raw), errors, nodes, source, path.to_vec())
                    .await
            }
            TypeRef::List(inner) => {
                self.complete_list(inner, raw, errors, nodes, source, path)
                    .await
            }
            TypeRef::Named(name) => {
                let stitched: &'a StitchedSchema = self.stitched;
                let typedef = stitched
                    .gateway()
                    .type_def(name)
                    .ok_or_else(|| DelegationError::UnknownType(name.clone()))?;
                if typedef.kind.is_leaf() {
                    self.complete_leaf(name, raw, errors, path)
                } else if typedef.kind.is_composite() {
                    self.complete_object(typedef, raw, errors, nodes, source, path)
                        .await
                } else {
                    Err(DelegationError::InvalidValue {
                        type_name: name.clone(),
                        message: "input object types cannot be selected".to_string(),
                    }
                    .into())
                }
            }
        }
    }

    fn complete_null(&self, errors: Vec<RelativeError>, path: &[PathSegment]) -> Completion {
        if errors.is_empty() {
            return Ok(Value::Null);
        }
        let combined = GraphQLError::combine(errors.into_iter().map(|error| error.error).collect());
        self.record(combined, path);
        Err(MergeAbort::NullBubble)
    }

    fn complete_leaf(
        &self,
        type_name: &str,
        raw: Value,
        errors: Vec<RelativeError>,
        path: &[PathSegment],
    ) -> Completion {
        for error in errors {
            self.record_relative(error, path);
        }
        match self.stitched.gateway().parse_leaf(type_name, &raw) {
            Ok(value) => Ok(value),
            Err(message) => {
                self.record(GraphQLError::new(message), path);
                Err(MergeAbort::NullBubble)
            }
        }
    }

    async fn complete_list(
        &self,
        inner: &TypeRef,
        raw: Value,
        errors: Vec<RelativeError>,
        nodes: Vec<&'a Field>,
        source: SubschemaId,
        path: &[PathSegment],
    ) -> Completion {
        let Value::Array(items) = raw else {
            self.record(
                GraphQLError::new(format!("Expected a list at \"{}\".", describe(path))),
                path,
            );
            return Err(MergeAbort::NullBubble);
        };

        let (here, mut by_index) = group_by_index(errors);
        for error in here {
            self.record_relative(error, path);
        }

        let len = items.len();
        let completions = join_all(items.into_iter().enumerate().map(|(index, item)| {
            let errors = by_index.remove(&index).unwrap_or_default();
            self.complete(inner, Some(item), errors, nodes.clone(), source, child_path(path, index))
        }))
        .await;

        // Errors pointing past the end of the list stay where they point.
        for (index, errors) in by_index {
            let item_path = child_path(path, index);
            for error in errors {
                self.record_relative(error, &item_path);
            }
        }

        let mut values = Vec::with_capacity(len);
        for completion in completions {
            values.push(completion?);
        }
        Ok(Value::Array(values))
    }

    async fn complete_object(
        &self,
        typedef: &'a TypeDef,
        raw: Value,
        errors: Vec<RelativeError>,
        nodes: Vec<&'a Field>,
        source: SubschemaId,
        path: &[PathSegment],
    ) -> Completion {
        let Value::Object(mut object) = raw else {
            self.record(
                GraphQLError::new(format!("Expected an object at \"{}\".", describe(path))),
                path,
            );
            return Err(MergeAbort::NullBubble);
        };

        let concrete = if typedef.kind.is_abstract() {
            match object.get(TYPENAME_FIELD).and_then(Value::as_str) {
                Some(name) => name.to_string(),
                None => return Err(DelegationError::MissingTypename(typedef.name.clone()).into()),
            }
        } else {
            typedef.name.clone()
        };

        let stitched: &'a StitchedSchema = self.stitched;
        let scope: &'a OperationScope = self.scope;
        let collector = FieldCollector {
            schema: stitched.gateway(),
            fragments: &scope.fragments,
            variables: &scope.variables,
        };
        let selection_sets: Vec<_> = nodes.iter().map(|&node| &node.selection_set).collect();
        let collected = collector.collect(&concrete, &selection_sets);

        let (here, mut by_key) = group_by_key(errors);
        for error in here {
            self.record_relative(error, path);
        }

        let mut origins: HashMap<String, SubschemaId> = HashMap::new();
        if let Some(info) = stitched
            .merged_type(&concrete)
            .filter(|info| info.declares(source))
        {
            self.merge_from_other_subschemas(
                info,
                source,
                &collected,
                &mut object,
                &mut by_key,
                &mut origins,
                path,
            )
            .await?;
        }

        let mut pending: Vec<BoxFuture<'_, Completion>> = Vec::with_capacity(collected.len());
        for (key, field_nodes) in &collected {
            let name = field_nodes[0].name.as_str();
            if name == TYPENAME_FIELD {
                pending.push(Box::pin(future::ready(Ok(Value::String(concrete.clone())))));
                continue;
            }
            let Some(definition) = stitched.gateway().field(&concrete, name) else {
                pending.push(Box::pin(future::ready(Ok(Value::Null))));
                continue;
            };
            let value = object.remove(key);
            let errors = by_key.remove(key).unwrap_or_default();
            let child_source = origins.get(key).copied().unwrap_or(source);
            pending.push(self.complete(
                &definition.ty,
                value,
                errors,
                field_nodes.clone(),
                child_source,
                child_path(path, key.as_str()),
            ));
        }
        let completions = join_all(pending).await;

        // Errors on keys the client never selected, such as injected keys.
        for (key, errors) in by_key {
            let key_path = child_path(path, key.as_str());
            for error in errors {
                self.record_relative(error, &key_path);
            }
        }

        let mut completed = Map::new();
        for (key, completion) in collected.keys().zip(completions) {
            completed.insert(key.clone(), completion?);
        }
        Ok(Value::Object(completed))
    }

    /// Fetches the selected fields of a merged object that `source` could
    /// not provide, stage by stage, into `object`.
    #[allow(clippy::too_many_arguments)]
    async fn merge_from_other_subschemas(
        &self,
        info: &'a MergedTypeInfo,
        source: SubschemaId,
        collected: &IndexMap<String, Vec<&'a Field>>,
        object: &mut Map<String, Value>,
        by_key: &mut ErrorsByKey,
        origins: &mut HashMap<String, SubschemaId>,
        path: &[PathSegment],
    ) -> Result<(), MergeAbort> {
        let requested: Vec<Field> = collected
            .iter()
            .filter(|(key, _)| !object.contains_key(key.as_str()))
            .map(|(_, field_nodes)| merged_field(field_nodes))
            .collect::<Result<_, _>>()?;
        let requested_refs: Vec<&Field> = requested.iter().collect();
        let missing: Vec<Field> = info
            .fields_not_locally_resolvable(source, &requested_refs)
            .into_iter()
            .filter(|field| !object.contains_key(response_key(field)))
            .collect();
        if missing.is_empty() || info.targets_of(&[source]).is_empty() {
            return Ok(());
        }

        let plan = DelegationPlanner::new(info).plan(&[source], missing);
        debug!(
            type_name = %info.type_name,
            path = %describe(path),
            stages = plan.stages.len(),
            unproxiable = plan.unproxiable_fields.len(),
            "Merging object from other subschemas"
        );

        for stage in &plan.stages {
            let partial: &Map<String, Value> = object;
            let fetches = join_all(
                stage
                    .assignments
                    .keys()
                    .map(|target| self.fetch_merged(info, *target, stage, partial)),
            )
            .await;

            for fetch in fetches {
                let fetch = fetch?;
                let first_key = stage
                    .assignments
                    .get(&fetch.target)
                    .and_then(|fields| fields.first())
                    .map(|field| response_key(field).to_string());

                if let Some(Value::Object(fetched)) = fetch.value {
                    for (key, value) in fetched {
                        if !object.contains_key(&key) {
                            origins.insert(key.clone(), fetch.target);
                            object.insert(key, value);
                        }
                    }
                }

                for mut error in fetch.errors {
                    let key = match error.path.first() {
                        Some(PathSegment::Key(key)) => {
                            let key = key.clone();
                            error.path.remove(0);
                            Some(key)
                        }
                        _ => first_key.clone(),
                    };
                    match key {
                        Some(key) => by_key.entry(key).or_default().push(error),
                        None => self.record_relative(error, path),
                    }
                }
            }
        }

        for field in &plan.unproxiable_fields {
            let key = response_key(field);
            if collected.contains_key(key) {
                by_key.entry(key.to_string()).or_default().push(RelativeError {
                    error: GraphQLError::new(format!(
                        "Cannot resolve field \"{}\" on type \"{}\": \
                         no reachable subschema provides it.",
                        field.name, info.type_name
                    )),
                    path: Vec::new(),
                });
            }
        }
        Ok(())
    }

    async fn fetch_merged(
        &self,
        info: &'a MergedTypeInfo,
        target: SubschemaId,
        stage: &DelegationStage,
        partial: &Map<String, Value>,
    ) -> Result<MergeFetch, MergeAbort> {
        let subschema = self.stitched.subschema(target);
        let resolver = info.resolvers.get(&target).ok_or_else(|| {
            DelegationError::Config(format!(
                "subschema \"{}\" has no merge resolver for \"{}\"",
                subschema.name, info.type_name
            ))
        })?;

        let key = info.key_for(target, partial);
        let selection_set = stage.selection_set(target);
        let request = resolver.resolve(partial, &self.scope.context, &key, &selection_set)?;
        let root_type = self
            .stitched
            .gateway()
            .root_type_name(request.operation)
            .unwrap_or("Query");
        let sub_request = self.builder().build(DelegationTarget {
            subschema: target,
            source_parent_type: root_type,
            source_field_name: &request.field_name,
            target_field_name: &request.field_name,
            arguments: &[],
            overrides: request.args,
            selection_set: request.selection_set,
        })?;

        let root_field = sub_request.root_field.clone();
        let result = execute_on(subschema, sub_request, &self.scope.context).await;
        if !result.errors.is_empty() {
            warn!(
                subschema = %subschema.name,
                type_name = %info.type_name,
                errors = result.errors.len(),
                "Merge delegation returned errors"
            );
        }

        Ok(MergeFetch {
            target,
            value: result
                .data
                .as_ref()
                .and_then(|data| data.get(&root_field))
                .cloned(),
            errors: result
                .errors
                .into_iter()
                .map(|error| RelativeError::rooted_at(error, &root_field))
                .collect(),
        })
    }
}
