use graphql_parser::{
    Pos,
    query::{self, Definition, OperationDefinition, Selection, TypeCondition},
};
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::warn;

use crate::{
    DelegationError, OperationKind, SchemaGraph, StitchedSchema, SubRequest, SubschemaId,
    TYPENAME_FIELD, TypeRef,
    schema_graph::FieldDef,
    selection::{
        AstValue, Document, Fragments, References, SelectionSet, VariableDefinition, has_typename,
        plain_field, response_key, selection_set, top_level_fields, value_to_json,
    },
};

/// One field to delegate: which gateway field it stands for and which root
/// field of the target subschema receives it.
pub struct DelegationTarget<'a> {
    pub subschema: SubschemaId,
    /// Gateway type the delegated field is declared on. When it is a root
    /// type its operation kind is the kind of the sub-request.
    pub source_parent_type: &'a str,
    pub source_field_name: &'a str,
    pub target_field_name: &'a str,
    /// Argument nodes as the caller wrote them.
    pub arguments: &'a [(String, AstValue)],
    /// Arguments given as values, already in the target's terms.
    pub overrides: Map<String, Value>,
    pub selection_set: SelectionSet,
}

/// Builds standalone sub-requests out of pieces of a client operation.
pub struct SubRequestBuilder<'a> {
    pub stitched: &'a StitchedSchema,
    pub fragments: &'a Fragments,
    pub variable_definitions: &'a [VariableDefinition],
    pub variable_values: &'a Map<String, Value>,
}

/// Mints `_v<counter>_<arg>` names unique within one document.
struct VariableNames {
    counter: usize,
    taken: HashSet<String>,
}

impl VariableNames {
    fn next(&mut self, arg_name: &str) -> String {
        loop {
            let name = format!("_v{}_{}", self.counter, arg_name);
            self.counter += 1;
            if self.taken.insert(name.clone()) {
                return name;
            }
        }
    }
}

/// Arguments and variables accumulated for the root field.
struct Bindings {
    names: VariableNames,
    arguments: Vec<(String, AstValue)>,
    definitions: Vec<VariableDefinition>,
    values: Map<String, Value>,
}

impl Bindings {
    fn bind(
        &mut self,
        arg_name: &str,
        target_type: &TypeRef,
        serializer: &SchemaGraph,
        serialization_type: &TypeRef,
        value: &Value,
    ) -> Result<(), DelegationError> {
        let name = self.names.next(arg_name);
        let serialized = serializer.serialize_input(serialization_type, value)?;
        self.definitions.push(query::VariableDefinition {
            position: Pos::default(),
            name: name.clone(),
            var_type: target_type.to_ast(),
            default_value: None,
        });
        self.arguments
            .push((arg_name.to_string(), query::Value::Variable(name.clone())));
        self.values.insert(name, serialized);
        Ok(())
    }

    fn is_bound(&self, arg_name: &str) -> bool {
        self.arguments.iter().any(|(name, _)| name == arg_name)
    }
}

impl<'a> SubRequestBuilder<'a> {
    pub fn build(&self, target: DelegationTarget<'_>) -> Result<SubRequest, DelegationError> {
        let subschema = self.stitched.subschema(target.subschema);
        let gateway = self.stitched.gateway();
        let operation = gateway
            .operation_kind_of(target.source_parent_type)
            .unwrap_or(OperationKind::Query);

        let root = subschema
            .schema
            .root_type(operation)
            .ok_or_else(|| DelegationError::MissingRootType {
                subschema: subschema.name.clone(),
                operation: operation.to_string(),
            })?;
        let target_field = root
            .field(target.target_field_name)
            .ok_or_else(|| DelegationError::MissingField {
                subschema: subschema.name.clone(),
                type_name: root.name.clone(),
                field_name: target.target_field_name.to_string(),
            })?;
        let source_field = gateway.field(target.source_parent_type, target.source_field_name);

        let selection = self.annotate(
            target.subschema,
            &subschema.schema,
            target_field.ty.named_type(),
            &target.selection_set,
        );
        let mut fragments: Fragments = self
            .fragments
            .iter()
            .map(|(name, fragment)| {
                let mut fragment = fragment.clone();
                let TypeCondition::On(condition) = &fragment.type_condition;
                fragment.selection_set = self.annotate(
                    target.subschema,
                    &subschema.schema,
                    condition,
                    &fragment.selection_set,
                );
                (name.clone(), fragment)
            })
            .collect();
        // Only variables the filtered document still uses get declared.
        let references = References::of(&selection, &fragments)?;

        let mut bindings = Bindings {
            names: VariableNames {
                counter: 0,
                taken: references.variables.iter().cloned().collect(),
            },
            arguments: Vec::new(),
            definitions: Vec::new(),
            values: Map::new(),
        };

        for name in &references.variables {
            let definition = self
                .variable_definitions
                .iter()
                .find(|definition| &definition.name == name)
                .ok_or_else(|| DelegationError::UndefinedVariable(name.clone()))?;
            if let Some(value) = self.variable_values.get(name) {
                let ty = TypeRef::from_ast(&definition.var_type);
                bindings
                    .values
                    .insert(name.clone(), gateway.serialize_input(&ty, value)?);
            }
            bindings.definitions.push(definition.clone());
        }

        self.bind_arguments(&target, target_field, source_field, &subschema.schema, &mut bindings)?;

        let root_field = query::Field {
            position: Pos::default(),
            alias: None,
            name: target.target_field_name.to_string(),
            arguments: bindings.arguments,
            directives: Vec::new(),
            selection_set: selection,
        };
        let operation_set = selection_set(vec![Selection::Field(root_field)]);
        let definitions = bindings.definitions;
        let operation_definition = match operation {
            OperationKind::Query => OperationDefinition::Query(query::Query {
                position: Pos::default(),
                name: None,
                variable_definitions: definitions,
                directives: Vec::new(),
                selection_set: operation_set,
            }),
            OperationKind::Mutation => OperationDefinition::Mutation(query::Mutation {
                position: Pos::default(),
                name: None,
                variable_definitions: definitions,
                directives: Vec::new(),
                selection_set: operation_set,
            }),
            OperationKind::Subscription => OperationDefinition::Subscription(query::Subscription {
                position: Pos::default(),
                name: None,
                variable_definitions: definitions,
                directives: Vec::new(),
                selection_set: operation_set,
            }),
        };

        let mut document: Document = query::Document {
            definitions: vec![Definition::Operation(operation_definition)],
        };
        for name in &references.fragments {
            let fragment = fragments
                .remove(name)
                .ok_or_else(|| DelegationError::UndefinedFragment(name.clone()))?;
            document.definitions.push(Definition::Fragment(fragment));
        }

        Ok(SubRequest {
            document,
            variables: bindings.values,
            operation,
            root_field: target.target_field_name.to_string(),
        })
    }

    /// Rebinds every argument of the root field to a fresh variable, then
    /// backfills the target's defaults for arguments nobody supplied.
    fn bind_arguments(
        &self,
        target: &DelegationTarget<'_>,
        target_field: &FieldDef,
        source_field: Option<&FieldDef>,
        target_schema: &SchemaGraph,
        bindings: &mut Bindings,
    ) -> Result<(), DelegationError> {
        let gateway = self.stitched.gateway();
        let source_type = |arg_name: &str| {
            source_field
                .and_then(|field| field.argument(arg_name))
                .map(|arg| &arg.ty)
        };

        for (arg_name, value) in target.arguments {
            if target.overrides.contains_key(arg_name) {
                continue;
            }
            let Some(target_arg) = target_field.argument(arg_name) else {
                warn!(
                    field = %target_field.name,
                    argument = %arg_name,
                    "Dropping argument unknown to the target field"
                );
                continue;
            };
            let Some(value) = value_to_json(value, Some(self.variable_values)) else {
                continue;
            };
            match source_type(arg_name) {
                Some(ty) => bindings.bind(arg_name, &target_arg.ty, gateway, ty, &value)?,
                None => bindings.bind(
                    arg_name,
                    &target_arg.ty,
                    target_schema,
                    &target_arg.ty,
                    &value,
                )?,
            }
        }

        for (arg_name, value) in &target.overrides {
            let Some(target_arg) = target_field.argument(arg_name) else {
                warn!(
                    field = %target_field.name,
                    argument = %arg_name,
                    "Dropping argument unknown to the target field"
                );
                continue;
            };
            bindings.bind(
                arg_name,
                &target_arg.ty,
                target_schema,
                &target_arg.ty,
                value,
            )?;
        }

        for target_arg in &target_field.arguments {
            let Some(default) = &target_arg.default_value else {
                continue;
            };
            if bindings.is_bound(&target_arg.name) {
                continue;
            }
            match source_type(&target_arg.name) {
                Some(ty) => bindings.bind(&target_arg.name, &target_arg.ty, gateway, ty, default)?,
                None => bindings.bind(
                    &target_arg.name,
                    &target_arg.ty,
                    target_schema,
                    &target_arg.ty,
                    default,
                )?,
            }
        }
        Ok(())
    }

    /// Restricts `set` to what `target` exposes and adds what the response
    /// merger will need: `__typename` on abstract and merged types, and the
    /// key fields other subschemas require to fetch more of a merged object.
    fn annotate(
        &self,
        target: SubschemaId,
        schema: &SchemaGraph,
        type_name: &str,
        set: &SelectionSet,
    ) -> SelectionSet {
        let Some(typedef) = schema.type_def(type_name) else {
            return set.clone();
        };
        if !typedef.kind.is_composite() {
            return set.clone();
        }

        let mut items: Vec<Selection<'static, String>> = set
            .items
            .iter()
            .filter_map(|selection| match selection {
                Selection::Field(field) => {
                    if !schema.has_field(type_name, &field.name) {
                        return None;
                    }
                    let mut field = field.clone();
                    if let Some(def) = schema.field(type_name, &field.name) {
                        if !field.selection_set.items.is_empty() {
                            field.selection_set = self.annotate(
                                target,
                                schema,
                                def.ty.named_type(),
                                &field.selection_set,
                            );
                        }
                    }
                    Some(Selection::Field(field))
                }
                Selection::InlineFragment(inline) => {
                    let condition = match &inline.type_condition {
                        Some(TypeCondition::On(condition)) => condition.clone(),
                        None => type_name.to_string(),
                    };
                    schema.type_def(&condition)?;
                    let mut inline = inline.clone();
                    inline.selection_set =
                        self.annotate(target, schema, &condition, &inline.selection_set);
                    Some(Selection::InlineFragment(inline))
                }
                Selection::FragmentSpread(spread) => {
                    let foreign = self.fragments.get(&spread.fragment_name).is_some_and(|fragment| {
                        let TypeCondition::On(condition) = &fragment.type_condition;
                        schema.type_def(condition).is_none()
                    });
                    (!foreign).then(|| selection.clone())
                }
            })
            .collect();

        let requested: Vec<&str> = top_level_fields(set).map(|field| field.name.as_str()).collect();
        let merged = self
            .stitched
            .merged_type(type_name)
            .filter(|info| info.declares(target));

        if (typedef.kind.is_abstract() || merged.is_some()) && !has_typename(set) {
            items.push(Selection::Field(plain_field(TYPENAME_FIELD)));
        }

        if let Some(info) = merged {
            for field in info.required_selections(target, &requested) {
                let present = top_level_fields(set).any(|known| response_key(known) == field.name);
                if !present {
                    items.push(Selection::Field(field));
                }
            }
        } else if typedef.kind.is_abstract() {
            for possible in schema.possible_types(type_name) {
                let Some(info) = self
                    .stitched
                    .merged_type(possible)
                    .filter(|info| info.declares(target))
                else {
                    continue;
                };
                let required = info.required_selections(target, &requested);
                if required.is_empty() {
                    continue;
                }
                items.push(Selection::InlineFragment(query::InlineFragment {
                    position: Pos::default(),
                    type_condition: Some(TypeCondition::On(possible.to_string())),
                    directives: Vec::new(),
                    selection_set: selection_set(
                        required.into_iter().map(Selection::Field).collect(),
                    ),
                }));
            }
        }

        if items.is_empty() {
            items.push(Selection::Field(plain_field(TYPENAME_FIELD)));
        }
        selection_set(items)
    }
}
