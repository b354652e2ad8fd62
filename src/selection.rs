//! Helpers over `graphql-parser` executable documents: owned type aliases,
//! value conversion, field collection and reference tracking.

use graphql_parser::{
    Pos,
    query::{self, Definition, Directive, OperationDefinition, Selection, TypeCondition},
};
use indexmap::{IndexMap, IndexSet};
use serde_json::{Map, Number, Value};
use std::collections::HashMap;

use crate::{DelegationError, SchemaGraph, TYPENAME_FIELD};

pub type Document = query::Document<'static, String>;
pub type SelectionSet = query::SelectionSet<'static, String>;
pub type Field = query::Field<'static, String>;
pub type FragmentDefinition = query::FragmentDefinition<'static, String>;
pub type VariableDefinition = query::VariableDefinition<'static, String>;
pub type AstValue = query::Value<'static, String>;
pub type Fragments = HashMap<String, FragmentDefinition>;

/// Parses a key selection set such as `{ id }` or `id owner { id }`.
pub fn parse_selection_set(source: &str) -> Result<SelectionSet, DelegationError> {
    let trimmed = source.trim();
    let text = if trimmed.starts_with('{') {
        trimmed.to_string()
    } else {
        format!("{{ {} }}", trimmed)
    };
    let parse_error = |message: String| DelegationError::SelectionSetParse {
        selection_set: source.to_string(),
        message,
    };

    let document = query::parse_query::<String>(&text)
        .map_err(|e| parse_error(e.to_string()))?
        .into_static();
    match document.definitions.into_iter().next() {
        Some(Definition::Operation(OperationDefinition::SelectionSet(set))) => Ok(set),
        _ => Err(parse_error("expected a bare selection set".to_string())),
    }
}

pub fn selection_set(items: Vec<Selection<'static, String>>) -> SelectionSet {
    query::SelectionSet {
        span: (Pos::default(), Pos::default()),
        items,
    }
}

pub fn empty_selection_set() -> SelectionSet {
    selection_set(Vec::new())
}

pub fn plain_field(name: &str) -> Field {
    query::Field {
        position: Pos::default(),
        alias: None,
        name: name.to_string(),
        arguments: Vec::new(),
        directives: Vec::new(),
        selection_set: empty_selection_set(),
    }
}

pub fn response_key<'f>(field: &'f query::Field<'_, String>) -> &'f str {
    field.alias.as_deref().unwrap_or(&field.name)
}

/// Converts a literal or variable-bearing value to JSON. `None` means the
/// value is absent (an unbound variable).
pub fn value_to_json(
    value: &query::Value<'_, String>,
    variables: Option<&Map<String, Value>>,
) -> Option<Value> {
    match value {
        query::Value::Variable(name) => variables.and_then(|vars| vars.get(name).cloned()),
        query::Value::Int(number) => number.as_i64().map(Value::from),
        query::Value::Float(float) => {
            Some(Number::from_f64(*float).map_or(Value::Null, Value::Number))
        }
        query::Value::String(string) => Some(Value::String(string.clone())),
        query::Value::Boolean(boolean) => Some(Value::Bool(*boolean)),
        query::Value::Null => Some(Value::Null),
        query::Value::Enum(name) => Some(Value::String(name.clone())),
        query::Value::List(items) => Some(Value::Array(
            items
                .iter()
                .map(|item| value_to_json(item, variables).unwrap_or(Value::Null))
                .collect(),
        )),
        query::Value::Object(fields) => Some(Value::Object(
            fields
                .iter()
                .filter_map(|(key, field)| Some((key.clone(), value_to_json(field, variables)?)))
                .collect(),
        )),
    }
}

pub fn const_value_to_json(value: &query::Value<'_, String>) -> Value {
    value_to_json(value, None).unwrap_or(Value::Null)
}

/// Evaluates `@skip` and `@include`.
pub fn is_included(directives: &[Directive<'_, String>], variables: &Map<String, Value>) -> bool {
    let condition = |directive: &Directive<'_, String>| {
        directive
            .arguments
            .iter()
            .find(|(name, _)| name == "if")
            .and_then(|(_, value)| value_to_json(value, Some(variables)))
            .and_then(|value| value.as_bool())
    };
    directives.iter().all(|directive| match directive.name.as_str() {
        "skip" => condition(directive) != Some(true),
        "include" => condition(directive) != Some(false),
        _ => true,
    })
}

/// Groups the fields selected on an object of a concrete type by response
/// key, walking fragment spreads and inline fragments.
pub struct FieldCollector<'a> {
    pub schema: &'a SchemaGraph,
    pub fragments: &'a Fragments,
    pub variables: &'a Map<String, Value>,
}

impl<'a> FieldCollector<'a> {
    pub fn collect(
        &self,
        type_name: &str,
        selection_sets: &[&'a SelectionSet],
    ) -> IndexMap<String, Vec<&'a Field>> {
        let mut fields = IndexMap::new();
        let mut visited = IndexSet::new();
        for set in selection_sets {
            self.collect_into(type_name, set, &mut fields, &mut visited);
        }
        fields
    }

    fn collect_into(
        &self,
        type_name: &str,
        set: &'a SelectionSet,
        fields: &mut IndexMap<String, Vec<&'a Field>>,
        visited: &mut IndexSet<&'a str>,
    ) {
        for selection in &set.items {
            match selection {
                Selection::Field(field) => {
                    if is_included(&field.directives, self.variables) {
                        fields
                            .entry(response_key(field).to_string())
                            .or_default()
                            .push(field);
                    }
                }
                Selection::InlineFragment(inline) => {
                    let applies = match &inline.type_condition {
                        Some(TypeCondition::On(condition)) => {
                            self.schema.is_possible_type(condition, type_name)
                        }
                        None => true,
                    };
                    if applies && is_included(&inline.directives, self.variables) {
                        self.collect_into(type_name, &inline.selection_set, fields, visited);
                    }
                }
                Selection::FragmentSpread(spread) => {
                    if !is_included(&spread.directives, self.variables)
                        || !visited.insert(spread.fragment_name.as_str())
                    {
                        continue;
                    }
                    let Some(fragment) = self.fragments.get(&spread.fragment_name) else {
                        continue;
                    };
                    let TypeCondition::On(condition) = &fragment.type_condition;
                    if self.schema.is_possible_type(condition, type_name) {
                        self.collect_into(type_name, &fragment.selection_set, fields, visited);
                    }
                }
            }
        }
    }
}

/// Variables and fragments a selection set depends on, transitively through
/// the fragments it spreads. Both sets keep first-seen order.
#[derive(Debug, Default)]
pub struct References {
    pub variables: IndexSet<String>,
    pub fragments: IndexSet<String>,
}

impl References {
    pub fn of(set: &SelectionSet, fragments: &Fragments) -> Result<Self, DelegationError> {
        let mut references = References::default();
        references.walk_set(set, fragments)?;
        Ok(references)
    }

    fn walk_set(
        &mut self,
        set: &SelectionSet,
        fragments: &Fragments,
    ) -> Result<(), DelegationError> {
        for selection in &set.items {
            match selection {
                Selection::Field(field) => {
                    for (_, value) in &field.arguments {
                        self.walk_value(value);
                    }
                    self.walk_directives(&field.directives);
                    self.walk_set(&field.selection_set, fragments)?;
                }
                Selection::InlineFragment(inline) => {
                    self.walk_directives(&inline.directives);
                    self.walk_set(&inline.selection_set, fragments)?;
                }
                Selection::FragmentSpread(spread) => {
                    self.walk_directives(&spread.directives);
                    if self.fragments.insert(spread.fragment_name.clone()) {
                        let fragment = fragments.get(&spread.fragment_name).ok_or_else(|| {
                            DelegationError::UndefinedFragment(spread.fragment_name.clone())
                        })?;
                        self.walk_directives(&fragment.directives);
                        self.walk_set(&fragment.selection_set, fragments)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn walk_directives(&mut self, directives: &[Directive<'static, String>]) {
        for directive in directives {
            for (_, value) in &directive.arguments {
                self.walk_value(value);
            }
        }
    }

    fn walk_value(&mut self, value: &AstValue) {
        match value {
            query::Value::Variable(name) => {
                self.variables.insert(name.clone());
            }
            query::Value::List(items) => items.iter().for_each(|item| self.walk_value(item)),
            query::Value::Object(fields) => {
                fields.values().for_each(|field| self.walk_value(field))
            }
            _ => {}
        }
    }
}

/// Top-level fields of a selection set, ignoring fragments.
pub fn top_level_fields(set: &SelectionSet) -> impl Iterator<Item = &Field> {
    set.items.iter().filter_map(|selection| match selection {
        Selection::Field(field) => Some(field),
        _ => None,
    })
}

pub fn has_typename(set: &SelectionSet) -> bool {
    top_level_fields(set).any(|field| field.name == TYPENAME_FIELD && field.alias.is_none())
}
