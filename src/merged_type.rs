//! Ownership registry of one merged type: which subschema resolves which
//! field, and what each subschema needs to know about an object first.

use graphql_parser::query::{Selection, TypeCondition};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use crate::{
    DelegationError, MergeResolver, SchemaGraph, Subschema, SubschemaId, TYPENAME_FIELD,
    selection::{Field, SelectionSet, parse_selection_set, response_key, top_level_fields},
};

/// Who can resolve a field of a merged type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOwners<'a> {
    Unique(SubschemaId),
    Shared(&'a [SubschemaId]),
    Unowned,
}

#[derive(Clone)]
pub struct MergedTypeInfo {
    pub type_name: String,
    /// Every subschema declaring the type, in declaration order.
    pub subschemas: Vec<SubschemaId>,
    pub target_subschemas: BTreeMap<SubschemaId, Vec<SubschemaId>>,
    pub selection_sets: BTreeMap<SubschemaId, SelectionSet>,
    pub field_selection_sets: BTreeMap<SubschemaId, HashMap<String, SelectionSet>>,
    pub unique_fields: HashMap<String, SubschemaId>,
    pub non_unique_fields: HashMap<String, Vec<SubschemaId>>,
    pub resolvers: BTreeMap<SubschemaId, Arc<dyn MergeResolver>>,
    pub key_fields: BTreeMap<SubschemaId, String>,
    schemas: BTreeMap<SubschemaId, Arc<SchemaGraph>>,
}

impl MergedTypeInfo {
    /// Returns `None` when the type is not merged: it lives in a single
    /// subschema, or no subschema knows how to fetch it by key.
    pub fn build(
        type_name: &str,
        subschemas: &[Subschema],
    ) -> Result<Option<Self>, DelegationError> {
        let declaring: Vec<SubschemaId> = subschemas
            .iter()
            .enumerate()
            .filter(|(_, subschema)| {
                subschema
                    .schema
                    .type_def(type_name)
                    .is_some_and(|typedef| {
                        typedef.kind.is_composite() && !typedef.kind.is_abstract()
                    })
            })
            .map(|(index, _)| SubschemaId(index))
            .collect();

        let mut resolvers = BTreeMap::new();
        let mut key_fields = BTreeMap::new();
        let mut selection_sets = BTreeMap::new();
        let mut field_selection_sets = BTreeMap::new();

        for id in &declaring {
            let Some(config) = subschemas[id.0].merge.get(type_name) else {
                continue;
            };
            if let Some(resolver) = config.resolver() {
                resolvers.insert(*id, resolver);
            }
            if let Some(key_field) = &config.key_field {
                key_fields.insert(*id, key_field.clone());
            }
            // A bare key field doubles as the type-level key selection.
            let selection_set = match (&config.selection_set, &config.key_field) {
                (Some(selection_set), _) => Some(parse_selection_set(selection_set)?),
                (None, Some(key_field)) => Some(parse_selection_set(key_field)?),
                (None, None) => None,
            };
            if let Some(selection_set) = selection_set {
                selection_sets.insert(*id, selection_set);
            }
            if !config.fields.is_empty() {
                let parsed = config
                    .fields
                    .iter()
                    .map(|(field, set)| Ok((field.clone(), parse_selection_set(set)?)))
                    .collect::<Result<HashMap<_, _>, DelegationError>>()?;
                field_selection_sets.insert(*id, parsed);
            }
        }

        if declaring.len() < 2 || resolvers.is_empty() {
            return Ok(None);
        }

        let target_subschemas = declaring
            .iter()
            .map(|source| {
                let targets = declaring
                    .iter()
                    .filter(|target| *target != source && resolvers.contains_key(*target))
                    .copied()
                    .collect();
                (*source, targets)
            })
            .collect();

        let mut owners: IndexMap<String, Vec<SubschemaId>> = IndexMap::new();
        for id in &declaring {
            if let Some(typedef) = subschemas[id.0].schema.type_def(type_name) {
                for field in &typedef.fields {
                    owners.entry(field.name.clone()).or_default().push(*id);
                }
            }
        }
        let mut unique_fields = HashMap::new();
        let mut non_unique_fields = HashMap::new();
        for (field, field_owners) in owners {
            if let [only] = field_owners.as_slice() {
                unique_fields.insert(field, *only);
            } else {
                non_unique_fields.insert(field, field_owners);
            }
        }

        let schemas = declaring
            .iter()
            .map(|id| (*id, subschemas[id.0].schema.clone()))
            .collect();

        Ok(Some(MergedTypeInfo {
            type_name: type_name.to_string(),
            subschemas: declaring,
            target_subschemas,
            selection_sets,
            field_selection_sets,
            unique_fields,
            non_unique_fields,
            resolvers,
            key_fields,
            schemas,
        }))
    }

    pub fn owners(&self, field_name: &str) -> FieldOwners<'_> {
        if let Some(owner) = self.unique_fields.get(field_name) {
            return FieldOwners::Unique(*owner);
        }
        match self.non_unique_fields.get(field_name) {
            Some(owners) => FieldOwners::Shared(owners),
            None => FieldOwners::Unowned,
        }
    }

    pub fn declares(&self, subschema: SubschemaId) -> bool {
        self.schemas.contains_key(&subschema)
    }

    /// Subschemas that can fetch more of an object once any of `sources`
    /// has produced part of it, excluding the sources themselves.
    pub fn targets_of(&self, sources: &[SubschemaId]) -> Vec<SubschemaId> {
        let mut targets = Vec::new();
        for source in sources {
            for target in self.target_subschemas.get(source).into_iter().flatten() {
                if !sources.contains(target) && !targets.contains(target) {
                    targets.push(*target);
                }
            }
        }
        targets.sort();
        targets
    }

    /// Fields other subschemas need before they can resolve `field_name`.
    fn field_dependencies<'s>(&'s self, field_name: &'s str) -> impl Iterator<Item = &'s Field> {
        self.field_selection_sets
            .values()
            .filter_map(move |sets| sets.get(field_name))
            .flat_map(top_level_fields)
    }

    /// The requested fields `owner` cannot resolve on its own, plus those
    /// field-level key dependencies of requested fields `owner` does not
    /// expose.
    pub fn fields_not_locally_resolvable(
        &self,
        owner: SubschemaId,
        requested: &[&Field],
    ) -> Vec<Field> {
        let Some(schema) = self.schemas.get(&owner) else {
            return requested.iter().map(|field| (*field).clone()).collect();
        };
        let mut missing: Vec<Field> = Vec::new();
        let push = |field: &Field, missing: &mut Vec<Field>| {
            if !missing.iter().any(|known| response_key(known) == response_key(field)) {
                missing.push(field.clone());
            }
        };

        for field in requested {
            if !schema.has_field(&self.type_name, &field.name) {
                push(*field, &mut missing);
            }
            for dependency in self.field_dependencies(&field.name) {
                if !schema.has_field(&self.type_name, &dependency.name) {
                    push(dependency, &mut missing);
                }
            }
        }
        missing
    }

    /// Structural check: does the union of the candidates' definitions of
    /// this type expose everything `selection_set` mentions?
    pub fn selection_containment(
        &self,
        candidates: &[SubschemaId],
        selection_set: &SelectionSet,
    ) -> bool {
        let types: Vec<(&SchemaGraph, &str)> = candidates
            .iter()
            .filter_map(|id| self.schemas.get(id))
            .map(|schema| (schema.as_ref(), self.type_name.as_str()))
            .collect();
        types_contain_selection_set(&types, selection_set)
    }

    /// Key selections other subschemas need, restricted to what `target`
    /// exposes, so that objects fetched from `target` carry them.
    pub fn required_selections(&self, target: SubschemaId, requested: &[&str]) -> Vec<Field> {
        let Some(schema) = self.schemas.get(&target) else {
            return Vec::new();
        };
        let type_level = self
            .selection_sets
            .iter()
            .filter(|(id, _)| **id != target)
            .flat_map(|(_, set)| top_level_fields(set));
        let field_level = self
            .field_selection_sets
            .iter()
            .filter(|(id, _)| **id != target)
            .flat_map(|(_, sets)| {
                requested
                    .iter()
                    .filter_map(|name| sets.get(*name))
                    .flat_map(top_level_fields)
            });

        let mut required: Vec<Field> = Vec::new();
        for field in type_level.chain(field_level) {
            if schema.has_field(&self.type_name, &field.name)
                && !required.iter().any(|known| response_key(known) == response_key(field))
            {
                required.push(field.clone());
            }
        }
        required
    }

    /// The key value handed to `target`'s merge resolver.
    pub fn key_for(&self, target: SubschemaId, partial: &Map<String, Value>) -> Value {
        if let Some(key_field) = self.key_fields.get(&target) {
            return partial.get(key_field).cloned().unwrap_or(Value::Null);
        }
        match self.selection_sets.get(&target) {
            Some(set) => project(&Value::Object(partial.clone()), set),
            None => Value::Object(partial.clone()),
        }
    }
}

fn types_contain_selection_set(
    types: &[(&SchemaGraph, &str)],
    selection_set: &SelectionSet,
) -> bool {
    selection_set.items.iter().all(|selection| match selection {
        Selection::Field(field) => {
            if field.name == TYPENAME_FIELD {
                return true;
            }
            let nested: Vec<(&SchemaGraph, &str)> = types
                .iter()
                .filter_map(|(schema, type_name)| {
                    schema
                        .field(type_name, &field.name)
                        .map(|def| (*schema, def.ty.named_type()))
                })
                .collect();
            !nested.is_empty()
                && (field.selection_set.items.is_empty()
                    || types_contain_selection_set(&nested, &field.selection_set))
        }
        Selection::InlineFragment(inline) => match &inline.type_condition {
            Some(TypeCondition::On(condition))
                if types.first().map(|(_, name)| *name) != Some(condition.as_str()) =>
            {
                true
            }
            _ => types_contain_selection_set(types, &inline.selection_set),
        },
        Selection::FragmentSpread(_) => true,
    })
}

/// Keeps only the parts of `value` named by `set`.
fn project(value: &Value, set: &SelectionSet) -> Value {
    match value {
        Value::Object(object) => {
            let mut projected = Map::new();
            for field in top_level_fields(set) {
                let key = response_key(field);
                if let Some(inner) = object.get(key) {
                    let inner = if field.selection_set.items.is_empty() {
                        inner.clone()
                    } else {
                        project(inner, &field.selection_set)
                    };
                    projected.insert(key.to_string(), inner);
                }
            }
            Value::Object(projected)
        }
        Value::Array(items) => Value::Array(items.iter().map(|item| project(item, set)).collect()),
        other => other.clone(),
    }
}
