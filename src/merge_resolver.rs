use serde_json::{Map, Value};

use crate::{DelegationError, OperationKind, RequestContext, selection::SelectionSet};

/// What a merge resolver wants sent to its subschema: one root field called
/// with explicit arguments, selecting `selection_set` on the returned object.
#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub operation: OperationKind,
    pub field_name: String,
    pub args: Map<String, Value>,
    pub selection_set: SelectionSet,
}

/// Turns an already fetched partial object into a delegation that fetches
/// more fields of the same object from another subschema.
pub trait MergeResolver: Send + Sync {
    fn resolve(
        &self,
        partial: &Map<String, Value>,
        context: &RequestContext,
        key: &Value,
        selection: &SelectionSet,
    ) -> Result<MergeRequest, DelegationError>;
}

/// Calls `field_name(<key_arg>: <key>)` on the query root.
#[derive(Debug, Clone)]
pub struct KeyArgResolver {
    pub field_name: String,
    pub key_arg: String,
}

impl KeyArgResolver {
    pub fn new(field_name: impl Into<String>, key_arg: impl Into<String>) -> Self {
        KeyArgResolver {
            field_name: field_name.into(),
            key_arg: key_arg.into(),
        }
    }
}

impl MergeResolver for KeyArgResolver {
    fn resolve(
        &self,
        _partial: &Map<String, Value>,
        _context: &RequestContext,
        key: &Value,
        selection: &SelectionSet,
    ) -> Result<MergeRequest, DelegationError> {
        let mut args = Map::new();
        args.insert(self.key_arg.clone(), key.clone());
        Ok(MergeRequest {
            operation: OperationKind::Query,
            field_name: self.field_name.clone(),
            args,
            selection_set: selection.clone(),
        })
    }
}
