use async_trait::async_trait;
use indexmap::IndexMap;
use std::{collections::HashMap, fmt, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::{
    DelegationError, Executor, KeyArgResolver, MergeResolver, MergedTypeInfo, OperationKind,
    SchemaGraph, Subscriber,
};

/// Dense handle of a registered subschema. Registration order is the
/// declaration order used when several subschemas own the same field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubschemaId(pub(crate) usize);

impl SubschemaId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// How one subschema fetches a merged type by key.
#[derive(Clone, Default)]
pub struct MergedTypeConfig {
    /// Type-level key selection, e.g. `{ id }`. Defaults to `key_field`.
    pub selection_set: Option<String>,
    /// Root field called with the key.
    pub field_name: Option<String>,
    /// Field of the partial object used as the key instead of the projection
    /// of `selection_set`.
    pub key_field: Option<String>,
    /// Argument receiving the key. Defaults to `id`.
    pub key_arg: Option<String>,
    /// Field-level key selections.
    pub fields: IndexMap<String, String>,
    pub resolver: Option<Arc<dyn MergeResolver>>,
}

impl MergedTypeConfig {
    pub fn by_key(field_name: impl Into<String>, key: impl Into<String>) -> Self {
        let key = key.into();
        MergedTypeConfig {
            field_name: Some(field_name.into()),
            key_field: Some(key.clone()),
            key_arg: Some(key),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn selection_set(mut self, selection_set: impl Into<String>) -> Self {
        self.selection_set = Some(selection_set.into());
        self
    }

    #[must_use]
    pub fn field_selection_set(
        mut self,
        field: impl Into<String>,
        selection_set: impl Into<String>,
    ) -> Self {
        self.fields.insert(field.into(), selection_set.into());
        self
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn MergeResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub(crate) fn resolver(&self) -> Option<Arc<dyn MergeResolver>> {
        if let Some(resolver) = &self.resolver {
            return Some(resolver.clone());
        }
        let field_name = self.field_name.as_ref()?;
        let key_arg = self.key_arg.clone().unwrap_or_else(|| "id".to_string());
        Some(Arc::new(KeyArgResolver::new(field_name.clone(), key_arg)))
    }
}

#[derive(Clone)]
pub struct Subschema {
    pub name: String,
    pub schema: Arc<SchemaGraph>,
    pub executor: Arc<dyn Executor>,
    pub subscriber: Option<Arc<dyn Subscriber>>,
    pub merge: IndexMap<String, MergedTypeConfig>,
}

impl fmt::Debug for Subschema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subschema")
            .field("name", &self.name)
            .field("merged_types", &self.merge.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Subschema {
    pub fn new(
        name: impl Into<String>,
        sdl: &str,
        executor: Arc<dyn Executor>,
    ) -> Result<Self, DelegationError> {
        let name = name.into();
        let schema = SchemaGraph::parse(sdl).map_err(|message| DelegationError::SchemaParse {
            subschema: name.clone(),
            message,
        })?;
        Ok(Subschema::from_graph(name, schema, executor))
    }

    pub fn from_graph(
        name: impl Into<String>,
        schema: SchemaGraph,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Subschema {
            name: name.into(),
            schema: Arc::new(schema),
            executor,
            subscriber: None,
            merge: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn with_subscriber(mut self, subscriber: Arc<dyn Subscriber>) -> Self {
        self.subscriber = Some(subscriber);
        self
    }

    #[must_use]
    pub fn with_merged_type(
        mut self,
        type_name: impl Into<String>,
        config: MergedTypeConfig,
    ) -> Self {
        self.merge.insert(type_name.into(), config);
        self
    }
}

/// The assembled gateway: subschemas, the gateway schema graph and the
/// ownership registry of every merged type. Immutable once built.
pub struct StitchedSchema {
    subschemas: Vec<Subschema>,
    gateway: SchemaGraph,
    merged_types: HashMap<String, MergedTypeInfo>,
}

impl StitchedSchema {
    pub fn build(subschemas: Vec<Subschema>) -> Result<Self, DelegationError> {
        let gateway = SchemaGraph::union(subschemas.iter().map(|s| s.schema.as_ref()));
        StitchedSchema::with_gateway_schema(subschemas, gateway)
    }

    #[instrument(level = "debug", skip_all, fields(subschemas = subschemas.len()))]
    pub fn with_gateway_schema(
        subschemas: Vec<Subschema>,
        gateway: SchemaGraph,
    ) -> Result<Self, DelegationError> {
        let mut merged_types = HashMap::new();
        for typedef in gateway.types() {
            if let Some(info) = MergedTypeInfo::build(&typedef.name, &subschemas)? {
                debug!(
                    type_name = %typedef.name,
                    subschemas = info.subschemas.len(),
                    unique_fields = info.unique_fields.len(),
                    non_unique_fields = info.non_unique_fields.len(),
                    "Registered merged type"
                );
                merged_types.insert(typedef.name.clone(), info);
            }
        }

        Ok(StitchedSchema {
            subschemas,
            gateway,
            merged_types,
        })
    }

    pub fn gateway(&self) -> &SchemaGraph {
        &self.gateway
    }

    pub fn subschema(&self, id: SubschemaId) -> &Subschema {
        &self.subschemas[id.0]
    }

    pub fn subschema_by_name(&self, name: &str) -> Option<SubschemaId> {
        self.subschemas
            .iter()
            .position(|subschema| subschema.name == name)
            .map(SubschemaId)
    }

    pub fn subschemas(&self) -> impl Iterator<Item = (SubschemaId, &Subschema)> {
        self.subschemas
            .iter()
            .enumerate()
            .map(|(index, subschema)| (SubschemaId(index), subschema))
    }

    pub fn merged_type(&self, type_name: &str) -> Option<&MergedTypeInfo> {
        self.merged_types.get(type_name)
    }

    /// First subschema, in declaration order, exposing `field_name` on its
    /// root type for `operation`.
    pub fn root_field_owner(
        &self,
        operation: OperationKind,
        field_name: &str,
    ) -> Option<SubschemaId> {
        self.subschemas().find_map(|(id, subschema)| {
            subschema
                .schema
                .root_type(operation)
                .filter(|root| root.field(field_name).is_some())
                .map(|_| id)
        })
    }
}

#[async_trait]
pub trait SchemaRegistry {
    async fn register_subschema(&mut self, subschema: Subschema) -> Result<(), DelegationError>;
    async fn get_schema(&self) -> Result<Arc<StitchedSchema>, DelegationError>;
}

pub struct InMemorySchemaRegistry {
    subschemas: Arc<RwLock<Vec<Subschema>>>,
    stitched_schema: Arc<RwLock<Option<Arc<StitchedSchema>>>>,
}

impl Default for InMemorySchemaRegistry {
    fn default() -> Self {
        InMemorySchemaRegistry::new()
    }
}

impl InMemorySchemaRegistry {
    pub fn new() -> Self {
        InMemorySchemaRegistry {
            subschemas: Arc::new(RwLock::new(Vec::new())),
            stitched_schema: Arc::new(RwLock::new(None)),
        }
    }
}

#[async_trait]
impl SchemaRegistry for InMemorySchemaRegistry {
    async fn register_subschema(&mut self, subschema: Subschema) -> Result<(), DelegationError> {
        debug!(subschema = %subschema.name, "Registering subschema");
        let mut subschemas = self.subschemas.write().await;
        match subschemas.iter_mut().find(|known| known.name == subschema.name) {
            Some(known) => *known = subschema,
            None => subschemas.push(subschema),
        }

        let mut stitched_schema = self.stitched_schema.write().await;
        *stitched_schema = None;

        Ok(())
    }

    async fn get_schema(&self) -> Result<Arc<StitchedSchema>, DelegationError> {
        let cached_schema = self.stitched_schema.read().await;
        if let Some(schema) = &*cached_schema {
            return Ok(schema.clone());
        }
        drop(cached_schema);

        let subschemas = self.subschemas.read().await;
        let schema = Arc::new(StitchedSchema::build(subschemas.clone())?);

        let mut stitched_schema = self.stitched_schema.write().await;
        *stitched_schema = Some(schema.clone());

        Ok(schema)
    }
}
