use graphql_parser::{
    query::Type as AstType,
    schema::{self as sdl, Definition, TypeDefinition, TypeExtension},
};
use serde_json::{Map, Value};
use std::{collections::HashMap, fmt, sync::Arc};

use crate::{DelegationError, OperationKind, TYPENAME_FIELD, selection::const_value_to_json};

const BUILTIN_SCALARS: [&str; 5] = ["Int", "Float", "String", "Boolean", "ID"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Scalar,
    Object,
    Interface,
    Union,
    Enum,
    InputObject,
}

impl TypeKind {
    pub fn is_composite(self) -> bool {
        matches!(self, TypeKind::Object | TypeKind::Interface | TypeKind::Union)
    }

    pub fn is_abstract(self) -> bool {
        matches!(self, TypeKind::Interface | TypeKind::Union)
    }

    pub fn is_leaf(self) -> bool {
        matches!(self, TypeKind::Scalar | TypeKind::Enum)
    }
}

/// Reference from a field or argument to a type of the arena. Only the
/// named type is stored, so cycles in the schema stay plain edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeRef {
    Named(String),
    List(Box<TypeRef>),
    NonNull(Box<TypeRef>),
}

impl TypeRef {
    pub fn named(name: impl Into<String>) -> Self {
        TypeRef::Named(name.into())
    }

    pub fn named_type(&self) -> &str {
        match self {
            TypeRef::Named(name) => name,
            TypeRef::List(inner) | TypeRef::NonNull(inner) => inner.named_type(),
        }
    }

    pub fn is_non_null(&self) -> bool {
        matches!(self, TypeRef::NonNull(_))
    }

    pub fn from_ast(ty: &AstType<'_, String>) -> Self {
        match ty {
            AstType::NamedType(name) => TypeRef::Named(name.clone()),
            AstType::ListType(inner) => TypeRef::List(Box::new(TypeRef::from_ast(inner))),
            AstType::NonNullType(inner) => TypeRef::NonNull(Box::new(TypeRef::from_ast(inner))),
        }
    }

    pub fn to_ast(&self) -> AstType<'static, String> {
        match self {
            TypeRef::Named(name) => AstType::NamedType(name.clone()),
            TypeRef::List(inner) => AstType::ListType(Box::new(inner.to_ast())),
            TypeRef::NonNull(inner) => AstType::NonNullType(Box::new(inner.to_ast())),
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Named(name) => f.write_str(name),
            TypeRef::List(inner) => write!(f, "[{}]", inner),
            TypeRef::NonNull(inner) => write!(f, "{}!", inner),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputValueDef {
    pub name: String,
    pub ty: TypeRef,
    pub default_value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub ty: TypeRef,
    pub arguments: Vec<InputValueDef>,
}

impl FieldDef {
    pub fn argument(&self, name: &str) -> Option<&InputValueDef> {
        self.arguments.iter().find(|arg| arg.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeDef {
    pub name: String,
    pub kind: TypeKind,
    pub fields: Vec<FieldDef>,
    pub input_fields: Vec<InputValueDef>,
    pub interfaces: Vec<String>,
    pub members: Vec<String>,
    pub enum_values: Vec<String>,
}

impl TypeDef {
    fn new(name: impl Into<String>, kind: TypeKind) -> Self {
        TypeDef {
            name: name.into(),
            kind,
            fields: Vec::new(),
            input_fields: Vec::new(),
            interfaces: Vec::new(),
            members: Vec::new(),
            enum_values: Vec::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// `__typename` is implicitly present on every composite type.
    pub fn has_field(&self, name: &str) -> bool {
        (name == TYPENAME_FIELD && self.kind.is_composite()) || self.field(name).is_some()
    }

    fn absorb(&mut self, other: &TypeDef) {
        for field in &other.fields {
            if self.field(&field.name).is_none() {
                self.fields.push(field.clone());
            }
        }
        for input in &other.input_fields {
            if !self.input_fields.iter().any(|own| own.name == input.name) {
                self.input_fields.push(input.clone());
            }
        }
        extend_unique(&mut self.interfaces, &other.interfaces);
        extend_unique(&mut self.members, &other.members);
        extend_unique(&mut self.enum_values, &other.enum_values);
    }
}

fn extend_unique(target: &mut Vec<String>, source: &[String]) {
    for item in source {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
}

/// Leaf value transform of a scalar: how argument values are written for a
/// backend and how result values are read back.
pub trait ScalarCodec: Send + Sync {
    fn serialize(&self, value: &Value) -> Result<Value, String>;

    fn parse(&self, value: &Value) -> Result<Value, String> {
        Ok(value.clone())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct TypeId(usize);

/// Read-only arena of the types of one schema.
#[derive(Clone, Default)]
pub struct SchemaGraph {
    types: Vec<TypeDef>,
    index: HashMap<String, TypeId>,
    query_type: Option<String>,
    mutation_type: Option<String>,
    subscription_type: Option<String>,
    codecs: HashMap<String, Arc<dyn ScalarCodec>>,
}

impl fmt::Debug for SchemaGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaGraph")
            .field("types", &self.types.iter().map(|t| &t.name).collect::<Vec<_>>())
            .field("query_type", &self.query_type)
            .field("mutation_type", &self.mutation_type)
            .field("subscription_type", &self.subscription_type)
            .finish()
    }
}

impl SchemaGraph {
    pub fn parse(source: &str) -> Result<Self, String> {
        let document = sdl::parse_schema::<String>(source).map_err(|e| e.to_string())?;
        let mut graph = SchemaGraph::default();
        let mut extensions = Vec::new();

        for definition in &document.definitions {
            match definition {
                Definition::SchemaDefinition(schema) => {
                    graph.query_type = schema.query.clone();
                    graph.mutation_type = schema.mutation.clone();
                    graph.subscription_type = schema.subscription.clone();
                }
                Definition::TypeDefinition(typedef) => graph.insert(type_from_ast(typedef)),
                Definition::TypeExtension(TypeExtension::Object(ext)) => {
                    let mut typedef = TypeDef::new(ext.name.clone(), TypeKind::Object);
                    typedef.fields = ext.fields.iter().map(field_from_ast).collect();
                    typedef.interfaces = ext.implements_interfaces.clone();
                    extensions.push(typedef);
                }
                Definition::TypeExtension(_) | Definition::DirectiveDefinition(_) => {}
            }
        }

        for extension in extensions {
            graph.insert(extension);
        }
        for scalar in BUILTIN_SCALARS {
            if !graph.index.contains_key(scalar) {
                graph.insert(TypeDef::new(scalar, TypeKind::Scalar));
            }
        }
        graph.default_root_types();

        Ok(graph)
    }

    /// Union of several graphs. The first declaration of a field decides its
    /// type; later graphs only contribute what is missing.
    pub fn union<'a>(graphs: impl IntoIterator<Item = &'a SchemaGraph>) -> SchemaGraph {
        let mut merged = SchemaGraph::default();
        for graph in graphs {
            for typedef in &graph.types {
                merged.insert(typedef.clone());
            }
            for (name, codec) in &graph.codecs {
                merged
                    .codecs
                    .entry(name.clone())
                    .or_insert_with(|| codec.clone());
            }
            merged.query_type = merged.query_type.take().or_else(|| graph.query_type.clone());
            merged.mutation_type = merged
                .mutation_type
                .take()
                .or_else(|| graph.mutation_type.clone());
            merged.subscription_type = merged
                .subscription_type
                .take()
                .or_else(|| graph.subscription_type.clone());
        }
        merged
    }

    #[must_use]
    pub fn with_scalar_codec(
        mut self,
        scalar: impl Into<String>,
        codec: Arc<dyn ScalarCodec>,
    ) -> Self {
        self.codecs.insert(scalar.into(), codec);
        self
    }

    fn insert(&mut self, typedef: TypeDef) {
        match self.index.get(&typedef.name) {
            Some(id) => self.types[id.0].absorb(&typedef),
            None => {
                self.index
                    .insert(typedef.name.clone(), TypeId(self.types.len()));
                self.types.push(typedef);
            }
        }
    }

    fn default_root_types(&mut self) {
        let present = |name: &str| self.index.contains_key(name).then(|| name.to_string());
        let query = present("Query");
        let mutation = present("Mutation");
        let subscription = present("Subscription");
        self.query_type = self.query_type.take().or(query);
        self.mutation_type = self.mutation_type.take().or(mutation);
        self.subscription_type = self.subscription_type.take().or(subscription);
    }

    pub fn type_def(&self, name: &str) -> Option<&TypeDef> {
        self.index.get(name).map(|id| &self.types[id.0])
    }

    pub fn types(&self) -> impl Iterator<Item = &TypeDef> {
        self.types.iter()
    }

    pub fn field(&self, type_name: &str, field_name: &str) -> Option<&FieldDef> {
        self.type_def(type_name)?.field(field_name)
    }

    pub fn has_field(&self, type_name: &str, field_name: &str) -> bool {
        self.type_def(type_name)
            .is_some_and(|typedef| typedef.has_field(field_name))
    }

    pub fn root_type_name(&self, operation: OperationKind) -> Option<&str> {
        match operation {
            OperationKind::Query => self.query_type.as_deref(),
            OperationKind::Mutation => self.mutation_type.as_deref(),
            OperationKind::Subscription => self.subscription_type.as_deref(),
        }
    }

    pub fn root_type(&self, operation: OperationKind) -> Option<&TypeDef> {
        self.type_def(self.root_type_name(operation)?)
    }

    /// Which operation a field of `type_name` belongs to, if the type is a
    /// root type of this schema.
    pub fn operation_kind_of(&self, type_name: &str) -> Option<OperationKind> {
        [
            OperationKind::Query,
            OperationKind::Mutation,
            OperationKind::Subscription,
        ]
        .into_iter()
        .find(|kind| self.root_type_name(*kind) == Some(type_name))
    }

    pub fn possible_types(&self, type_name: &str) -> Vec<&str> {
        let Some(typedef) = self.type_def(type_name) else {
            return Vec::new();
        };
        match typedef.kind {
            TypeKind::Object => vec![typedef.name.as_str()],
            TypeKind::Union => typedef.members.iter().map(String::as_str).collect(),
            TypeKind::Interface => self
                .types
                .iter()
                .filter(|t| t.kind == TypeKind::Object && t.interfaces.contains(&typedef.name))
                .map(|t| t.name.as_str())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Whether an object of `concrete` matches a fragment on `condition`.
    pub fn is_possible_type(&self, condition: &str, concrete: &str) -> bool {
        condition == concrete || self.possible_types(condition).contains(&concrete)
    }

    /// Serializes an input value for `ty` through the leaf transforms of its
    /// scalars, recursing through lists and input objects.
    pub fn serialize_input(&self, ty: &TypeRef, value: &Value) -> Result<Value, DelegationError> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match ty {
            TypeRef::NonNull(inner) => self.serialize_input(inner, value),
            TypeRef::List(inner) => match value {
                Value::Array(items) => items
                    .iter()
                    .map(|item| self.serialize_input(inner, item))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array),
                single => self.serialize_input(inner, single),
            },
            TypeRef::Named(name) => self.serialize_named(name, value),
        }
    }

    fn serialize_named(&self, name: &str, value: &Value) -> Result<Value, DelegationError> {
        let typedef = self
            .type_def(name)
            .ok_or_else(|| DelegationError::UnknownType(name.to_string()))?;
        match typedef.kind {
            TypeKind::InputObject => {
                let Value::Object(fields) = value else {
                    return Err(DelegationError::InvalidValue {
                        type_name: name.to_string(),
                        message: format!("expected an object, found {}", value),
                    });
                };
                let mut serialized = Map::new();
                for input in &typedef.input_fields {
                    if let Some(field_value) = fields.get(&input.name) {
                        serialized.insert(
                            input.name.clone(),
                            self.serialize_input(&input.ty, field_value)?,
                        );
                    }
                }
                Ok(Value::Object(serialized))
            }
            TypeKind::Scalar => match self.codecs.get(name) {
                Some(codec) => {
                    codec
                        .serialize(value)
                        .map_err(|message| DelegationError::InvalidValue {
                            type_name: name.to_string(),
                            message,
                        })
                }
                None => Ok(serialize_builtin(name, value)),
            },
            _ => Ok(value.clone()),
        }
    }

    /// Reads a leaf value returned by a subschema.
    pub fn parse_leaf(&self, type_name: &str, value: &Value) -> Result<Value, String> {
        match self.codecs.get(type_name) {
            Some(codec) => codec.parse(value),
            None => Ok(value.clone()),
        }
    }
}

fn serialize_builtin(name: &str, value: &Value) -> Value {
    match (name, value) {
        ("ID", Value::Number(number)) => Value::String(number.to_string()),
        _ => value.clone(),
    }
}

fn input_value_from_ast(input: &sdl::InputValue<'_, String>) -> InputValueDef {
    InputValueDef {
        name: input.name.clone(),
        ty: TypeRef::from_ast(&input.value_type),
        default_value: input.default_value.as_ref().map(const_value_to_json),
    }
}

fn field_from_ast(field: &sdl::Field<'_, String>) -> FieldDef {
    FieldDef {
        name: field.name.clone(),
        ty: TypeRef::from_ast(&field.field_type),
        arguments: field.arguments.iter().map(input_value_from_ast).collect(),
    }
}

fn type_from_ast(typedef: &TypeDefinition<'_, String>) -> TypeDef {
    match typedef {
        TypeDefinition::Object(obj) => {
            let mut def = TypeDef::new(obj.name.clone(), TypeKind::Object);
            def.fields = obj.fields.iter().map(field_from_ast).collect();
            def.interfaces = obj.implements_interfaces.clone();
            def
        }
        TypeDefinition::Interface(iface) => {
            let mut def = TypeDef::new(iface.name.clone(), TypeKind::Interface);
            def.fields = iface.fields.iter().map(field_from_ast).collect();
            def.interfaces = iface.implements_interfaces.clone();
            def
        }
        TypeDefinition::Union(union_type) => {
            let mut def = TypeDef::new(union_type.name.clone(), TypeKind::Union);
            def.members = union_type.types.clone();
            def
        }
        TypeDefinition::Enum(enum_type) => {
            let mut def = TypeDef::new(enum_type.name.clone(), TypeKind::Enum);
            def.enum_values = enum_type.values.iter().map(|v| v.name.clone()).collect();
            def
        }
        TypeDefinition::InputObject(input) => {
            let mut def = TypeDef::new(input.name.clone(), TypeKind::InputObject);
            def.input_fields = input.fields.iter().map(input_value_from_ast).collect();
            def
        }
        TypeDefinition::Scalar(scalar) => TypeDef::new(scalar.name.clone(), TypeKind::Scalar),
    }
}
