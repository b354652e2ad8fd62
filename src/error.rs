use thiserror::Error;

/// Hard failures of the stitching core.
///
/// Data-level problems (a field nobody can resolve, an error returned by a
/// subschema, a null in a non-null position) never end up here: they are
/// embedded in the response as [`crate::GraphQLError`]s. Only configuration
/// invariants and malformed inputs abort a request.
#[derive(Debug, Error)]
pub enum DelegationError {
    #[error("Failed to parse schema for subschema {subschema}: {message}")]
    SchemaParse { subschema: String, message: String },

    #[error("Failed to parse query: {0}")]
    QueryParse(String),

    #[error("Invalid selection set `{selection_set}`: {message}")]
    SelectionSetParse {
        selection_set: String,
        message: String,
    },

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Must provide operation name if query contains multiple operations")]
    AmbiguousOperation,

    #[error("Subschema {subschema} has no {operation} root type")]
    MissingRootType { subschema: String, operation: String },

    #[error("Field {type_name}.{field_name} does not exist on subschema {subschema}")]
    MissingField {
        subschema: String,
        type_name: String,
        field_name: String,
    },

    #[error("No subschema resolves root field {type_name}.{field_name}")]
    UnroutableField {
        type_name: String,
        field_name: String,
    },

    #[error("No field node given for delegation")]
    EmptyFieldNodes,

    #[error("Unknown type: {0}")]
    UnknownType(String),

    #[error("Result for abstract type {0} is missing __typename")]
    MissingTypename(String),

    #[error("Variable ${0} is not defined by the operation")]
    UndefinedVariable(String),

    #[error("Fragment {0} is not defined in the document")]
    UndefinedFragment(String),

    #[error("Subschema {0} does not support subscriptions")]
    SubscriptionsUnsupported(String),

    #[error("Invalid value for {type_name}: {message}")]
    InvalidValue { type_name: String, message: String },

    #[error("Invalid stitching configuration: {0}")]
    Config(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A failure reported by an [`crate::Executor`] or [`crate::Subscriber`]
/// instead of a GraphQL result (transport failure, timeout, ...).
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        ExecutionError {
            message: message.into(),
        }
    }
}
