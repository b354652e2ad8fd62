use indexmap::IndexMap;
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::debug;

use crate::{DelegationError, Executor, MergedTypeConfig, Subschema};

/// Stitching configuration, read from YAML:
///
/// ```yaml
/// subgraphs:
///   books:
///     schema:
///       file: books.graphql
///     merge:
///       Book:
///         selection_set: "{ id }"
///         field_name: bookById
///         key_field: id
/// ```
///
/// Subgraphs keep their declaration order, which is the order ownership
/// ties are broken in.
#[derive(Debug, Deserialize)]
pub struct StitchingConfig {
    pub subgraphs: IndexMap<String, SubgraphConfig>,
    /// Directory schema files are resolved against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct SubgraphConfig {
    pub schema: SchemaConfig,
    #[serde(default)]
    pub merge: IndexMap<String, MergeConfig>,
}

/// Where a subgraph's SDL comes from: a file relative to the configuration
/// or inline text.
#[derive(Debug, Deserialize)]
pub struct SchemaConfig {
    pub file: Option<String>,
    pub sdl: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MergeConfig {
    pub selection_set: Option<String>,
    pub field_name: Option<String>,
    pub key_field: Option<String>,
    pub key_arg: Option<String>,
    #[serde(default)]
    pub fields: IndexMap<String, FieldMergeConfig>,
}

#[derive(Debug, Deserialize)]
pub struct FieldMergeConfig {
    pub selection_set: String,
}

impl From<MergeConfig> for MergedTypeConfig {
    fn from(config: MergeConfig) -> Self {
        MergedTypeConfig {
            selection_set: config.selection_set,
            field_name: config.field_name,
            key_field: config.key_field,
            key_arg: config.key_arg,
            fields: config
                .fields
                .into_iter()
                .map(|(field, merge)| (field, merge.selection_set))
                .collect(),
            resolver: None,
        }
    }
}

impl StitchingConfig {
    pub fn from_yaml(contents: &str) -> Result<Self, DelegationError> {
        serde_yaml::from_str(contents)
            .map_err(|e| DelegationError::Config(format!("Failed to parse config file: {}", e)))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, DelegationError> {
        let config_path = path.as_ref();
        debug!(path = %config_path.display(), "Loading stitching config");

        let contents = fs::read_to_string(config_path).map_err(|source| DelegationError::Io {
            path: config_path.display().to_string(),
            source,
        })?;
        let mut config = StitchingConfig::from_yaml(&contents)?;
        config.base_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(config)
    }

    /// Builds one subschema per subgraph, asking `executor_for` for the
    /// executor of each subgraph by name.
    pub fn into_subschemas<F>(self, mut executor_for: F) -> Result<Vec<Subschema>, DelegationError>
    where
        F: FnMut(&str) -> Option<Arc<dyn Executor>>,
    {
        let mut subschemas = Vec::with_capacity(self.subgraphs.len());
        for (name, subgraph) in self.subgraphs {
            let sdl = match (&subgraph.schema.sdl, &subgraph.schema.file) {
                (Some(sdl), _) => sdl.clone(),
                (None, Some(file)) => read_schema_file(&self.base_dir, file)?,
                (None, None) => {
                    return Err(DelegationError::Config(format!(
                        "subgraph \"{}\" declares neither `schema.file` nor `schema.sdl`",
                        name
                    )));
                }
            };
            let executor = executor_for(&name).ok_or_else(|| {
                DelegationError::Config(format!("no executor for subgraph \"{}\"", name))
            })?;

            let mut subschema = Subschema::new(name, &sdl, executor)?;
            for (type_name, merge) in subgraph.merge {
                subschema = subschema.with_merged_type(type_name, merge.into());
            }
            subschemas.push(subschema);
        }
        Ok(subschemas)
    }
}

fn read_schema_file(base_dir: &Path, file_path: &str) -> Result<String, DelegationError> {
    let full_path = base_dir.join(file_path);
    debug!(path = %full_path.display(), "Reading schema file");
    fs::read_to_string(&full_path).map_err(|source| DelegationError::Io {
        path: full_path.display().to_string(),
        source,
    })
}
