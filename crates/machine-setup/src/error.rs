//! Setup catalog and rendering errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SetupError {
    /// Catalog file could not be read
    #[error("failed to read machine setup configs from {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Catalog is not valid YAML for the expected schema
    #[error("failed to parse machine setup configs: {0}")]
    Parse(#[source] serde_yaml::Error),

    /// Catalog could not be serialised back to YAML
    #[error("failed to serialise machine setup configs: {0}")]
    Serialize(#[source] serde_yaml::Error),

    /// No catalog entry matches the lookup key
    #[error("could not find a matching machine setup config for {params}")]
    NotFound { params: String },

    /// More than one catalog entry matches the lookup key
    #[error("found {count} matching machine setup configs for {params}")]
    Ambiguous { params: String, count: usize },

    /// Worker scripts need a published API endpoint on the cluster
    #[error("cluster {cluster} has no published API endpoint yet")]
    EndpointNotReady { cluster: String },

    /// Environment preamble failed to render
    #[error("failed to render script preamble: {0}")]
    Render(#[from] minijinja::Error),
}

impl SetupError {
    /// Catalog lookup failures that only an operator can fix
    pub fn is_match_error(&self) -> bool {
        matches!(self, SetupError::NotFound { .. } | SetupError::Ambiguous { .. })
    }
}
