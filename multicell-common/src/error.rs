//! Error types for configuration loading and named parameter lookup.

/// Errors raised while loading, validating or querying configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for this schema.
    #[error("failed to parse TOML from '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    /// A value was present but out of its allowed range.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// A named parameter was looked up but never configured.
    #[error("parameter '{0}' is not configured")]
    NotConfigured(String),

    /// A named parameter exists but holds a different kind of value.
    #[error("parameter '{name}' is not a {expected}")]
    WrongType { name: String, expected: &'static str },
}
