use multicell_common::ConfigError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure of a single agent's rule. The agent is skipped for the rest of the step.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("substrate '{0}' is not defined in the field")]
    MissingSubstrate(String),

    #[error(transparent)]
    MissingParameter(#[from] ConfigError),

    #[error("metabolic solver failed: {0}")]
    Solver(String),

    #[error("numerical failure: {0}")]
    Numerical(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error on {path}: {source}")]
    FatalIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize {path}: {message}")]
    Serialize { path: PathBuf, message: String },
}

impl EngineError {
    pub fn fatal_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        EngineError::FatalIo { path: path.into(), source }
    }

    /// Process exit status: `EX_IOERR` for unrecoverable I/O, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::FatalIo { .. } => 74,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_io_maps_to_ex_ioerr() {
        let err = EngineError::fatal_io("out.json", io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        assert_eq!(err.exit_code(), 74);
        assert!(err.to_string().contains("out.json"));

        let err = EngineError::Config(ConfigError::Invalid("bad".into()));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn missing_parameter_converts_from_config_error() {
        let err: RuleError = ConfigError::NotConfigured("kill_rate".into()).into();
        assert!(matches!(err, RuleError::MissingParameter(_)));
    }
}
