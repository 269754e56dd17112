use thiserror::Error;

/// Phase of a build in which an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPhase {
    /// Directive parsing and stage graph construction
    Parse,
    /// Stage reference resolution
    Resolve,
    /// Stage execution
    Execute,
}

/// Stagecraft error types
#[derive(Error, Debug)]
pub enum BuildError {
    /// Directive text could not be parsed
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Two stages declare the same name
    #[error("Duplicate stage name '{name}' (stages #{first} and #{second})")]
    DuplicateStageName {
        name: String,
        first: usize,
        second: usize,
    },

    /// A stage declaration is unusable (bad base reference or stage name)
    #[error("Malformed stage {stage} at line {line}: {message}")]
    MalformedStage {
        stage: String,
        line: usize,
        message: String,
    },

    /// A token looks like a stage index but no such stage exists
    #[error("Stage {stage}: '{instruction}' refers to stage index {token}, but only {stage_count} stage(s) are declared")]
    UnresolvedInternalReference {
        stage: String,
        instruction: String,
        token: String,
        stage_count: usize,
    },

    /// A stage refers to a stage declared after it
    #[error("Stage {stage}: '{instruction}' refers to stage {target}, which is declared later")]
    ForwardReference {
        stage: String,
        instruction: String,
        target: String,
    },

    /// A reference token is neither a stage nor a valid image reference
    #[error("Stage {stage}: '{instruction}' refers to '{token}', which is neither a stage nor a valid image: {message}")]
    InvalidStageReference {
        stage: String,
        instruction: String,
        token: String,
        message: String,
    },

    /// Stage dependencies form a cycle (including self-references)
    #[error("Stage {stage}: '{instruction}' creates a dependency cycle: {}", .cycle.join(" -> "))]
    CyclicDependency {
        stage: String,
        instruction: String,
        cycle: Vec<String>,
    },

    /// An external image could not be fetched or unpacked
    #[error("Stage {stage}: failed to fetch image {reference}: {message}")]
    ExternalImageFetch {
        stage: String,
        reference: String,
        message: String,
    },

    /// A stage instruction failed
    #[error("Stage {stage}: '{instruction}' failed: {message}")]
    InstructionExecution {
        stage: String,
        instruction: String,
        message: String,
    },


    /// Image reference is not syntactically valid
    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl BuildError {
    /// The build phase this error belongs to, if it is stage-graph related.
    pub fn phase(&self) -> Option<ErrorPhase> {
        match self {
            BuildError::Parse { .. }
            | BuildError::DuplicateStageName { .. }
            | BuildError::MalformedStage { .. } => Some(ErrorPhase::Parse),
            BuildError::UnresolvedInternalReference { .. }
            | BuildError::InvalidStageReference { .. }
            | BuildError::ForwardReference { .. }
            | BuildError::CyclicDependency { .. } => Some(ErrorPhase::Resolve),
            BuildError::ExternalImageFetch { .. } | BuildError::InstructionExecution { .. } => {
                Some(ErrorPhase::Execute)
            }
            _ => None,
        }
    }

    /// Label of the stage that raised this error, when known.
    pub fn stage(&self) -> Option<&str> {
        match self {
            BuildError::MalformedStage { stage, .. }
            | BuildError::UnresolvedInternalReference { stage, .. }
            | BuildError::InvalidStageReference { stage, .. }
            | BuildError::ForwardReference { stage, .. }
            | BuildError::CyclicDependency { stage, .. }
            | BuildError::ExternalImageFetch { stage, .. }
            | BuildError::InstructionExecution { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for BuildError {
    fn from(err: serde_json::Error) -> Self {
        BuildError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for BuildError {
    fn from(err: serde_yaml::Error) -> Self {
        BuildError::SerializationError(err.to_string())
    }
}

/// Result type alias for stagecraft operations
pub type Result<T> = std::result::Result<T, BuildError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_stage_name_display() {
        let error = BuildError::DuplicateStageName {
            name: "builder".to_string(),
            first: 0,
            second: 2,
        };
        assert_eq!(
            error.to_string(),
            "Duplicate stage name 'builder' (stages #0 and #2)"
        );
    }

    #[test]
    fn test_cyclic_dependency_display() {
        let error = BuildError::CyclicDependency {
            stage: "#1".to_string(),
            instruction: "COPY --from=1 /c /d".to_string(),
            cycle: vec!["#1".to_string(), "#1".to_string()],
        };
        assert_eq!(
            error.to_string(),
            "Stage #1: 'COPY --from=1 /c /d' creates a dependency cycle: #1 -> #1"
        );
    }

    #[test]
    fn test_instruction_execution_display() {
        let error = BuildError::InstructionExecution {
            stage: "builder".to_string(),
            instruction: "RUN make".to_string(),
            message: "exit status 2".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Stage builder: 'RUN make' failed: exit status 2"
        );
    }

    #[test]
    fn test_phase_classification() {
        let parse = BuildError::Parse {
            line: 1,
            message: "bad".to_string(),
        };
        assert_eq!(parse.phase(), Some(ErrorPhase::Parse));

        let resolve = BuildError::ForwardReference {
            stage: "#0".to_string(),
            instruction: "COPY --from=later / /".to_string(),
            target: "later".to_string(),
        };
        assert_eq!(resolve.phase(), Some(ErrorPhase::Resolve));

        let exec = BuildError::ExternalImageFetch {
            stage: "#0".to_string(),
            reference: "alpine".to_string(),
            message: "not found".to_string(),
        };
        assert_eq!(exec.phase(), Some(ErrorPhase::Execute));

        assert_eq!(BuildError::Other("x".to_string()).phase(), None);
    }

    #[test]
    fn test_stage_label_accessor() {
        let error = BuildError::InvalidStageReference {
            stage: "test".to_string(),
            instruction: "COPY --from=Bad! /a /b".to_string(),
            token: "Bad!".to_string(),
            message: "invalid repository name".to_string(),
        };
        assert_eq!(error.stage(), Some("test"));
        assert_eq!(error.phase(), Some(ErrorPhase::Resolve));
        assert_eq!(BuildError::ConfigError("x".to_string()).stage(), None);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: BuildError = io_error.into();
        assert!(matches!(error, BuildError::IoError(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let error: BuildError = result.unwrap_err().into();
        assert!(matches!(error, BuildError::SerializationError(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let error: BuildError = result.unwrap_err().into();
        assert!(matches!(error, BuildError::SerializationError(_)));
    }
}
