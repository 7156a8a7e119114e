use std::path::PathBuf;
use thiserror::Error;

/// Why an alignment request could not be handed to a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchFailure {
    /// No plugin with the requested id, or no alignment-capable plugin at all.
    NotFound,
    /// The plugin exists but could not be started.
    InitFailed,
    /// The plugin runs but does not produce a time-instant onset stream.
    WrongShape,
}

#[derive(Error, Debug)]
pub enum AlignError {
    /// The score toolkit or its resources are unusable. Nothing is written.
    #[error("Failed to initialise score toolkit: {0}")]
    FatalInit(String),

    /// A single note could not be used. Callers skip it and carry on.
    #[error("Malformed note '{note_id}': {reason}")]
    MalformedNote { note_id: String, reason: String },

    /// The displayed alignment refers to a label the score does not have.
    #[error("Alignment label '{0}' has no counterpart in the score")]
    Integrity(String),

    #[error("Alignment plugin '{plugin}' could not run ({kind:?}): {message}")]
    PluginDispatch {
        plugin: String,
        kind: DispatchFailure,
        message: String,
    },

    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid fraction '{0}'")]
    InvalidFraction(String),

    #[error("Malformed line {line} in '{}': {message}", path.display())]
    Format {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("No audio loaded; one should have been set first")]
    NoAudio,

    #[error("Operation '{operation}' is not valid while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
}

impl AlignError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AlignError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn dispatch(
        plugin: impl Into<String>,
        kind: DispatchFailure,
        message: impl Into<String>,
    ) -> Self {
        AlignError::PluginDispatch {
            plugin: plugin.into(),
            kind,
            message: message.into(),
        }
    }
}

pub type AlignResult<T> = Result<T, AlignError>;
