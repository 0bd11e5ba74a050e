use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::task::TaskResult;

/// A well-formed compile error reported by a builder.
///
/// Compile errors are expected: they are recorded against the task that
/// produced them and the engine keeps running the rest of the current pass.
#[derive(Debug, Error, Clone)]
pub struct CompileError {
    /// Resource blamed for the error, if any.
    pub resource: Option<Utf8PathBuf>,
    /// One-based line number, `0` when unknown.
    pub line: u32,
    pub message: String,
}

impl CompileError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            resource: None,
            line: 0,
            message: message.into(),
        }
    }

    pub fn at(resource: impl Into<Utf8PathBuf>, line: u32, message: impl Into<String>) -> Self {
        Self {
            resource: Some(resource.into()),
            line,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.resource, self.line) {
            (Some(resource), 0) => write!(f, "{resource}: {}", self.message),
            (Some(resource), line) => write!(f, "{resource}:{line}: {}", self.message),
            (None, _) => f.write_str(&self.message),
        }
    }
}

/// Failure returned by a [`Builder`](crate::Builder) while creating or
/// building a task.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// Anything that is not a recognised compile error. Aborts the run.
    #[error(transparent)]
    Fatal(anyhow::Error),

    #[error("Build cancelled")]
    Cancelled,
}

impl BuildError {
    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(err.into())
    }
}

impl From<std::io::Error> for BuildError {
    fn from(err: std::io::Error) -> Self {
        Self::Fatal(err.into())
    }
}

/// Lets builders request tasks from the factory with `?`.
impl From<KilnError> for BuildError {
    fn from(err: KilnError) -> Self {
        match err {
            KilnError::Compile(e) => Self::Compile(e),
            KilnError::Cancelled => Self::Cancelled,
            other => Self::Fatal(other.into()),
        }
    }
}

/// Two distinct input sets claim the same output path.
#[derive(Debug, Error, Clone)]
#[error("Conflicting output resource '{output}' generated by the following input files: {inputs:?} <-> {stored:?}")]
pub struct ConflictError {
    pub output: Utf8PathBuf,
    /// The input reported to the user as the cause of the collision.
    pub resource: Utf8PathBuf,
    pub inputs: Vec<Utf8PathBuf>,
    pub stored: Vec<Utf8PathBuf>,
}

/// Cache infrastructure failure. The engine degrades to a plain build when
/// it sees one of these.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Remote cache error: {0}")]
    Remote(String),

    #[error("Cache entry '{0}' is missing")]
    Missing(String),
}

/// Failure surfaced by the remote native build.
#[derive(Debug, Error, Clone)]
pub enum RemoteBuildError {
    #[error("Failed to connect to {url}: {message}")]
    Connection { url: String, message: String },

    #[error("Failed to build engine: {0}")]
    Compile(String),

    #[error("Remote build worker panicked: {0}")]
    Panicked(String),

    #[error("Remote build cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Couldn't access build state file.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode build state.\n{0}")]
    Encode(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Extension '{ext}' is already claimed by builder '{builder}'")]
    DuplicateExtension { ext: String, builder: String },

    #[error("Builder '{0}' is not registered")]
    UnknownBuilder(String),

    #[error("Couldn't parse builder manifest.\n{0}")]
    Manifest(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum KilnError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("Task '{task}' failed unexpectedly:\n{cause}")]
    Aborted {
        task: String,
        cause: Arc<anyhow::Error>,
    },

    #[error("Builder for '{input}' failed while creating its task:\n{source}")]
    Create {
        input: Utf8PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("No progress possible, {} task(s) blocked: {}", .blocked.len(), .blocked.join(", "))]
    Stalled {
        blocked: Vec<String>,
        cycles: Vec<Vec<String>>,
    },

    /// The remote engine build failed. `results` holds the local task
    /// results of the same build, failed ones included.
    #[error("Remote engine build failed.\n{source}")]
    RemoteBuild {
        #[source]
        source: RemoteBuildError,
        results: Vec<TaskResult>,
    },

    #[error("Build cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Error while handling build state:\n{0}")]
    State(#[from] StateError),

    #[error("Error in builder registry:\n{0}")]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    GlobPattern(#[from] glob::PatternError),

    #[error(transparent)]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Missing libraries folder '{0}'. Resolve the project libraries first")]
    MissingLibraries(Utf8PathBuf),

    #[error("Bundler failed:\n{0}")]
    Bundle(anyhow::Error),
}
