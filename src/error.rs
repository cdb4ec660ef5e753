use std::fmt;
use std::path::PathBuf;

/// Failure while turning a script unit into something that can be run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupError {
    /// None of the known entry files exist in the unit directory.
    NoEntryScript { dir: PathBuf, tried: Vec<String> },
    /// A classpath directive matched nothing (the post-substitution path).
    UnresolvedPath(String),
    ModuleNotFound(String),
    ModuleDisabled(String),
    /// The compiler process could not be started or its output dir prepared.
    CompilerIo(String),
    /// The compiler reported errors in the script.
    Compilation(Vec<String>),
    /// The compiler crashed or failed without reporting a diagnostic.
    CompilerInternal(String),
    /// A classpath entry disappeared between resolution and loading.
    MissingClasspathFile(PathBuf),
    Load(String),
    Io(String),
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SetupError::NoEntryScript { dir, tried } => write!(
                f,
                "No entry script found in {}. Tried: {}",
                dir.display(),
                tried.join(", ")
            ),
            SetupError::UnresolvedPath(path) => write!(f, "Couldn't find dependency '{path}'"),
            SetupError::ModuleNotFound(id) => write!(f, "Couldn't find host module '{id}'"),
            SetupError::ModuleDisabled(id) => write!(f, "Host module '{id}' is disabled"),
            SetupError::CompilerIo(e) => write!(f, "Error while starting the compiler: {e}"),
            SetupError::Compilation(errors) => {
                write!(f, "Failed to compile script:\n{}", errors.join("\n"))
            }
            SetupError::CompilerInternal(e) => write!(f, "Internal compiler error: {e}"),
            SetupError::MissingClasspathFile(path) => {
                write!(f, "Couldn't find classpath entry {}", path.display())
            }
            SetupError::Load(e) => write!(f, "Failed to load compiled script: {e}"),
            SetupError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SetupError {}

/// Failure while instantiating a script or tearing down a previous instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunningError {
    Instantiation(String),
    Disposal(String),
}

impl RunningError {
    pub fn message(&self) -> &str {
        match self {
            RunningError::Instantiation(message) | RunningError::Disposal(message) => message,
        }
    }
}

impl fmt::Display for RunningError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RunningError::Instantiation(e) => write!(f, "Error while running script:\n{e}"),
            RunningError::Disposal(e) => write!(f, "Error while unloading script:\n{e}"),
        }
    }
}

impl std::error::Error for RunningError {}

/// Outcome of one dispatched run request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    Setup(SetupError),
    Running(RunningError),
    /// A run for the same unit is still in flight.
    Busy,
    /// The UI thread went away or the hand-off failed.
    Host(String),
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ScriptError::Setup(e) => write!(f, "{e}"),
            ScriptError::Running(e) => write!(f, "{e}"),
            ScriptError::Busy => write!(f, "Script is already being set up"),
            ScriptError::Host(e) => write!(f, "Host error: {e}"),
        }
    }
}

impl std::error::Error for ScriptError {}

impl From<SetupError> for ScriptError {
    fn from(e: SetupError) -> Self {
        ScriptError::Setup(e)
    }
}

impl From<RunningError> for ScriptError {
    fn from(e: RunningError) -> Self {
        ScriptError::Running(e)
    }
}
