pub mod native;
pub mod rhai;

use crate::binding::Binding;
use crate::error::{RunningError, SetupError};
use crate::host::HostServices;
use crate::report::ScriptReporter;
use crate::script::{EntryKind, Language, ScriptUnit};
use std::fmt;
use std::fs;

/// A unit that is ready to run. Produced off the UI thread, consumed by
/// exactly one `run`.
pub enum Artifact {
    Native(native::NativeArtifact),
    Rhai(rhai::RhaiArtifact),
}

impl Artifact {
    pub fn language(&self) -> Language {
        match self {
            Artifact::Native(_) => Language::Native,
            Artifact::Rhai(_) => Language::Rhai,
        }
    }

    pub fn unit_id(&self) -> &str {
        match self {
            Artifact::Native(artifact) => artifact.unit_id(),
            Artifact::Rhai(artifact) => artifact.unit_id(),
        }
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("unit_id", &self.unit_id())
            .field("language", &self.language())
            .finish()
    }
}

/// Resolves, compiles when needed, and loads `unit`.
pub fn setup<R: ScriptReporter + ?Sized>(
    unit: &ScriptUnit,
    kind: EntryKind,
    services: &HostServices,
    reporter: &R,
) -> Result<Artifact, SetupError> {
    let _span = tracing::info_span!("script.setup", unit = %unit.id, kind = %kind).entered();
    let (language, entry_file) = unit.detect_entry(kind)?;
    let source = fs::read_to_string(&entry_file)
        .map_err(|e| SetupError::Io(format!("Could not read {}: {e}", entry_file.display())))?;
    log::debug!("Setting up {} as {language}", unit.id);

    match language {
        Language::Native => {
            native::setup(unit, &entry_file, &source, services, reporter).map(Artifact::Native)
        }
        Language::Rhai => rhai::setup(unit, &entry_file, &source, services).map(Artifact::Rhai),
    }
}

/// Instantiates the script under `binding`. Must run on the UI thread.
pub fn run(artifact: Artifact, binding: &Binding) -> Result<(), RunningError> {
    let _span = tracing::info_span!("script.run", unit = %binding.unit_id).entered();
    match artifact {
        Artifact::Native(artifact) => native::run(artifact, binding),
        Artifact::Rhai(artifact) => rhai::run(artifact, binding),
    }
}
