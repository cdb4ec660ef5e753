pub mod classpath;
pub mod modules;

use crate::error::SetupError;
use crate::host::HostServices;
use crate::host::modules::ModuleDescriptor;
use crate::script::{Language, ScriptUnit, directives};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// A directive that could not be satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unresolved {
    Path(String),
    ModuleNotFound(String),
    ModuleDisabled(String),
}

impl fmt::Display for Unresolved {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Unresolved::Path(path) => write!(f, "path '{path}'"),
            Unresolved::ModuleNotFound(id) => write!(f, "missing module '{id}'"),
            Unresolved::ModuleDisabled(id) => write!(f, "disabled module '{id}'"),
        }
    }
}

impl From<Unresolved> for SetupError {
    fn from(unresolved: Unresolved) -> Self {
        match unresolved {
            Unresolved::Path(path) => SetupError::UnresolvedPath(path),
            Unresolved::ModuleNotFound(id) => SetupError::ModuleNotFound(id),
            Unresolved::ModuleDisabled(id) => SetupError::ModuleDisabled(id),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedDependencies {
    pub classpath: Vec<PathBuf>,
    /// Host modules after transitive closure.
    pub modules: Vec<Arc<ModuleDescriptor>>,
}

/// Resolves every directive in `source`. Modules are resolved first; the
/// first unresolved directive aborts.
pub fn resolve(
    unit: &ScriptUnit,
    language: Language,
    source: &str,
    services: &HostServices,
) -> Result<ResolvedDependencies, SetupError> {
    let _span = tracing::info_span!("script.resolve", unit = %unit.id).entered();

    let module_lines = directives::find(source.lines(), &language.module_prefix());
    let direct = modules::resolve_module_dependencies(&module_lines, &services.modules)
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;
    let modules = modules::transitive_closure(direct, &services.modules);

    let classpath_lines = directives::find(source.lines(), &language.classpath_prefix());
    let environment = services.script_environment(unit);
    let classpath = classpath::resolve_classpath_additions(&classpath_lines, &environment)
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .flatten()
        .collect();

    Ok(ResolvedDependencies { classpath, modules })
}
