pub mod lifecycle;
pub mod modules;
pub mod ui;

use crate::build::compile::CompilerSettings;
use crate::config::Config;
use crate::helpers;
use crate::script::ScriptUnit;
use ahash::AHashMap;
use anyhow::Result;
use modules::ModuleRegistry;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const RUNTIME_SUPPORT_FILE: &str = "liveplug_runtime.rs";
pub const RUNTIME_SUPPORT_SOURCE: &str = include_str!("../../runtime/liveplug_runtime.rs");

/// Placeholder that expands to the directory of the script being resolved.
pub const PLUGIN_PATH_VAR: &str = "PLUGIN_PATH";

/// The project-like context a script runs in, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostContext {
    pub name: String,
    pub base_path: PathBuf,
}

impl HostContext {
    pub fn for_folder(folder: &Path) -> HostContext {
        let base_path = helpers::get_abs_path(folder);
        let name = base_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| base_path.to_string_lossy().to_string());
        HostContext { name, base_path }
    }
}

/// What caused a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trigger {
    pub context: Option<HostContext>,
    pub is_host_startup: bool,
}

impl Trigger {
    pub fn startup(context: Option<HostContext>) -> Trigger {
        Trigger {
            context,
            is_host_startup: true,
        }
    }

    pub fn user(context: Option<HostContext>) -> Trigger {
        Trigger {
            context,
            is_host_startup: false,
        }
    }
}

/// Receives everything scripts print, tagged with the unit id.
pub type OutputSink = Arc<dyn Fn(&str, &str) + Send + Sync>;

pub fn stdout_sink() -> OutputSink {
    Arc::new(|unit_id: &str, message: &str| println!("[{unit_id}] {message}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    pub scripts_dir: PathBuf,
    pub modules_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub runtime_dir: PathBuf,
}

impl HostPaths {
    /// Every directory below one root, the layout used by tests and `--folder`.
    pub fn under(root: &Path) -> HostPaths {
        HostPaths {
            scripts_dir: root.join("scripts"),
            modules_dir: root.join("modules"),
            cache_dir: root.join(".liveplug").join("cache"),
            runtime_dir: root.join(".liveplug").join("runtime"),
        }
    }
}

/// Process-wide collaborators shared by every script run.
pub struct HostServices {
    pub paths: HostPaths,
    pub modules: ModuleRegistry,
    pub compiler: CompilerSettings,
    pub environment: AHashMap<String, String>,
    pub output: OutputSink,
}

impl HostServices {
    pub fn new(paths: HostPaths, modules: ModuleRegistry, compiler: CompilerSettings) -> HostServices {
        HostServices {
            paths,
            modules,
            compiler,
            environment: std::env::vars().collect(),
            output: stdout_sink(),
        }
    }

    pub fn from_config(folder: &Path, config: &Config) -> Result<HostServices> {
        let root = helpers::get_abs_path(folder);
        let paths = config.paths(&root);
        let modules = ModuleRegistry::load(&paths.modules_dir, &config.disabled_modules)?;
        let mut services = HostServices::new(paths, modules, config.compiler_settings(&root));
        services
            .environment
            .extend(config.environment.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(services)
    }

    pub fn with_output(mut self, output: OutputSink) -> HostServices {
        self.output = output;
        self
    }

    pub fn runtime_file(&self) -> PathBuf {
        self.paths.runtime_dir.join(RUNTIME_SUPPORT_FILE)
    }

    /// Writes the runtime support source into the runtime directory unless
    /// an identical copy is already there.
    pub fn install_runtime(&self) -> io::Result<PathBuf> {
        let target = self.runtime_file();
        if fs::read_to_string(&target).is_ok_and(|existing| existing == RUNTIME_SUPPORT_SOURCE) {
            return Ok(target);
        }
        fs::create_dir_all(&self.paths.runtime_dir)?;
        let mut file = tempfile::NamedTempFile::new_in(&self.paths.runtime_dir)?;
        file.write_all(RUNTIME_SUPPORT_SOURCE.as_bytes())?;
        file.persist(&target).map_err(|e| e.error)?;
        log::debug!("Installed runtime support at {}", target.display());
        Ok(target)
    }

    /// Placeholder values for one unit's directives.
    pub fn script_environment(&self, unit: &ScriptUnit) -> AHashMap<String, String> {
        let mut environment = self.environment.clone();
        environment.insert(PLUGIN_PATH_VAR.to_string(), unit.path.to_string_lossy().to_string());
        environment
    }

    pub fn units(&self) -> io::Result<Vec<ScriptUnit>> {
        ScriptUnit::discover(&self.paths.scripts_dir)
    }

    pub fn find_unit(&self, id: &str) -> Option<ScriptUnit> {
        ScriptUnit::find(&self.paths.scripts_dir, id)
    }
}
