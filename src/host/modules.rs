use crate::build::loader::LoadedLibrary;
use crate::helpers;
use ahash::{AHashMap, AHashSet};
use anyhow::{Result, anyhow};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Id of the module every host provides implicitly. Never loaded as a dependency.
pub const CORE_MODULE_ID: &str = "host.core";
pub const MODULE_MANIFEST: &str = "module.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDependency {
    pub id: String,
    pub optional: bool,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
enum DependencySpec {
    Shorthand(String),
    Qualified {
        id: String,
        #[serde(default)]
        optional: bool,
    },
}

impl From<DependencySpec> for ModuleDependency {
    fn from(spec: DependencySpec) -> Self {
        match spec {
            DependencySpec::Shorthand(id) => ModuleDependency { id, optional: false },
            DependencySpec::Qualified { id, optional } => ModuleDependency { id, optional },
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct ModuleManifest {
    id: String,
    name: Option<String>,
    version: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    dependencies: Vec<DependencySpec>,
    #[serde(default)]
    libraries: Vec<PathBuf>,
}

/// A host module: a named bundle of libraries scripts can depend on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    pub id: String,
    pub name: String,
    pub version: Option<String>,
    pub enabled: bool,
    pub dependencies: Vec<ModuleDependency>,
    pub path: PathBuf,
    /// Absolute library paths, files or directories.
    pub libraries: Vec<PathBuf>,
}

impl ModuleDescriptor {
    pub fn read(module_dir: &Path) -> Result<ModuleDescriptor> {
        let manifest_path = module_dir.join(MODULE_MANIFEST);
        let contents = fs::read_to_string(&manifest_path)
            .map_err(|e| anyhow!("Could not read {}: {}", manifest_path.display(), e))?;
        let manifest: ModuleManifest = serde_json::from_str(&contents)
            .map_err(|e| anyhow!("Could not parse {}: {}", manifest_path.display(), e))?;

        let path = helpers::get_abs_path(module_dir);
        let libraries = if manifest.libraries.is_empty() {
            vec![path.join("lib")]
        } else {
            manifest.libraries.iter().map(|lib| path.join(lib)).collect()
        };

        Ok(ModuleDescriptor {
            name: manifest.name.unwrap_or_else(|| manifest.id.clone()),
            id: manifest.id,
            version: manifest.version,
            enabled: manifest.enabled,
            dependencies: manifest.dependencies.into_iter().map(Into::into).collect(),
            path,
            libraries,
        })
    }

    /// Library files of this module. Directories contribute their visible
    /// files, missing entries contribute nothing.
    pub fn library_files(&self) -> Vec<PathBuf> {
        self.libraries
            .iter()
            .flat_map(|library| {
                if library.is_dir() {
                    helpers::visible_entries(library)
                        .into_iter()
                        .filter(|p| p.is_file())
                        .collect::<Vec<_>>()
                } else if library.is_file() {
                    vec![library.clone()]
                } else {
                    vec![]
                }
            })
            .collect()
    }
}

/// Dynamic libraries of an initialised host module, shared by every script
/// loader that depends on it.
#[derive(Debug)]
pub struct ModuleLoader {
    pub id: String,
    pub libraries: Vec<Arc<LoadedLibrary>>,
}

impl ModuleLoader {
    fn open(descriptor: &ModuleDescriptor) -> Result<ModuleLoader, String> {
        let libraries = descriptor
            .library_files()
            .into_iter()
            .filter(|file| helpers::is_dynamic_library(file))
            .map(|file| {
                LoadedLibrary::open_global(&file)
                    .map(Arc::new)
                    .map_err(|e| format!("Could not load {} of module '{}': {e}", file.display(), descriptor.id))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ModuleLoader {
            id: descriptor.id.clone(),
            libraries,
        })
    }
}

/// All host modules known to the process, read once at startup.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: AHashMap<String, Arc<ModuleDescriptor>>,
    loaders: Mutex<AHashMap<String, Arc<ModuleLoader>>>,
}

impl ModuleRegistry {
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = ModuleDescriptor>) -> ModuleRegistry {
        let mut modules = AHashMap::new();
        for descriptor in descriptors {
            if modules.contains_key(&descriptor.id) {
                log::warn!("Duplicated host module '{}' ignored", descriptor.id);
                continue;
            }
            modules.insert(descriptor.id.clone(), Arc::new(descriptor));
        }
        ModuleRegistry {
            modules,
            loaders: Mutex::new(AHashMap::new()),
        }
    }

    /// Reads every `<modules_dir>/<dir>/module.json`. Modules listed in
    /// `disabled` are registered as disabled regardless of their manifest.
    pub fn load(modules_dir: &Path, disabled: &[String]) -> Result<ModuleRegistry> {
        let _span = tracing::info_span!("modules.load", dir = %modules_dir.display()).entered();
        let disabled: AHashSet<&str> = disabled.iter().map(String::as_str).collect();
        let mut descriptors = vec![];
        for dir in helpers::visible_entries(modules_dir) {
            if !dir.join(MODULE_MANIFEST).is_file() {
                continue;
            }
            match ModuleDescriptor::read(&dir) {
                Ok(mut descriptor) => {
                    if disabled.contains(descriptor.id.as_str()) {
                        descriptor.enabled = false;
                    }
                    log::debug!("Found host module '{}' at {}", descriptor.id, dir.display());
                    descriptors.push(descriptor);
                }
                Err(e) => log::warn!("Skipping host module at {}: {e}", dir.display()),
            }
        }
        Ok(ModuleRegistry::from_descriptors(descriptors))
    }

    pub fn get(&self, id: &str) -> Option<Arc<ModuleDescriptor>> {
        self.modules.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.modules.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The initialised loader of `descriptor`, opened on first use.
    pub fn loader(&self, descriptor: &ModuleDescriptor) -> Result<Arc<ModuleLoader>, String> {
        let mut loaders = self.loaders.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(loader) = loaders.get(&descriptor.id) {
            return Ok(loader.clone());
        }
        let loader = Arc::new(ModuleLoader::open(descriptor)?);
        loaders.insert(descriptor.id.clone(), loader.clone());
        Ok(loader)
    }

    /// Opens every enabled module up front, returning the ones that failed.
    pub fn preload(&self) -> Vec<(String, String)> {
        let mut failures = vec![];
        for id in self.ids() {
            let Some(descriptor) = self.get(&id) else { continue };
            if !descriptor.enabled {
                continue;
            }
            if let Err(e) = self.loader(&descriptor) {
                failures.push((id, e));
            }
        }
        failures
    }
}
