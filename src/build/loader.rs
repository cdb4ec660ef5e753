use crate::error::SetupError;
use crate::helpers;
use crate::host::modules::ModuleLoader;
use libloading::Library;
use std::env::consts::DLL_SUFFIX;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;

/// An opened dynamic library together with the path it was opened from.
pub struct LoadedLibrary {
    path: PathBuf,
    library: Library,
}

impl fmt::Debug for LoadedLibrary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LoadedLibrary").field("path", &self.path).finish()
    }
}

impl LoadedLibrary {
    /// Opens with local symbol visibility.
    pub fn open(path: &Path) -> Result<LoadedLibrary, libloading::Error> {
        let library = unsafe { Library::new(path) }?;
        Ok(LoadedLibrary {
            path: path.to_path_buf(),
            library,
        })
    }

    /// Opens so that later libraries can link against this one's symbols.
    pub fn open_global(path: &Path) -> Result<LoadedLibrary, libloading::Error> {
        #[cfg(unix)]
        let library: Library = {
            use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_NOW};
            unsafe { UnixLibrary::open(Some(path), RTLD_NOW | RTLD_GLOBAL) }?.into()
        };
        #[cfg(not(unix))]
        let library = unsafe { Library::new(path) }?;
        Ok(LoadedLibrary {
            path: path.to_path_buf(),
            library,
        })
    }

    /// The running executable, used as the last resort of the parent layer.
    pub fn this_process() -> Result<LoadedLibrary, libloading::Error> {
        #[cfg(unix)]
        let library: Library = libloading::os::unix::Library::this().into();
        #[cfg(windows)]
        let library: Library = libloading::os::windows::Library::this()?.into();
        Ok(LoadedLibrary {
            path: std::env::current_exe().unwrap_or_default(),
            library,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// # Safety
    /// `T` must match the actual type of the exported symbol.
    pub unsafe fn get<T: Copy>(&self, symbol: &[u8]) -> Option<T> {
        unsafe { self.library.get::<T>(symbol) }.ok().map(|symbol| *symbol)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerKind {
    HostModule(String),
    Engine,
    CompiledOutput,
    Runtime,
    ClasspathAddition,
}

struct Layer {
    kind: LayerKind,
    libraries: Vec<Arc<LoadedLibrary>>,
}

/// The loader hierarchy of one script run. Symbol lookup asks the layers in
/// order and returns the first hit.
pub struct LoadContext {
    unit_id: String,
    layers: Vec<Layer>,
    // Declared after `layers`: libraries are closed before the shadow file goes.
    shadow: Option<TempPath>,
}

impl fmt::Debug for LoadContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LoadContext")
            .field("unit_id", &self.unit_id)
            .field("layers", &self.layer_kinds())
            .finish()
    }
}

impl LoadContext {
    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    pub fn layer_kinds(&self) -> Vec<LayerKind> {
        self.layers.iter().map(|layer| layer.kind.clone()).collect()
    }

    /// Path of the private copy the compiled output was loaded from.
    pub fn shadow_path(&self) -> Option<&Path> {
        self.shadow.as_deref()
    }

    /// # Safety
    /// `T` must match the actual type of the exported symbol.
    pub unsafe fn symbol<T: Copy>(&self, name: &[u8]) -> Option<T> {
        self.layers
            .iter()
            .flat_map(|layer| layer.libraries.iter())
            .find_map(|library| unsafe { library.get::<T>(name) })
    }

    /// Looks `name` up in the compiled output layer only.
    ///
    /// # Safety
    /// `T` must match the actual type of the exported symbol.
    pub unsafe fn output_symbol<T: Copy>(&self, name: &[u8]) -> Option<T> {
        self.layers
            .iter()
            .filter(|layer| layer.kind == LayerKind::CompiledOutput)
            .flat_map(|layer| layer.libraries.iter())
            .find_map(|library| unsafe { library.get::<T>(name) })
    }
}

pub struct LoaderBuilder<'a> {
    unit_id: &'a str,
    modules: Vec<Arc<ModuleLoader>>,
    output_library: Option<&'a Path>,
    runtime_dir: Option<&'a Path>,
    additions: &'a [PathBuf],
}

impl<'a> LoaderBuilder<'a> {
    pub fn new(unit_id: &'a str) -> Self {
        LoaderBuilder {
            unit_id,
            modules: vec![],
            output_library: None,
            runtime_dir: None,
            additions: &[],
        }
    }

    pub fn modules(mut self, modules: Vec<Arc<ModuleLoader>>) -> Self {
        self.modules = modules;
        self
    }

    pub fn output_library(mut self, library: &'a Path) -> Self {
        self.output_library = Some(library);
        self
    }

    pub fn runtime_dir(mut self, dir: &'a Path) -> Self {
        self.runtime_dir = Some(dir);
        self
    }

    pub fn additions(mut self, additions: &'a [PathBuf]) -> Self {
        self.additions = additions;
        self
    }

    pub fn build(self) -> Result<LoadContext, SetupError> {
        let _span = tracing::info_span!("script.load", unit = %self.unit_id).entered();

        if let Some(missing) = self.additions.iter().find(|addition| !addition.exists()) {
            return Err(SetupError::MissingClasspathFile(missing.clone()));
        }

        let mut layers = vec![];
        for module in &self.modules {
            layers.push(Layer {
                kind: LayerKind::HostModule(module.id.clone()),
                libraries: module.libraries.clone(),
            });
        }
        layers.push(Layer {
            kind: LayerKind::Engine,
            libraries: vec![Arc::new(LoadedLibrary::this_process().map_err(load_error("the host process"))?)],
        });

        let mut shadow = None;
        if let Some(library) = self.output_library {
            let copy = shadow_copy(library)?;
            let loaded = LoadedLibrary::open(&copy).map_err(load_error(&library.display().to_string()))?;
            layers.push(Layer {
                kind: LayerKind::CompiledOutput,
                libraries: vec![Arc::new(loaded)],
            });
            shadow = Some(copy);
        }

        if let Some(runtime_dir) = self.runtime_dir {
            layers.push(Layer {
                kind: LayerKind::Runtime,
                libraries: open_all(helpers::visible_entries(runtime_dir))?,
            });
        }

        let addition_files = self
            .additions
            .iter()
            .flat_map(|addition| {
                if addition.is_dir() {
                    helpers::visible_entries(addition)
                } else {
                    vec![addition.clone()]
                }
            })
            .collect();
        layers.push(Layer {
            kind: LayerKind::ClasspathAddition,
            libraries: open_all(addition_files)?,
        });

        log::debug!(
            "Built loader for '{}' with {} layers",
            self.unit_id,
            layers.len()
        );

        Ok(LoadContext {
            unit_id: self.unit_id.to_string(),
            layers,
            shadow,
        })
    }
}

fn load_error(what: &str) -> impl Fn(libloading::Error) -> SetupError + '_ {
    move |e| SetupError::Load(format!("Could not load {what}: {e}"))
}

fn open_all(files: Vec<PathBuf>) -> Result<Vec<Arc<LoadedLibrary>>, SetupError> {
    files
        .into_iter()
        .filter(|file| file.is_file() && helpers::is_dynamic_library(file))
        .map(|file| {
            LoadedLibrary::open_global(&file)
                .map(Arc::new)
                .map_err(|e| SetupError::Load(format!("Could not load {}: {e}", file.display())))
        })
        .collect()
}

/// Copies the compiled library to a fresh temporary file so every run opens
/// a new handle, even when the dynamic loader still holds a previous one.
fn shadow_copy(library: &Path) -> Result<TempPath, SetupError> {
    let copy = tempfile::Builder::new()
        .prefix("liveplug-")
        .suffix(DLL_SUFFIX)
        .tempfile()
        .map_err(|e| SetupError::Io(format!("Could not create a shadow copy of {}: {e}", library.display())))?
        .into_temp_path();
    fs::copy(library, &copy)
        .map_err(|e| SetupError::Load(format!("Could not copy {}: {e}", library.display())))?;
    Ok(copy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_addition_fails_before_loading() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("gone.so");
        let additions = vec![dir.path().to_path_buf(), gone.clone()];

        let result = LoaderBuilder::new("hello").additions(&additions).build();
        assert_eq!(result.err(), Some(SetupError::MissingClasspathFile(gone)));
    }

    #[test]
    fn layers_are_ordered_parent_first() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a library").unwrap();
        let additions = vec![dir.path().join("notes.txt")];
        let modules = vec![Arc::new(ModuleLoader {
            id: "host.vcs".to_string(),
            libraries: vec![],
        })];

        let context = LoaderBuilder::new("hello")
            .modules(modules)
            .runtime_dir(dir.path())
            .additions(&additions)
            .build()
            .unwrap();
        assert_eq!(
            context.layer_kinds(),
            vec![
                LayerKind::HostModule("host.vcs".to_string()),
                LayerKind::Engine,
                LayerKind::Runtime,
                LayerKind::ClasspathAddition,
            ]
        );
        assert!(context.shadow_path().is_none());
    }

    #[test]
    fn unknown_symbols_are_not_found() {
        let context = LoaderBuilder::new("hello").build().unwrap();
        let symbol = unsafe { context.symbol::<extern "C" fn()>(b"liveplug_missing_symbol\0") };
        assert!(symbol.is_none());
        let symbol = unsafe { context.output_symbol::<extern "C" fn()>(b"liveplug_missing_symbol\0") };
        assert!(symbol.is_none());
    }
}
