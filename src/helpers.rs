use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::ffi::OsStr;
use std::fs;
use std::path::{Component, Path, PathBuf};

pub mod emojis {
    use console::Emoji;
    pub static SPARKLES: Emoji<'_, '_> = Emoji("✨ ", "");
    pub static LINE_CLEAR: &str = "\x1b[2K\r";
    pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "");
    pub static WARNING: Emoji<'_, '_> = Emoji("⚠️  ", "");
    pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
    pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "");
    pub static RECYCLE: Emoji<'_, '_> = Emoji("♻️  ", "");
}

pub trait StrippedVerbatimPath {
    fn to_stripped_verbatim_path(self) -> PathBuf;
}

impl StrippedVerbatimPath for PathBuf {
    fn to_stripped_verbatim_path(self) -> PathBuf {
        if cfg!(not(target_os = "windows")) {
            return self;
        }

        let mut stripped = PathBuf::new();
        for component in self.components() {
            if let Component::Prefix(prefix_component) = component {
                if prefix_component.kind().is_verbatim() {
                    stripped.push(
                        prefix_component
                            .as_os_str()
                            .to_string_lossy()
                            .strip_prefix("\\\\?\\")
                            .unwrap_or_default(),
                    );
                } else {
                    stripped.push(prefix_component.as_os_str());
                }
            } else {
                stripped.push(component);
            }
        }
        stripped
    }
}

/// Absolute form of `path`. Falls back to joining onto the working directory
/// when the path does not exist yet.
pub fn get_abs_path(path: &Path) -> PathBuf {
    match path.canonicalize() {
        Ok(canonical) => canonical.to_stripped_verbatim_path(),
        Err(_) if path.is_absolute() => path.to_path_buf(),
        Err(_) => std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf()),
    }
}

pub fn is_hidden(name: &OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

pub fn is_dynamic_library(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("so" | "dylib" | "dll")
    )
}

/// Platform file name of a dynamic library built from crate `name`.
pub fn library_file_name(name: &str) -> String {
    format!("{DLL_PREFIX}{name}{DLL_SUFFIX}")
}

/// Turns an arbitrary unit id into something usable as a crate name.
pub fn sanitize_identifier(id: &str) -> String {
    let mut sanitized: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if sanitized.is_empty() || sanitized.starts_with(|c: char| c.is_ascii_digit()) {
        sanitized.insert(0, '_');
    }
    sanitized
}

/// Crate name encoded in an rlib file name, `libfoo-1a2b3c.rlib` -> `foo`.
pub fn rlib_crate_name(path: &Path) -> Option<String> {
    if path.extension().and_then(|ext| ext.to_str()) != Some("rlib") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let stem = stem.strip_prefix("lib").unwrap_or(stem);
    let name = stem.split('-').next().unwrap_or(stem);
    if name.is_empty() { None } else { Some(name.to_string()) }
}

/// Sorted entries of `dir`, skipping anything hidden. A missing directory
/// yields nothing.
pub fn visible_entries(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return vec![];
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|entry| !is_hidden(&entry.file_name()))
        .map(|entry| entry.path())
        .collect();
    paths.sort();
    paths
}

/// Removes a directory tree, treating "already gone" as success.
pub fn remove_dir_if_exists(dir: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
