use crate::helpers;
use crate::script::ScriptUnit;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const HASH_FILE_NAME: &str = ".source-hash";

/// Content hash of every source file of one unit, together with the other
/// inputs that decide what the compiler produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceHash(blake3::Hash);

impl SourceHash {
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }
}

impl fmt::Display for SourceHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.to_hex())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Fresh(SourceHash),
    Stale(SourceHash),
}

impl CacheStatus {
    pub fn is_fresh(&self) -> bool {
        matches!(self, CacheStatus::Fresh(_))
    }

    pub fn hash(&self) -> SourceHash {
        match self {
            CacheStatus::Fresh(hash) | CacheStatus::Stale(hash) => *hash,
        }
    }
}

/// Files with `extension` under `source_dir`, recursively, as
/// `(relative name, absolute path)` sorted by name. Hidden entries are skipped.
fn source_files(source_dir: &Path, extension: &str) -> io::Result<Vec<(String, PathBuf)>> {
    let mut files = vec![];
    let mut to_visit = vec![source_dir.to_path_buf()];
    while let Some(dir) = to_visit.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if helpers::is_hidden(&entry.file_name()) {
                continue;
            }
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                to_visit.push(path);
            } else if path.extension().and_then(|ext| ext.to_str()) == Some(extension) {
                let relative = path
                    .strip_prefix(source_dir)
                    .unwrap_or(&path)
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push((relative, path));
            }
        }
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

/// `inputs` are hashed ahead of the sources, e.g. the runtime support source
/// and the compiler settings.
pub fn source_hash(source_dir: &Path, extension: &str, inputs: &[&[u8]]) -> io::Result<SourceHash> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(inputs.len() as u64).to_le_bytes());
    for input in inputs {
        hasher.update(&(input.len() as u64).to_le_bytes());
        hasher.update(input);
    }
    for (name, path) in source_files(source_dir, extension)? {
        let contents = fs::read(&path)?;
        hasher.update(&(name.len() as u64).to_le_bytes());
        hasher.update(name.as_bytes());
        hasher.update(&(contents.len() as u64).to_le_bytes());
        hasher.update(&contents);
    }
    Ok(SourceHash(hasher.finalize()))
}

fn read_recorded_hash(output_dir: &Path) -> Option<String> {
    let contents = fs::read_to_string(output_dir.join(HASH_FILE_NAME)).ok()?;
    Some(contents.trim().to_owned())
}

/// Compares the sources against the hash recorded by the last compile.
pub fn check(source_dir: &Path, output_dir: &Path, extension: &str, inputs: &[&[u8]]) -> io::Result<CacheStatus> {
    let current = source_hash(source_dir, extension, inputs)?;
    Ok(match read_recorded_hash(output_dir) {
        Some(recorded) if recorded == current.to_hex() => CacheStatus::Fresh(current),
        _ => CacheStatus::Stale(current),
    })
}

pub fn needs_update(source_dir: &Path, output_dir: &Path, extension: &str, inputs: &[&[u8]]) -> bool {
    check(source_dir, output_dir, extension, inputs)
        .map(|status| !status.is_fresh())
        .unwrap_or(true)
}

pub fn update(output_dir: &Path, hash: SourceHash) -> io::Result<()> {
    fs::create_dir_all(output_dir)?;
    fs::write(output_dir.join(HASH_FILE_NAME), format!("{hash}\n"))
}

/// `<cache_dir>/<unit id>-<short hash of the unit path>`, so two units with
/// the same name in different folders never share output.
pub fn output_dir(cache_dir: &Path, unit: &ScriptUnit) -> PathBuf {
    let abs = helpers::get_abs_path(&unit.path);
    let path_hash = blake3::hash(abs.to_string_lossy().as_bytes()).to_hex();
    cache_dir.join(format!("{}-{}", unit.id, &path_hash[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("plugin.rs"), "pub fn main() {}").unwrap();
        fs::create_dir(dir.path().join("util")).unwrap();
        fs::write(dir.path().join("util/mod.rs"), "pub fn helper() {}").unwrap();
        dir
    }

    #[test]
    fn hash_is_stable_and_ignores_other_extensions() {
        let dir = unit_dir();
        let first = source_hash(dir.path(), "rs", &[]).unwrap();
        fs::write(dir.path().join("notes.txt"), "changes nothing").unwrap();
        assert_eq!(first, source_hash(dir.path(), "rs", &[]).unwrap());
    }

    #[test]
    fn single_byte_change_is_detected() {
        let dir = unit_dir();
        let before = source_hash(dir.path(), "rs", &[]).unwrap();
        fs::write(dir.path().join("util/mod.rs"), "pub fn helper() {}\n").unwrap();
        assert_ne!(before, source_hash(dir.path(), "rs", &[]).unwrap());
    }

    #[test]
    fn renaming_a_file_changes_the_hash() {
        let dir = unit_dir();
        let before = source_hash(dir.path(), "rs", &[]).unwrap();
        fs::rename(dir.path().join("util/mod.rs"), dir.path().join("util/other.rs")).unwrap();
        assert_ne!(before, source_hash(dir.path(), "rs", &[]).unwrap());
    }

    #[test]
    fn update_then_check_is_fresh_until_sources_change() {
        let dir = unit_dir();
        let out = tempfile::tempdir().unwrap();
        let output_dir = out.path().join("hello-12345678");

        assert!(needs_update(dir.path(), &output_dir, "rs", &[]));
        let status = check(dir.path(), &output_dir, "rs", &[]).unwrap();
        update(&output_dir, status.hash()).unwrap();
        assert!(!needs_update(dir.path(), &output_dir, "rs", &[]));
        assert!(!needs_update(dir.path(), &output_dir, "rs", &[]));

        fs::write(dir.path().join("plugin.rs"), "pub fn main() { }").unwrap();
        assert!(needs_update(dir.path(), &output_dir, "rs", &[]));
    }

    #[test]
    fn changed_build_inputs_make_the_output_stale() {
        let dir = unit_dir();
        let out = tempfile::tempdir().unwrap();
        let output_dir = out.path().join("hello-12345678");
        let runtime: &[u8] = b"pub struct RawBinding;";

        let status = check(dir.path(), &output_dir, "rs", &[runtime, b"--edition=2021"]).unwrap();
        update(&output_dir, status.hash()).unwrap();
        assert!(!needs_update(dir.path(), &output_dir, "rs", &[runtime, b"--edition=2021"]));
        assert!(needs_update(dir.path(), &output_dir, "rs", &[runtime, b"--edition=2024"]));
        assert!(needs_update(dir.path(), &output_dir, "rs", &[b"pub struct RawBinding(u8);", b"--edition=2021"]));
        assert!(needs_update(dir.path(), &output_dir, "rs", &[]));
    }

    #[test]
    fn inputs_are_not_confused_with_each_other() {
        let dir = unit_dir();
        assert_ne!(
            source_hash(dir.path(), "rs", &[b"ab", b"c"]).unwrap(),
            source_hash(dir.path(), "rs", &[b"a", b"bc"]).unwrap()
        );
    }

    #[test]
    fn output_dir_is_keyed_by_id_and_path() {
        let cache = Path::new("/cache");
        let a = output_dir(cache, &ScriptUnit::new("/one/hello"));
        let b = output_dir(cache, &ScriptUnit::new("/two/hello"));
        assert_ne!(a, b);
        let name = a.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("hello-"));
        assert_eq!(name.len(), "hello-".len() + 8);
    }
}
