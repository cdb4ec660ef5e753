pub mod directives;

use crate::error::SetupError;
use crate::helpers;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// One script: a directory under the scripts dir, identified by its name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptUnit {
    pub id: String,
    pub path: PathBuf,
}

impl ScriptUnit {
    pub fn new(path: impl Into<PathBuf>) -> ScriptUnit {
        let path = path.into();
        let id = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        ScriptUnit { id, path }
    }

    /// All unit directories directly inside `scripts_dir`, sorted by id.
    pub fn discover(scripts_dir: &Path) -> io::Result<Vec<ScriptUnit>> {
        if !scripts_dir.exists() {
            return Ok(vec![]);
        }
        let mut units: Vec<ScriptUnit> = std::fs::read_dir(scripts_dir)?
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter(|entry| !helpers::is_hidden(&entry.file_name()))
            .map(|entry| ScriptUnit::new(helpers::get_abs_path(&entry.path())))
            .collect();
        units.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(units)
    }

    pub fn find(scripts_dir: &Path, id: &str) -> Option<ScriptUnit> {
        let path = scripts_dir.join(id);
        if path.is_dir() {
            Some(ScriptUnit::new(helpers::get_abs_path(&path)))
        } else {
            None
        }
    }

    /// First language whose entry file for `kind` exists in the unit.
    pub fn detect_entry(&self, kind: EntryKind) -> Result<(Language, PathBuf), SetupError> {
        Language::ALL
            .iter()
            .map(|language| (*language, self.path.join(language.entry_file_name(kind))))
            .find(|(_, file)| file.is_file())
            .ok_or_else(|| SetupError::NoEntryScript {
                dir: self.path.clone(),
                tried: Language::entry_file_names(kind),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryKind {
    Main,
    Test,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EntryKind::Main => write!(f, "main"),
            EntryKind::Test => write!(f, "test"),
        }
    }
}

/// Script flavours the engine knows how to run. `Native` scripts are Rust
/// sources compiled into a dynamic library; `Rhai` scripts are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Native,
    Rhai,
}

impl Language {
    pub const ALL: [Language; 2] = [Language::Native, Language::Rhai];

    pub fn entry_file_name(self, kind: EntryKind) -> &'static str {
        match (self, kind) {
            (Language::Native, EntryKind::Main) => "plugin.rs",
            (Language::Native, EntryKind::Test) => "plugin-test.rs",
            (Language::Rhai, EntryKind::Main) => "plugin.rhai",
            (Language::Rhai, EntryKind::Test) => "plugin-test.rhai",
        }
    }

    pub fn entry_file_names(kind: EntryKind) -> Vec<String> {
        Language::ALL
            .iter()
            .map(|language| language.entry_file_name(kind).to_string())
            .collect()
    }

    /// Extension of every source file that belongs to a unit of this language.
    pub fn extension(self) -> &'static str {
        match self {
            Language::Native => "rs",
            Language::Rhai => "rhai",
        }
    }

    pub fn line_comment(self) -> &'static str {
        "//"
    }

    pub fn classpath_prefix(self) -> String {
        format!("{} {} ", self.line_comment(), directives::ADD_TO_CLASSPATH)
    }

    pub fn module_prefix(self) -> String {
        format!("{} {} ", self.line_comment(), directives::DEPENDS_ON_PLUGIN)
    }

    pub fn requires_compilation(self) -> bool {
        matches!(self, Language::Native)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Language::Native => write!(f, "rust"),
            Language::Rhai => write!(f, "rhai"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn unit_with(files: &[&str]) -> (tempfile::TempDir, ScriptUnit) {
        let dir = tempfile::tempdir().unwrap();
        let unit_dir = dir.path().join("hello");
        fs::create_dir(&unit_dir).unwrap();
        for file in files {
            fs::write(unit_dir.join(file), "").unwrap();
        }
        (dir, ScriptUnit::new(unit_dir))
    }

    #[test]
    fn id_is_the_directory_name() {
        assert_eq!(ScriptUnit::new("/scripts/my-script").id, "my-script");
    }

    #[test]
    fn missing_entry_lists_every_file_name_tried() {
        let (_dir, unit) = unit_with(&["notes.txt"]);
        match unit.detect_entry(EntryKind::Main) {
            Err(SetupError::NoEntryScript { tried, .. }) => {
                assert_eq!(tried, vec!["plugin.rs", "plugin.rhai"])
            }
            other => panic!("expected NoEntryScript, got {other:?}"),
        }
    }

    #[test]
    fn native_entry_takes_precedence() {
        let (_dir, unit) = unit_with(&["plugin.rhai", "plugin.rs"]);
        let (language, file) = unit.detect_entry(EntryKind::Main).unwrap();
        assert_eq!(language, Language::Native);
        assert!(file.ends_with("plugin.rs"));
    }

    #[test]
    fn test_entry_is_selected_by_kind() {
        let (_dir, unit) = unit_with(&["plugin.rhai", "plugin-test.rhai"]);
        let (language, file) = unit.detect_entry(EntryKind::Test).unwrap();
        assert_eq!(language, Language::Rhai);
        assert!(file.ends_with("plugin-test.rhai"));
    }

    #[test]
    fn discover_lists_unit_directories_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["zeta", "alpha", ".hidden"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        fs::write(dir.path().join("stray.rs"), "").unwrap();

        let ids: Vec<_> = ScriptUnit::discover(dir.path())
            .unwrap()
            .into_iter()
            .map(|unit| unit.id)
            .collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
        assert!(ScriptUnit::discover(&dir.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn directive_prefixes() {
        assert_eq!(Language::Native.classpath_prefix(), "// add-to-classpath ");
        assert_eq!(Language::Rhai.module_prefix(), "// depends-on-plugin ");
    }
}
