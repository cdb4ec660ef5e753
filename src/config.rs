use crate::build::compile::{self, CompilerSettings};
use crate::host::HostPaths;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "liveplug.json";

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CompilerConfig {
    /// Compiler binary. `LIVEPLUG_RUSTC` takes precedence.
    pub rustc: Option<PathBuf>,
    pub edition: String,
    pub flags: Vec<String>,
    /// Extra variables for the compiler process, on top of the allow-list.
    pub env: BTreeMap<String, String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            rustc: None,
            edition: "2021".to_string(),
            flags: vec![],
            env: BTreeMap::new(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub scripts_dir: PathBuf,
    pub modules_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub runtime_dir: PathBuf,
    pub compiler: CompilerConfig,
    /// Units run with `is_host_startup` when the host starts.
    pub run_on_startup: Vec<String>,
    pub disabled_modules: Vec<String>,
    /// Extra placeholder values for classpath directives.
    pub environment: BTreeMap<String, String>,
    pub workers: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            scripts_dir: PathBuf::from("scripts"),
            modules_dir: PathBuf::from("modules"),
            cache_dir: PathBuf::from(".liveplug/cache"),
            runtime_dir: PathBuf::from(".liveplug/runtime"),
            compiler: CompilerConfig::default(),
            run_on_startup: vec![],
            disabled_modules: vec![],
            environment: BTreeMap::new(),
            workers: None,
        }
    }
}

impl Config {
    pub fn new(path: &Path) -> Result<Config> {
        let contents = fs::read_to_string(path)
            .map_err(|e| anyhow!("Could not read {}: {}", path.display(), e))?;
        Config::parse(&contents).map_err(|e| anyhow!("Could not parse {}: {}", path.display(), e))
    }

    pub fn parse(contents: &str) -> Result<Config> {
        Ok(serde_json::from_str(contents)?)
    }

    /// Reads `liveplug.json` from `folder`, or the defaults when there is none.
    pub fn read(folder: &Path) -> Result<Config> {
        let path = folder.join(CONFIG_FILE_NAME);
        if path.exists() {
            Config::new(&path)
        } else {
            log::debug!("No {CONFIG_FILE_NAME} in {}, using defaults", folder.display());
            Ok(Config::default())
        }
    }

    pub fn paths(&self, root: &Path) -> HostPaths {
        HostPaths {
            scripts_dir: root.join(&self.scripts_dir),
            modules_dir: root.join(&self.modules_dir),
            cache_dir: root.join(&self.cache_dir),
            runtime_dir: root.join(&self.runtime_dir),
        }
    }

    pub fn compiler_settings(&self, root: &Path) -> CompilerSettings {
        let rustc = match (std::env::var_os(compile::RUSTC_ENV), &self.compiler.rustc) {
            (Some(from_env), _) => PathBuf::from(from_env),
            (None, Some(configured)) if configured.components().count() > 1 => root.join(configured),
            (None, Some(configured)) => configured.clone(),
            (None, None) => compile::default_rustc(),
        };
        CompilerSettings {
            rustc,
            edition: self.compiler.edition.clone(),
            flags: self.compiler.flags.clone(),
            env: self.compiler.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers.filter(|n| *n > 0).unwrap_or_else(num_cpus::get)
    }
}
