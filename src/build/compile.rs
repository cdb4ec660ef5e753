use crate::error::SetupError;
use crate::helpers;
use ahash::{AHashMap, AHashSet};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Crate root generated next to the compiled library.
pub const WRAPPER_FILE_NAME: &str = ".liveplug-entry.rs";
pub const RUSTC_ENV: &str = "LIVEPLUG_RUSTC";

/// Variables the compiler process may see. Everything else is dropped.
const PASSTHROUGH_ENV: &[&str] = &[
    "PATH",
    "HOME",
    "USERPROFILE",
    "RUSTUP_HOME",
    "RUSTUP_TOOLCHAIN",
    "CARGO_HOME",
    "TMPDIR",
    "TEMP",
    "TMP",
    "SYSTEMROOT",
    "SystemRoot",
    "LANG",
    "LD_LIBRARY_PATH",
    "DYLD_FALLBACK_LIBRARY_PATH",
    "SDKROOT",
    "MACOSX_DEPLOYMENT_TARGET",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerSettings {
    pub rustc: PathBuf,
    pub edition: String,
    pub flags: Vec<String>,
    pub env: AHashMap<String, String>,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        CompilerSettings {
            rustc: default_rustc(),
            edition: "2021".to_string(),
            flags: vec![],
            env: AHashMap::new(),
        }
    }
}

impl CompilerSettings {
    /// Stable text covering every setting that changes the compiled output.
    pub fn fingerprint(&self) -> String {
        let mut env: Vec<(&String, &String)> = self.env.iter().collect();
        env.sort();
        let mut lines = vec![
            format!("rustc={}", self.rustc.display()),
            format!("edition={}", self.edition),
        ];
        lines.extend(self.flags.iter().map(|flag| format!("flag={flag}")));
        lines.extend(env.into_iter().map(|(key, value)| format!("env={key}={value}")));
        lines.join("\n")
    }
}

pub fn default_rustc() -> PathBuf {
    std::env::var_os(RUSTC_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("rustc"))
}

pub struct CompileRequest<'a> {
    pub unit_id: &'a str,
    pub entry_file: &'a Path,
    pub source_dir: &'a Path,
    pub output_dir: &'a Path,
    pub runtime_file: &'a Path,
    pub classpath: &'a [PathBuf],
}

#[derive(Debug)]
pub struct CompileOutput {
    pub library: PathBuf,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    Io(String),
    Compilation(Vec<String>),
    Internal(String),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CompileError::Io(e) => write!(f, "{e}"),
            CompileError::Compilation(errors) => write!(f, "{}", errors.join("\n")),
            CompileError::Internal(e) => write!(f, "{e}"),
        }
    }
}

impl From<CompileError> for SetupError {
    fn from(e: CompileError) -> Self {
        match e {
            CompileError::Io(e) => SetupError::CompilerIo(e),
            CompileError::Compilation(errors) => SetupError::Compilation(errors),
            CompileError::Internal(e) => SetupError::CompilerInternal(e),
        }
    }
}

pub fn crate_name(unit_id: &str) -> String {
    format!("liveplug_{}", helpers::sanitize_identifier(unit_id))
}

pub fn library_path(output_dir: &Path, unit_id: &str) -> PathBuf {
    output_dir.join(helpers::library_file_name(&crate_name(unit_id)))
}

fn rust_string_literal(path: &Path) -> String {
    format!("{:?}", path.to_string_lossy())
}

/// Crate root that mounts the runtime support and the script entry file.
pub fn wrapper_source(runtime_file: &Path, entry_file: &Path) -> String {
    format!(
        "// @generated by liveplug. Do not edit.
#![allow(dead_code, unused_imports)]

#[path = {runtime}]
pub mod liveplug_runtime;
pub use liveplug_runtime::{{Binding, HostContext}};

#[path = {entry}]
mod script;
",
        runtime = rust_string_literal(runtime_file),
        entry = rust_string_literal(entry_file),
    )
}

/// Turns classpath entries into rustc search-path and extern arguments.
pub fn classpath_args(entries: &[PathBuf]) -> Vec<String> {
    let mut args = vec![];
    let mut seen: AHashSet<String> = AHashSet::new();
    let mut push_pair = |args: &mut Vec<String>, flag: &str, value: String| {
        if seen.insert(format!("{flag} {value}")) {
            args.push(flag.to_string());
            args.push(value);
        }
    };

    for entry in entries {
        if entry.is_dir() {
            push_pair(&mut args, "-L", format!("dependency={}", entry.display()));
            continue;
        }
        let parent = entry.parent().unwrap_or(Path::new("."));
        if let Some(name) = helpers::rlib_crate_name(entry) {
            push_pair(&mut args, "--extern", format!("{name}={}", entry.display()));
            push_pair(&mut args, "-L", format!("dependency={}", parent.display()));
        } else if helpers::is_dynamic_library(entry) {
            push_pair(&mut args, "-L", format!("native={}", parent.display()));
            if cfg!(unix) {
                push_pair(&mut args, "-C", format!("link-arg=-Wl,-rpath,{}", parent.display()));
            }
        }
    }
    args
}

pub fn compiler_args(settings: &CompilerSettings, request: &CompileRequest, wrapper: &Path) -> Vec<String> {
    let mut args = vec![
        format!("--edition={}", settings.edition),
        "--crate-type=cdylib".to_string(),
        format!("--crate-name={}", crate_name(request.unit_id)),
        "--error-format=json".to_string(),
        "-o".to_string(),
        library_path(request.output_dir, request.unit_id)
            .to_string_lossy()
            .to_string(),
    ];
    args.extend(classpath_args(request.classpath));
    args.extend(settings.flags.iter().cloned());
    args.push(wrapper.to_string_lossy().to_string());
    args
}

fn isolated_environment(settings: &CompilerSettings) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = PASSTHROUGH_ENV
        .iter()
        .filter_map(|name| std::env::var(name).ok().map(|value| (name.to_string(), value)))
        .collect();
    env.extend(settings.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

#[derive(Deserialize)]
struct RawDiagnostic {
    #[serde(rename = "$message_type")]
    message_type: Option<String>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    level: String,
    rendered: Option<String>,
}

/// Compiler diagnostics sorted by severity. Only `errors` fail a compile.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub internal: Vec<String>,
    pub unparsed: Vec<String>,
}

impl Diagnostics {
    pub fn parse(stderr: &str) -> Diagnostics {
        let mut diagnostics = Diagnostics::default();
        for line in stderr.lines() {
            let parsed = if line.starts_with('{') {
                serde_json::from_str::<RawDiagnostic>(line).ok()
            } else {
                None
            };
            let Some(diagnostic) = parsed else {
                if !line.trim().is_empty() {
                    diagnostics.unparsed.push(line.to_string());
                }
                continue;
            };
            if diagnostic
                .message_type
                .as_deref()
                .is_some_and(|kind| kind != "diagnostic")
            {
                continue;
            }
            let text = diagnostic
                .rendered
                .unwrap_or_else(|| diagnostic.message.clone())
                .trim_end()
                .to_string();
            match diagnostic.level.as_str() {
                "error" if diagnostic.message.starts_with("aborting due to") => (),
                "error" => diagnostics.errors.push(text),
                level if level.starts_with("error: internal compiler error") => {
                    diagnostics.internal.push(text)
                }
                "warning" => diagnostics.warnings.push(text),
                _ => (),
            }
        }
        diagnostics
    }
}

/// Decides the outcome of a finished compiler process.
fn classify(success: bool, exit_code: Option<i32>, diagnostics: Diagnostics) -> Result<Vec<String>, CompileError> {
    if !diagnostics.internal.is_empty() {
        return Err(CompileError::Internal(diagnostics.internal.join("\n")));
    }
    if success {
        return Ok(diagnostics.warnings);
    }
    if !diagnostics.errors.is_empty() {
        return Err(CompileError::Compilation(diagnostics.errors));
    }
    let detail = if diagnostics.unparsed.is_empty() {
        String::from("no diagnostics were reported")
    } else {
        diagnostics.unparsed.join("\n")
    };
    Err(match exit_code {
        Some(code) => CompileError::Internal(format!("compiler exited with code {code}: {detail}")),
        None => CompileError::Internal(format!("compiler was terminated: {detail}")),
    })
}

/// Compiles one script unit in a separate rustc process. The output
/// directory is recreated first and removed again if anything fails.
pub fn compile(settings: &CompilerSettings, request: &CompileRequest) -> Result<CompileOutput, CompileError> {
    let _span = tracing::info_span!("script.compile", unit = %request.unit_id).entered();

    let result = run_compiler(settings, request);
    if result.is_err() {
        let _ = helpers::remove_dir_if_exists(request.output_dir);
    }
    result
}

fn run_compiler(settings: &CompilerSettings, request: &CompileRequest) -> Result<CompileOutput, CompileError> {
    helpers::remove_dir_if_exists(request.output_dir)
        .and_then(|_| fs::create_dir_all(request.output_dir))
        .map_err(|e| {
            CompileError::Io(format!(
                "Could not prepare output directory {}: {e}",
                request.output_dir.display()
            ))
        })?;

    let wrapper = request.output_dir.join(WRAPPER_FILE_NAME);
    fs::write(&wrapper, wrapper_source(request.runtime_file, request.entry_file))
        .map_err(|e| CompileError::Io(format!("Could not write {}: {e}", wrapper.display())))?;

    let args = compiler_args(settings, request, &wrapper);
    log::debug!("{} {}", settings.rustc.display(), args.join(" "));

    let output = Command::new(&settings.rustc)
        .env_clear()
        .envs(isolated_environment(settings))
        .current_dir(request.source_dir)
        .args(&args)
        .output()
        .map_err(|e| CompileError::Io(format!("Could not start {}: {e}", settings.rustc.display())))?;

    let diagnostics = Diagnostics::parse(&String::from_utf8_lossy(&output.stderr));
    for warning in &diagnostics.warnings {
        log::debug!("{}: {warning}", request.unit_id);
    }
    let warnings = classify(output.status.success(), output.status.code(), diagnostics)?;

    let library = library_path(request.output_dir, request.unit_id);
    if !library.exists() {
        return Err(CompileError::Internal(format!(
            "compiler reported success but {} is missing",
            library.display()
        )));
    }
    Ok(CompileOutput { library, warnings })
}
