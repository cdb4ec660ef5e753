use crate::binding::Binding;
use crate::build::cache;
use crate::build::compile::{self, CompileRequest};
use crate::build::loader::{LoadContext, LoaderBuilder};
use crate::deps::{self, ResolvedDependencies};
use crate::error::{RunningError, SetupError};
use crate::host::{HostServices, RUNTIME_SUPPORT_SOURCE};
use crate::report::{ScriptEvent, ScriptReporter};
use crate::script::{Language, ScriptUnit};
use anyhow::anyhow;
use std::ffi::{CStr, CString, c_char, c_void};
use std::path::{Path, PathBuf};
use std::ptr;

pub const ENTRY_SYMBOL: &[u8] = b"liveplug_entry\0";
pub const DISPOSE_SYMBOL: &[u8] = b"liveplug_dispose\0";
pub const FREE_ERROR_SYMBOL: &[u8] = b"liveplug_free_error\0";

/// Must match `BACKTRACE_MARKER` in the runtime support source.
const BACKTRACE_MARKER: &str = "\nstack backtrace:\n";

type EntryFn = unsafe extern "C" fn(*const RawBinding, *mut *mut c_char) -> *mut c_void;
type DisposeFn = unsafe extern "C" fn(*mut c_void, *mut *mut c_char) -> bool;
type FreeErrorFn = unsafe extern "C" fn(*mut c_char);

/// Mirrors `RawBinding` in the runtime support source.
#[repr(C)]
struct RawBinding {
    is_host_startup: bool,
    context_name: *const c_char,
    context_path: *const c_char,
    script_path: *const c_char,
    script_id: *const c_char,
}

/// Owns the strings a `RawBinding` points into.
struct BindingStrings {
    context_name: Option<CString>,
    context_path: Option<CString>,
    script_path: CString,
    script_id: CString,
}

fn c_string(value: &str) -> Result<CString, RunningError> {
    CString::new(value).map_err(|_| RunningError::Instantiation(format!("'{value}' contains a NUL byte")))
}

impl BindingStrings {
    fn new(binding: &Binding) -> Result<BindingStrings, RunningError> {
        let (context_name, context_path) = match &binding.context {
            Some(context) => (
                Some(c_string(&context.name)?),
                Some(c_string(&context.base_path.to_string_lossy())?),
            ),
            None => (None, None),
        };
        Ok(BindingStrings {
            context_name,
            context_path,
            script_path: c_string(&binding.script_path.to_string_lossy())?,
            script_id: c_string(&binding.unit_id)?,
        })
    }

    fn raw(&self, is_host_startup: bool) -> RawBinding {
        RawBinding {
            is_host_startup,
            context_name: self.context_name.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
            context_path: self.context_path.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
            script_path: self.script_path.as_ptr(),
            script_id: self.script_id.as_ptr(),
        }
    }
}

/// A compiled and loaded script library with its entry points resolved.
pub struct NativeArtifact {
    unit_id: String,
    context: LoadContext,
    entry: EntryFn,
    dispose: DisposeFn,
    free_error: FreeErrorFn,
}

impl NativeArtifact {
    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    pub fn load_context(&self) -> &LoadContext {
        &self.context
    }
}

/// Classpath handed to the compiler: runtime dir, module libraries,
/// directive additions and the unit itself.
fn compiler_classpath(services: &HostServices, deps: &ResolvedDependencies, unit: &ScriptUnit) -> Vec<PathBuf> {
    let mut classpath = vec![services.paths.runtime_dir.clone()];
    for module in &deps.modules {
        classpath.extend(module.library_files());
    }
    classpath.extend(deps.classpath.iter().cloned());
    classpath.push(unit.path.clone());
    classpath
}

pub fn setup<R: ScriptReporter + ?Sized>(
    unit: &ScriptUnit,
    entry_file: &Path,
    source: &str,
    services: &HostServices,
    reporter: &R,
) -> Result<NativeArtifact, SetupError> {
    let deps = deps::resolve(unit, Language::Native, source, services)?;
    let module_loaders = deps
        .modules
        .iter()
        .map(|module| services.modules.loader(module).map_err(SetupError::Load))
        .collect::<Result<Vec<_>, _>>()?;

    let output_dir = cache::output_dir(&services.paths.cache_dir, unit);
    let library = compile::library_path(&output_dir, &unit.id);
    let fingerprint = services.compiler.fingerprint();
    let inputs: [&[u8]; 2] = [RUNTIME_SUPPORT_SOURCE.as_bytes(), fingerprint.as_bytes()];
    let status = cache::check(&unit.path, &output_dir, Language::Native.extension(), &inputs)
        .map_err(|e| SetupError::Io(format!("Could not hash sources of {}: {e}", unit.id)))?;

    if status.is_fresh() && library.exists() {
        log::debug!("{} is up to date", unit.id);
        reporter.report(ScriptEvent::UpToDate {
            unit_id: unit.id.clone(),
        });
    } else {
        reporter.report(ScriptEvent::Compiling {
            unit_id: unit.id.clone(),
        });
        let runtime_file = services
            .install_runtime()
            .map_err(|e| SetupError::Io(format!("Could not install runtime support: {e}")))?;
        let classpath = compiler_classpath(services, &deps, unit);
        let output = compile::compile(
            &services.compiler,
            &CompileRequest {
                unit_id: &unit.id,
                entry_file,
                source_dir: &unit.path,
                output_dir: &output_dir,
                runtime_file: &runtime_file,
                classpath: &classpath,
            },
        )?;
        for message in output.warnings {
            reporter.report(ScriptEvent::CompilerWarning {
                unit_id: unit.id.clone(),
                message,
            });
        }
        cache::update(&output_dir, status.hash())
            .map_err(|e| SetupError::Io(format!("Could not record source hash: {e}")))?;
    }

    let context = LoaderBuilder::new(&unit.id)
        .modules(module_loaders)
        .output_library(&library)
        .runtime_dir(&services.paths.runtime_dir)
        .additions(&deps.classpath)
        .build()?;

    let missing = |name: &str| SetupError::Load(format!("{} does not export {name}", library.display()));
    let entry = unsafe { context.output_symbol::<EntryFn>(ENTRY_SYMBOL) }.ok_or_else(|| missing("liveplug_entry"))?;
    let dispose =
        unsafe { context.output_symbol::<DisposeFn>(DISPOSE_SYMBOL) }.ok_or_else(|| missing("liveplug_dispose"))?;
    let free_error = unsafe { context.output_symbol::<FreeErrorFn>(FREE_ERROR_SYMBOL) }
        .ok_or_else(|| missing("liveplug_free_error"))?;

    Ok(NativeArtifact {
        unit_id: unit.id.clone(),
        context,
        entry,
        dispose,
        free_error,
    })
}

fn strip_symbol_hash(symbol: &str) -> &str {
    match symbol.rsplit_once("::h") {
        Some((name, hash)) if hash.len() == 16 && hash.chars().all(|c| c.is_ascii_hexdigit()) => name,
        _ => symbol,
    }
}

/// Frames of the script module, one `at symbol (location)` line each.
fn script_frames(trace: &str) -> Vec<String> {
    let mut frames: Vec<String> = vec![];
    let mut keep = false;
    for line in trace.lines().map(str::trim) {
        if let Some(location) = line.strip_prefix("at ") {
            if keep && let Some(frame) = frames.last_mut() {
                frame.push_str(&format!(" ({location})"));
            }
            continue;
        }
        keep = match line.split_once(": ") {
            Some((index, symbol)) if index.parse::<usize>().is_ok() => {
                let symbol = strip_symbol_hash(symbol);
                let is_script = symbol.contains("::script::");
                if is_script {
                    frames.push(format!("    at {symbol}"));
                }
                is_script
            }
            _ => false,
        };
    }
    frames
}

/// Replaces a raw backtrace appended by the runtime with the script's frames.
fn normalize_error(message: String) -> String {
    let Some((head, trace)) = message.split_once(BACKTRACE_MARKER) else {
        return message;
    };
    let frames = script_frames(trace);
    if frames.is_empty() {
        head.to_string()
    } else {
        format!("{head}\n{}", frames.join("\n"))
    }
}

/// Takes ownership of an error string written by the script library.
unsafe fn take_error(error: *mut c_char, free_error: FreeErrorFn) -> Option<String> {
    if error.is_null() {
        return None;
    }
    let message = unsafe { CStr::from_ptr(error) }.to_string_lossy().into_owned();
    unsafe { free_error(error) };
    Some(normalize_error(message))
}

struct Instance(*mut c_void);

pub fn run(artifact: NativeArtifact, binding: &Binding) -> Result<(), RunningError> {
    let NativeArtifact {
        unit_id,
        context,
        entry,
        dispose,
        free_error,
    } = artifact;

    let strings = BindingStrings::new(binding)?;
    let raw = strings.raw(binding.is_host_startup);
    let mut error: *mut c_char = ptr::null_mut();
    let instance = unsafe { entry(&raw, &mut error) };
    if instance.is_null() {
        let message = unsafe { take_error(error, free_error) }
            .unwrap_or_else(|| format!("{unit_id} returned no instance"));
        return Err(RunningError::Instantiation(message));
    }

    let instance = Instance(instance);
    binding
        .disposable
        .child("instance")
        .set_teardown(move || {
            let mut error: *mut c_char = ptr::null_mut();
            let disposed = unsafe { dispose(instance.0, &mut error) };
            let message = unsafe { take_error(error, free_error) };
            // The library must outlive the instance it created.
            drop(context);
            if disposed {
                Ok(())
            } else {
                Err(anyhow!(message.unwrap_or_else(|| format!("{unit_id} failed to unload"))))
            }
        })
        .map_err(|e| RunningError::Disposal(e.to_string()))
}
