//! Support code mounted into every compiled liveplug script as
//! `crate::liveplug_runtime`. The script module provides
//! `pub fn main(binding: &crate::Binding) -> T` for any `T: 'static`; the
//! returned value lives until the script is unloaded and is dropped then.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::ffi::{c_char, c_void, CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Once;

/// Separates a panic message from the backtrace in error strings.
pub const BACKTRACE_MARKER: &str = "\nstack backtrace:\n";

thread_local! {
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Must stay layout-compatible with the host's copy.
#[repr(C)]
pub struct RawBinding {
    pub is_host_startup: bool,
    pub context_name: *const c_char,
    pub context_path: *const c_char,
    pub script_path: *const c_char,
    pub script_id: *const c_char,
}

#[derive(Debug, Clone)]
pub struct HostContext {
    pub name: String,
    pub base_path: PathBuf,
}

/// What the host tells a script about the run it is part of.
#[derive(Debug, Clone)]
pub struct Binding {
    pub is_host_startup: bool,
    pub context: Option<HostContext>,
    pub script_path: PathBuf,
    pub script_id: String,
}

impl Binding {
    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    unsafe fn from_raw(raw: &RawBinding) -> Binding {
        let context = match unsafe { (read(raw.context_name), read(raw.context_path)) } {
            (Some(name), Some(path)) => Some(HostContext {
                name,
                base_path: PathBuf::from(path),
            }),
            _ => None,
        };
        Binding {
            is_host_startup: raw.is_host_startup,
            context,
            script_path: PathBuf::from(unsafe { read(raw.script_path) }.unwrap_or_default()),
            script_id: unsafe { read(raw.script_id) }.unwrap_or_default(),
        }
    }
}

unsafe fn read(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("script panicked")
    }
}

/// Replaces the default hook, which would print to the host's stderr, with
/// one that keeps the backtrace for the error string.
fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        panic::set_hook(Box::new(|_| {
            let trace = Backtrace::force_capture().to_string();
            LAST_BACKTRACE.with(|last| *last.borrow_mut() = Some(trace));
        }));
    });
}

fn panic_report(payload: Box<dyn Any + Send>) -> String {
    let message = panic_message(payload);
    match LAST_BACKTRACE.with(|last| last.borrow_mut().take()) {
        Some(trace) => format!("{message}{BACKTRACE_MARKER}{trace}"),
        None => message,
    }
}

unsafe fn write_error(out: *mut *mut c_char, message: &str) {
    if out.is_null() {
        return;
    }
    let message = CString::new(message.replace('\0', " ")).unwrap_or_default();
    unsafe { *out = message.into_raw() };
}

fn into_instance<T: Any>(value: T) -> Box<dyn Any> {
    Box::new(value)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn liveplug_entry(raw: *const RawBinding, error: *mut *mut c_char) -> *mut c_void {
    if raw.is_null() {
        unsafe { write_error(error, "no binding was passed to the script") };
        return ptr::null_mut();
    }
    install_panic_hook();
    let binding = unsafe { Binding::from_raw(&*raw) };
    match panic::catch_unwind(AssertUnwindSafe(|| into_instance(crate::script::main(&binding)))) {
        Ok(instance) => Box::into_raw(Box::new(instance)) as *mut c_void,
        Err(payload) => {
            unsafe { write_error(error, &panic_report(payload)) };
            ptr::null_mut()
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn liveplug_dispose(instance: *mut c_void, error: *mut *mut c_char) -> bool {
    if instance.is_null() {
        return true;
    }
    install_panic_hook();
    let instance = unsafe { Box::from_raw(instance as *mut Box<dyn Any>) };
    match panic::catch_unwind(AssertUnwindSafe(move || drop(instance))) {
        Ok(()) => true,
        Err(payload) => {
            unsafe { write_error(error, &panic_report(payload)) };
            false
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn liveplug_free_error(message: *mut c_char) {
    if !message.is_null() {
        drop(unsafe { CString::from_raw(message) });
    }
}
