use liveplug::binding::Registry;
use liveplug::build::cache;
use liveplug::build::compile::{self, CompilerSettings};
use liveplug::error::{RunningError, SetupError};
use liveplug::host::lifecycle::Disposable;
use liveplug::host::modules::ModuleRegistry;
use liveplug::host::{HostPaths, HostServices, Trigger};
use liveplug::report::{CollectingReporter, ScriptEvent};
use liveplug::runner;
use liveplug::script::{EntryKind, ScriptUnit};
use std::fs;
use std::path::Path;
use std::process::Command;

fn rustc_available() -> bool {
    let settings = CompilerSettings::default();
    Command::new(&settings.rustc)
        .arg("--version")
        .output()
        .is_ok_and(|output| output.status.success())
}

fn services(root: &Path) -> HostServices {
    let services = HostServices::new(HostPaths::under(root), ModuleRegistry::default(), CompilerSettings::default());
    services.install_runtime().unwrap();
    services
}

fn write_unit(root: &Path, id: &str, source: &str) -> ScriptUnit {
    let dir = root.join("scripts").join(id);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("plugin.rs"), source).unwrap();
    ScriptUnit::new(dir)
}

const MARKER_SCRIPT: &str = r#"
use std::fs;

pub struct Marker(std::path::PathBuf);

impl Drop for Marker {
    fn drop(&mut self) {
        fs::write(self.0.join("unloaded"), "").unwrap();
    }
}

pub fn main(binding: &crate::Binding) -> Marker {
    let state = format!(
        "{} {} {}",
        binding.script_id,
        binding.is_host_startup,
        binding.context.is_none()
    );
    fs::write(binding.script_path().join("started"), state).unwrap();
    Marker(binding.script_path.clone())
}
"#;

#[test]
fn compiles_runs_and_unloads_a_native_script() {
    if !rustc_available() {
        eprintln!("rustc not found, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let services = services(dir.path());
    let unit = write_unit(dir.path(), "marker", MARKER_SCRIPT);
    let reporter = CollectingReporter::new();

    let artifact = runner::setup(&unit, EntryKind::Main, &services, &reporter).unwrap();
    assert!(reporter.events_for("marker").contains(&ScriptEvent::Compiling {
        unit_id: "marker".to_string()
    }));
    let output_dir = cache::output_dir(&services.paths.cache_dir, &unit);
    assert!(compile::library_path(&output_dir, "marker").is_file());
    assert!(output_dir.join(cache::HASH_FILE_NAME).is_file());

    let mut registry = Registry::new(Disposable::root("host"));
    let binding = registry.create(&unit, EntryKind::Main, &Trigger::startup(None), &reporter);
    runner::run(artifact, &binding).unwrap();
    assert_eq!(fs::read_to_string(unit.path.join("started")).unwrap(), "marker true true");
    assert!(!unit.path.join("unloaded").exists());

    assert_eq!(registry.dispose(std::slice::from_ref(&unit), &reporter), vec!["marker"]);
    assert!(unit.path.join("unloaded").exists());
    assert!(registry.lookup(&unit).is_none());
}

#[test]
fn unchanged_sources_reuse_the_compiled_library() {
    if !rustc_available() {
        eprintln!("rustc not found, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let services = services(dir.path());
    let unit = write_unit(dir.path(), "cached", "pub fn main(_: &crate::Binding) {}\n");

    let first = CollectingReporter::new();
    drop(runner::setup(&unit, EntryKind::Main, &services, &first).unwrap());
    let second = CollectingReporter::new();
    drop(runner::setup(&unit, EntryKind::Main, &services, &second).unwrap());
    assert_eq!(
        second.events(),
        vec![ScriptEvent::UpToDate {
            unit_id: "cached".to_string()
        }]
    );

    fs::write(unit.path.join("plugin.rs"), "pub fn main(_: &crate::Binding) -> u8 { 1 }\n").unwrap();
    let third = CollectingReporter::new();
    drop(runner::setup(&unit, EntryKind::Main, &services, &third).unwrap());
    assert_eq!(
        third.events()[0],
        ScriptEvent::Compiling {
            unit_id: "cached".to_string()
        }
    );
}

#[test]
fn changed_compiler_flags_force_a_recompile() {
    if !rustc_available() {
        eprintln!("rustc not found, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let services = services(dir.path());
    let source = "#[cfg(liveplug_extra)]\ncompile_error!(\"built with extra cfg\");\npub fn main(_: &crate::Binding) {}\n";
    let unit = write_unit(dir.path(), "flags", source);
    drop(runner::setup(&unit, EntryKind::Main, &services, &CollectingReporter::new()).unwrap());

    let flagged = HostServices::new(
        HostPaths::under(dir.path()),
        ModuleRegistry::default(),
        CompilerSettings {
            flags: vec!["--cfg".to_string(), "liveplug_extra".to_string()],
            ..CompilerSettings::default()
        },
    );
    let reporter = CollectingReporter::new();
    let result = runner::setup(&unit, EntryKind::Main, &flagged, &reporter);
    assert_eq!(
        reporter.events()[0],
        ScriptEvent::Compiling {
            unit_id: "flags".to_string()
        }
    );
    match result {
        Err(SetupError::Compilation(errors)) => assert!(errors.iter().any(|e| e.contains("built with extra cfg"))),
        other => panic!("expected a compilation error, got {other:?}"),
    }
}

#[test]
fn compile_errors_leave_no_output_behind() {
    if !rustc_available() {
        eprintln!("rustc not found, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let services = services(dir.path());
    let unit = write_unit(dir.path(), "broken", "pub fn main(_: &crate::Binding) { let x: u8 = \"no\"; }\n");

    let result = runner::setup(&unit, EntryKind::Main, &services, &CollectingReporter::new());
    match result {
        Err(SetupError::Compilation(errors)) => assert!(errors.iter().any(|e| e.contains("mismatched types"))),
        other => panic!("expected a compilation error, got {other:?}"),
    }
    assert!(!cache::output_dir(&services.paths.cache_dir, &unit).exists());
}

#[test]
fn a_panicking_main_fails_instantiation() {
    if !rustc_available() {
        eprintln!("rustc not found, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let services = services(dir.path());
    let unit = write_unit(dir.path(), "panics", "pub fn main(_: &crate::Binding) { panic!(\"refusing to start\") }\n");
    let reporter = CollectingReporter::new();

    let artifact = runner::setup(&unit, EntryKind::Main, &services, &reporter).unwrap();
    let mut registry = Registry::new(Disposable::root("host"));
    let binding = registry.create(&unit, EntryKind::Main, &Trigger::user(None), &reporter);
    match runner::run(artifact, &binding) {
        Err(RunningError::Instantiation(message)) => {
            assert!(message.starts_with("refusing to start"));
            assert!(!message.contains("stack backtrace:"));
            assert!(!message.contains("std::backtrace"));
        }
        other => panic!("expected an instantiation error, got {other:?}"),
    }
}
