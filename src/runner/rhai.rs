use crate::binding::Binding;
use crate::deps::{self, ResolvedDependencies};
use crate::error::{RunningError, SetupError};
use crate::host::HostServices;
use crate::script::{Language, ScriptUnit};
use ahash::AHashSet;
use anyhow::anyhow;
use rhai::module_resolvers::{FileModuleResolver, ModuleResolversCollection, StaticModuleResolver};
use rhai::{AST, CallFnOptions, Dynamic, Engine, Map, Module, Scope};
use std::path::{Path, PathBuf};

/// Script function called when the unit is unloaded, if it defines one.
pub const UNLOAD_FUNCTION: &str = "on_unload";

pub struct RhaiArtifact {
    unit_id: String,
    engine: Engine,
    ast: AST,
}

impl RhaiArtifact {
    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }
}

fn extension_is(path: &Path, extension: &str) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some(extension)
}

/// Host module libraries become static modules named `<module-id>/<stem>`.
/// Imports are then looked up in the unit directory and in classpath
/// directories, in that order.
fn module_resolvers(
    engine: &Engine,
    unit: &ScriptUnit,
    deps: &ResolvedDependencies,
) -> Result<ModuleResolversCollection, SetupError> {
    if let Some(missing) = deps.classpath.iter().find(|addition| !addition.exists()) {
        return Err(SetupError::MissingClasspathFile(missing.clone()));
    }

    let mut host_modules = StaticModuleResolver::new();
    for module in &deps.modules {
        for library in module.library_files() {
            if !extension_is(&library, Language::Rhai.extension()) {
                continue;
            }
            let Some(stem) = library.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            let ast = engine
                .compile_file(library.clone())
                .map_err(|e| SetupError::Compilation(vec![format!("{}: {e}", library.display())]))?;
            let compiled = Module::eval_ast_as_new(Scope::new(), &ast, engine)
                .map_err(|e| SetupError::Load(format!("{}: {e}", library.display())))?;
            host_modules.insert(format!("{}/{stem}", module.id), compiled);
        }
    }

    let mut resolvers = ModuleResolversCollection::new();
    resolvers.push(host_modules);
    resolvers.push(FileModuleResolver::new_with_path(&unit.path));

    let mut seen: AHashSet<PathBuf> = AHashSet::new();
    seen.insert(unit.path.clone());
    for addition in &deps.classpath {
        let dir = if addition.is_dir() {
            addition.clone()
        } else if extension_is(addition, Language::Rhai.extension())
            && let Some(parent) = addition.parent()
        {
            parent.to_path_buf()
        } else {
            continue;
        };
        if seen.insert(dir.clone()) {
            resolvers.push(FileModuleResolver::new_with_path(dir));
        }
    }
    Ok(resolvers)
}

pub fn setup(
    unit: &ScriptUnit,
    entry_file: &Path,
    source: &str,
    services: &HostServices,
) -> Result<RhaiArtifact, SetupError> {
    let deps = deps::resolve(unit, Language::Rhai, source, services)?;

    let mut engine = Engine::new();
    let output = services.output.clone();
    let unit_id = unit.id.clone();
    engine.on_print(move |text| output(&unit_id, text));
    let output = services.output.clone();
    let unit_id = unit.id.clone();
    engine.on_debug(move |text, _source, position| output(&unit_id, &format!("{position:?} | {text}")));

    let resolvers = module_resolvers(&engine, unit, &deps)?;
    engine.set_module_resolver(resolvers);

    let ast = engine
        .compile(source)
        .map_err(|e| SetupError::Compilation(vec![format!("{}: {e}", entry_file.display())]))?;

    Ok(RhaiArtifact {
        unit_id: unit.id.clone(),
        engine,
        ast,
    })
}

fn binding_scope(binding: &Binding) -> Scope<'static> {
    let context = match &binding.context {
        Some(context) => {
            let mut map = Map::new();
            map.insert("name".into(), context.name.clone().into());
            map.insert("path".into(), context.base_path.to_string_lossy().to_string().into());
            Dynamic::from_map(map)
        }
        None => Dynamic::UNIT,
    };
    let mut scope = Scope::new();
    scope.push_constant("is_host_startup", binding.is_host_startup);
    scope.push_constant_dynamic("context", context);
    scope.push_constant("plugin_path", binding.script_path.to_string_lossy().to_string());
    scope.push_constant("plugin_id", binding.unit_id.clone());
    scope
}

pub fn run(artifact: RhaiArtifact, binding: &Binding) -> Result<(), RunningError> {
    let RhaiArtifact { unit_id, engine, ast } = artifact;
    let mut scope = binding_scope(binding);

    engine
        .run_ast_with_scope(&mut scope, &ast)
        .map_err(|e| RunningError::Instantiation(e.to_string()))?;

    let has_unload = ast
        .iter_functions()
        .any(|f| f.name == UNLOAD_FUNCTION && f.params.is_empty());
    if !has_unload {
        return Ok(());
    }

    binding
        .disposable
        .child("instance")
        .set_teardown(move || {
            let options = CallFnOptions::new().eval_ast(false);
            engine
                .call_fn_with_options::<Dynamic>(options, &mut scope, &ast, UNLOAD_FUNCTION, ())
                .map(|_| ())
                .map_err(|e| anyhow!("{unit_id}: {e}"))
        })
        .map_err(|e| RunningError::Disposal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::compile::CompilerSettings;
    use crate::host::lifecycle::Disposable;
    use crate::host::modules::{ModuleDescriptor, ModuleRegistry};
    use crate::host::{HostContext, HostPaths};
    use crate::script::EntryKind;
    use std::fs;
    use std::sync::{Arc, Mutex};

    type Captured = Arc<Mutex<Vec<String>>>;

    fn services(root: &Path, modules: ModuleRegistry) -> (HostServices, Captured) {
        let captured: Captured = Arc::new(Mutex::new(vec![]));
        let sink = captured.clone();
        let services = HostServices::new(HostPaths::under(root), modules, CompilerSettings::default())
            .with_output(Arc::new(move |_unit: &str, message: &str| sink.lock().unwrap().push(message.to_string())));
        (services, captured)
    }

    fn write_unit(root: &Path, id: &str, source: &str) -> (ScriptUnit, PathBuf) {
        let dir = root.join("scripts").join(id);
        fs::create_dir_all(&dir).unwrap();
        let entry = dir.join("plugin.rhai");
        fs::write(&entry, source).unwrap();
        (ScriptUnit::new(dir), entry)
    }

    fn binding(unit: &ScriptUnit, context: Option<HostContext>, root: &Disposable) -> Binding {
        Binding {
            unit_id: unit.id.clone(),
            kind: EntryKind::Main,
            context,
            is_host_startup: true,
            script_path: unit.path.clone(),
            disposable: root.child(&unit.id),
        }
    }

    #[test]
    fn runs_with_binding_variables_and_calls_on_unload() {
        let dir = tempfile::tempdir().unwrap();
        let (services, captured) = services(dir.path(), ModuleRegistry::default());
        let source = r#"
            print(`${plugin_id} ${is_host_startup} ${type_of(context) == "()"}`);
            fn on_unload() { print("bye"); }
        "#;
        let (unit, entry) = write_unit(dir.path(), "hello", source);

        let artifact = setup(&unit, &entry, source, &services).unwrap();
        let root = Disposable::root("host");
        let binding = binding(&unit, None, &root);
        run(artifact, &binding).unwrap();
        assert_eq!(*captured.lock().unwrap(), vec!["hello true true"]);

        binding.disposable.dispose().unwrap();
        assert_eq!(*captured.lock().unwrap(), vec!["hello true true", "bye"]);
    }

    #[test]
    fn context_is_a_map() {
        let dir = tempfile::tempdir().unwrap();
        let (services, captured) = services(dir.path(), ModuleRegistry::default());
        let source = "print(context.name);";
        let (unit, entry) = write_unit(dir.path(), "ctx", source);

        let artifact = setup(&unit, &entry, source, &services).unwrap();
        let context = HostContext {
            name: "project".to_string(),
            base_path: dir.path().to_path_buf(),
        };
        run(artifact, &binding(&unit, Some(context), &Disposable::root("host"))).unwrap();
        assert_eq!(*captured.lock().unwrap(), vec!["project"]);
    }

    #[test]
    fn imports_from_unit_directory_and_host_modules() {
        let dir = tempfile::tempdir().unwrap();
        let module_dir = dir.path().join("modules/greetings");
        fs::create_dir_all(module_dir.join("lib")).unwrap();
        fs::write(module_dir.join("lib/words.rhai"), r#"fn hello() { "hi" }"#).unwrap();
        let registry = ModuleRegistry::from_descriptors([ModuleDescriptor {
            id: "greetings".to_string(),
            name: "greetings".to_string(),
            version: None,
            enabled: true,
            dependencies: vec![],
            path: module_dir.clone(),
            libraries: vec![module_dir.join("lib")],
        }]);
        let (services, captured) = services(dir.path(), registry);

        let source = r#"
            // depends-on-plugin greetings
            import "greetings/words" as words;
            import "local" as local;
            print(words::hello() + local::name());
        "#;
        let (unit, entry) = write_unit(dir.path(), "imports", source);
        fs::write(unit.path.join("local.rhai"), r#"fn name() { " there" }"#).unwrap();

        let artifact = setup(&unit, &entry, source, &services).unwrap();
        run(artifact, &binding(&unit, None, &Disposable::root("host"))).unwrap();
        assert_eq!(*captured.lock().unwrap(), vec!["hi there"]);
    }

    #[test]
    fn vanished_classpath_addition_fails_before_loading() {
        let dir = tempfile::tempdir().unwrap();
        let unit = ScriptUnit::new(dir.path().join("scripts/gone"));
        let gone = dir.path().join("shared");
        let deps = ResolvedDependencies {
            classpath: vec![dir.path().to_path_buf(), gone.clone()],
            modules: vec![],
        };

        match module_resolvers(&Engine::new(), &unit, &deps) {
            Err(SetupError::MissingClasspathFile(path)) => assert_eq!(path, gone),
            Err(other) => panic!("expected a missing classpath file, got {other:?}"),
            Ok(_) => panic!("expected a missing classpath file"),
        }
    }

    #[test]
    fn syntax_errors_fail_setup() {
        let dir = tempfile::tempdir().unwrap();
        let (services, _) = services(dir.path(), ModuleRegistry::default());
        let source = "let x = ;";
        let (unit, entry) = write_unit(dir.path(), "broken", source);

        match setup(&unit, &entry, source, &services) {
            Err(SetupError::Compilation(errors)) => assert!(errors[0].contains("plugin.rhai")),
            other => panic!("expected compilation error, got {:?}", other.map(|a| a.unit_id)),
        }
    }

    #[test]
    fn runtime_errors_fail_instantiation() {
        let dir = tempfile::tempdir().unwrap();
        let (services, _) = services(dir.path(), ModuleRegistry::default());
        let source = r#"throw "nope";"#;
        let (unit, entry) = write_unit(dir.path(), "throws", source);

        let artifact = setup(&unit, &entry, source, &services).unwrap();
        let result = run(artifact, &binding(&unit, None, &Disposable::root("host")));
        assert!(matches!(result, Err(RunningError::Instantiation(message)) if message.contains("nope")));
    }
}
