use crate::error::RunningError;
use crate::host::lifecycle::Disposable;
use crate::host::{HostContext, Trigger};
use crate::report::{ScriptEvent, ScriptReporter};
use crate::script::{EntryKind, ScriptUnit};
use ahash::AHashMap;
use std::path::PathBuf;

/// A loaded script instance. Lives on the UI thread from just before the
/// script is instantiated until it is unloaded or replaced by the next run.
#[derive(Debug, Clone)]
pub struct Binding {
    pub unit_id: String,
    /// Entry file the instance was started from; reruns use it again.
    pub kind: EntryKind,
    pub context: Option<HostContext>,
    pub is_host_startup: bool,
    pub script_path: PathBuf,
    pub disposable: Disposable,
}

/// Unit id -> current binding. Owned by the UI thread.
pub struct Registry {
    root: Disposable,
    bindings: AHashMap<String, Binding>,
}

impl Registry {
    pub fn new(root: Disposable) -> Registry {
        Registry {
            root,
            bindings: AHashMap::new(),
        }
    }

    pub fn root(&self) -> &Disposable {
        &self.root
    }

    /// Replaces the unit's binding with a fresh one. A failure to tear down
    /// the previous instance is reported and does not stop the new binding.
    pub fn create<R: ScriptReporter + ?Sized>(
        &mut self,
        unit: &ScriptUnit,
        kind: EntryKind,
        trigger: &Trigger,
        reporter: &R,
    ) -> Binding {
        if let Some(previous) = self.bindings.remove(&unit.id) {
            dispose_binding(&previous, reporter);
        }
        let binding = Binding {
            unit_id: unit.id.clone(),
            kind,
            context: trigger.context.clone(),
            is_host_startup: trigger.is_host_startup,
            script_path: unit.path.clone(),
            disposable: self.root.child(&format!("script:{}", unit.id)),
        };
        self.bindings.insert(unit.id.clone(), binding.clone());
        binding
    }

    pub fn lookup(&self, unit: &ScriptUnit) -> Option<&Binding> {
        self.bindings.get(&unit.id)
    }

    pub fn contains(&self, unit_id: &str) -> bool {
        self.bindings.contains_key(unit_id)
    }

    /// Unloads `units`. Units without a binding are ignored. Returns the
    /// ids that were actually unloaded.
    pub fn dispose<R: ScriptReporter + ?Sized>(&mut self, units: &[ScriptUnit], reporter: &R) -> Vec<String> {
        let mut unloaded = vec![];
        for unit in units {
            if let Some(binding) = self.bindings.remove(&unit.id) {
                dispose_binding(&binding, reporter);
                reporter.report(ScriptEvent::Unloaded {
                    unit_id: unit.id.clone(),
                });
                unloaded.push(unit.id.clone());
            }
        }
        unloaded
    }

    pub fn loaded_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.bindings.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Loaded ids with the entry kind each was started from, sorted by id.
    pub fn loaded_entries(&self) -> Vec<(String, EntryKind)> {
        let mut entries: Vec<(String, EntryKind)> = self
            .bindings
            .iter()
            .map(|(id, binding)| (id.clone(), binding.kind))
            .collect();
        entries.sort();
        entries
    }

    /// Unloads everything and disposes the root.
    pub fn shutdown<R: ScriptReporter + ?Sized>(&mut self, reporter: &R) {
        let mut ids = self.loaded_ids();
        ids.reverse();
        for id in ids {
            if let Some(binding) = self.bindings.remove(&id) {
                dispose_binding(&binding, reporter);
                reporter.report(ScriptEvent::Unloaded { unit_id: id });
            }
        }
        if let Err(e) = self.root.dispose() {
            log::warn!("Errors while shutting down:\n{e}");
        }
    }
}

fn dispose_binding<R: ScriptReporter + ?Sized>(binding: &Binding, reporter: &R) {
    if let Err(e) = binding.disposable.dispose() {
        log::warn!("Could not cleanly unload '{}': {e}", binding.unit_id);
        reporter.report(ScriptEvent::DisposeFailed {
            unit_id: binding.unit_id.clone(),
            error: RunningError::Disposal(e.to_string()),
        });
    }
}

/// Everything the UI thread owns.
pub struct HostState {
    pub registry: Registry,
}

impl HostState {
    pub fn new() -> HostState {
        HostState {
            registry: Registry::new(Disposable::root("host")),
        }
    }
}

impl Default for HostState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::CollectingReporter;
    use anyhow::anyhow;
    use std::cell::Cell;
    use std::rc::Rc;

    fn unit(id: &str) -> ScriptUnit {
        ScriptUnit::new(format!("/scripts/{id}"))
    }

    #[test]
    fn rerun_disposes_once_and_lookup_returns_the_new_binding() {
        let reporter = CollectingReporter::new();
        let mut registry = Registry::new(Disposable::root("host"));
        let disposed = Rc::new(Cell::new(0));

        let first = registry.create(&unit("a"), EntryKind::Main, &Trigger::startup(None), &reporter);
        let counter = disposed.clone();
        first
            .disposable
            .set_teardown(move || {
                counter.set(counter.get() + 1);
                Ok(())
            })
            .unwrap();

        let second = registry.create(&unit("a"), EntryKind::Main, &Trigger::user(None), &reporter);
        assert_eq!(disposed.get(), 1);
        assert!(first.disposable.is_disposed());
        assert!(!second.disposable.is_disposed());

        let current = registry.lookup(&unit("a")).unwrap();
        assert!(!current.is_host_startup);
        assert!(!current.disposable.is_disposed());
        assert!(reporter.events().is_empty());
    }

    #[test]
    fn failed_teardown_is_reported_but_not_fatal() {
        let reporter = CollectingReporter::new();
        let mut registry = Registry::new(Disposable::root("host"));
        let first = registry.create(&unit("a"), EntryKind::Main, &Trigger::default(), &reporter);
        first.disposable.set_teardown(|| Err(anyhow!("stuck"))).unwrap();

        registry.create(&unit("a"), EntryKind::Main, &Trigger::default(), &reporter);
        match &reporter.events()[..] {
            [ScriptEvent::DisposeFailed { unit_id, error: RunningError::Disposal(message) }] => {
                assert_eq!(unit_id, "a");
                assert!(message.contains("stuck"));
            }
            other => panic!("unexpected events {other:?}"),
        }
        assert!(registry.lookup(&unit("a")).is_some());
    }

    #[test]
    fn unload_then_lookup_is_absent_and_second_unload_is_a_no_op() {
        let reporter = CollectingReporter::new();
        let mut registry = Registry::new(Disposable::root("host"));
        registry.create(&unit("a"), EntryKind::Main, &Trigger::default(), &reporter);
        registry.create(&unit("b"), EntryKind::Main, &Trigger::default(), &reporter);

        assert_eq!(registry.dispose(&[unit("a")], &reporter), vec!["a"]);
        assert!(registry.lookup(&unit("a")).is_none());
        assert!(registry.dispose(&[unit("a")], &reporter).is_empty());
        assert_eq!(registry.loaded_ids(), vec!["b"]);
        assert_eq!(
            reporter.events(),
            vec![ScriptEvent::Unloaded { unit_id: "a".into() }]
        );
    }

    #[test]
    fn loaded_entries_remember_the_entry_kind() {
        let reporter = CollectingReporter::new();
        let mut registry = Registry::new(Disposable::root("host"));
        registry.create(&unit("b"), EntryKind::Test, &Trigger::default(), &reporter);
        registry.create(&unit("a"), EntryKind::Main, &Trigger::default(), &reporter);
        assert_eq!(
            registry.loaded_entries(),
            vec![("a".to_string(), EntryKind::Main), ("b".to_string(), EntryKind::Test)]
        );

        registry.create(&unit("b"), EntryKind::Main, &Trigger::default(), &reporter);
        assert_eq!(registry.lookup(&unit("b")).unwrap().kind, EntryKind::Main);
    }

    #[test]
    fn shutdown_disposes_everything() {
        let reporter = CollectingReporter::new();
        let mut registry = Registry::new(Disposable::root("host"));
        let a = registry.create(&unit("a"), EntryKind::Main, &Trigger::default(), &reporter);
        let b = registry.create(&unit("b"), EntryKind::Main, &Trigger::default(), &reporter);

        registry.shutdown(&reporter);
        assert!(a.disposable.is_disposed() && b.disposable.is_disposed());
        assert!(registry.root().is_disposed());
        assert!(registry.loaded_ids().is_empty());
    }
}
