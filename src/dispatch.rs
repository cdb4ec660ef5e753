use crate::binding::HostState;
use crate::error::ScriptError;
use crate::host::ui::{self, UiError, UiHandle, UiThread};
use crate::host::{HostServices, Trigger};
use crate::report::{ScriptEvent, ScriptReporter};
use crate::runner;
use crate::script::{EntryKind, ScriptUnit};
use ahash::{AHashMap, AHashSet};
use anyhow::Result;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub unit_id: String,
    pub result: Result<(), ScriptError>,
}

/// Outcomes of one `Dispatcher::run` call, arriving as units finish.
pub struct PendingRuns {
    receiver: Receiver<RunOutcome>,
    expected: usize,
}

impl PendingRuns {
    /// Blocks until every requested unit has finished, in completion order.
    pub fn wait(self) -> Vec<RunOutcome> {
        self.receiver.iter().take(self.expected).collect()
    }
}

/// Ids currently between request and completion.
#[derive(Default)]
struct InFlight(Mutex<AHashSet<String>>);

impl InFlight {
    fn claim(&self, unit_id: &str) -> bool {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).insert(unit_id.to_string())
    }

    fn release(&self, unit_id: &str) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).remove(unit_id);
    }
}

/// Entry point for running and unloading scripts. Setup runs on a worker
/// pool; instantiation and all registry changes run on the UI thread.
pub struct Dispatcher {
    services: Arc<HostServices>,
    reporter: Arc<dyn ScriptReporter>,
    ui: UiHandle<HostState>,
    ui_thread: Mutex<Option<UiThread>>,
    pool: Arc<rayon::ThreadPool>,
    in_flight: Arc<InFlight>,
}

impl Dispatcher {
    pub fn start(services: Arc<HostServices>, reporter: Arc<dyn ScriptReporter>, workers: usize) -> Result<Dispatcher> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("liveplug-worker-{i}"))
            .build()?;
        let (ui, ui_thread) = ui::spawn("liveplug-ui", HostState::new)?;
        log::debug!("Dispatcher started with {} workers", workers.max(1));

        Ok(Dispatcher {
            services,
            reporter,
            ui,
            ui_thread: Mutex::new(Some(ui_thread)),
            pool: Arc::new(pool),
            in_flight: Arc::new(InFlight::default()),
        })
    }

    pub fn services(&self) -> &Arc<HostServices> {
        &self.services
    }

    /// Runs every unit independently. A unit whose previous request is
    /// still in flight is skipped with `ScriptError::Busy`.
    pub fn run(&self, units: Vec<ScriptUnit>, kind: EntryKind, trigger: Trigger) -> PendingRuns {
        self.run_entries(units.into_iter().map(|unit| (unit, kind)).collect(), trigger)
    }

    /// Runs `units` again from the entry file each was loaded with. Units
    /// that are not loaded use the main entry.
    pub fn rerun(&self, units: Vec<ScriptUnit>, trigger: Trigger) -> PendingRuns {
        let kinds: AHashMap<String, EntryKind> = self.loaded_entries().into_iter().collect();
        let entries = units
            .into_iter()
            .map(|unit| {
                let kind = kinds.get(&unit.id).copied().unwrap_or(EntryKind::Main);
                (unit, kind)
            })
            .collect();
        self.run_entries(entries, trigger)
    }

    fn run_entries(&self, entries: Vec<(ScriptUnit, EntryKind)>, trigger: Trigger) -> PendingRuns {
        let (sender, receiver) = mpsc::channel();
        let expected = entries.len();

        for (unit, kind) in entries {
            if !self.in_flight.claim(&unit.id) {
                self.reporter.report(ScriptEvent::Skipped {
                    unit_id: unit.id.clone(),
                    reason: ScriptError::Busy.to_string(),
                });
                let _ = sender.send(RunOutcome {
                    unit_id: unit.id,
                    result: Err(ScriptError::Busy),
                });
                continue;
            }

            let services = self.services.clone();
            let reporter = self.reporter.clone();
            let ui = self.ui.clone();
            let in_flight = self.in_flight.clone();
            let sender = sender.clone();
            let trigger = trigger.clone();
            self.pool.spawn(move || {
                let result = run_unit(&unit, kind, trigger, &services, &ui, reporter);
                in_flight.release(&unit.id);
                let _ = sender.send(RunOutcome {
                    unit_id: unit.id,
                    result,
                });
            });
        }

        PendingRuns { receiver, expected }
    }

    /// Unloads `units`, returning the ids that were loaded.
    pub fn unload(&self, units: Vec<ScriptUnit>) -> Result<Vec<String>, UiError> {
        let reporter = self.reporter.clone();
        self.ui
            .invoke_and_wait(move |state| state.registry.dispose(&units, reporter.as_ref()))
    }

    pub fn is_loaded(&self, unit: &ScriptUnit) -> bool {
        let unit = unit.clone();
        self.ui
            .invoke_and_wait(move |state| state.registry.lookup(&unit).is_some())
            .unwrap_or(false)
    }

    pub fn loaded(&self) -> Vec<String> {
        self.ui
            .invoke_and_wait(|state| state.registry.loaded_ids())
            .unwrap_or_default()
    }

    pub fn loaded_entries(&self) -> Vec<(String, EntryKind)> {
        self.ui
            .invoke_and_wait(|state| state.registry.loaded_entries())
            .unwrap_or_default()
    }

    /// Unloads everything, disposes the root and stops the UI thread.
    /// Setups still running on the pool finish but are no longer registered.
    pub fn shutdown(&self) {
        let Some(ui_thread) = self.ui_thread.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };
        let reporter = self.reporter.clone();
        if let Err(e) = self
            .ui
            .invoke_and_wait(move |state| state.registry.shutdown(reporter.as_ref()))
        {
            log::warn!("Could not unload scripts on shutdown: {e}");
        }
        self.ui.shutdown();
        ui_thread.join();
        log::debug!("Dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_unit(
    unit: &ScriptUnit,
    kind: EntryKind,
    trigger: Trigger,
    services: &HostServices,
    ui: &UiHandle<HostState>,
    reporter: Arc<dyn ScriptReporter>,
) -> Result<(), ScriptError> {
    let _span = tracing::info_span!("script.dispatch", unit = %unit.id).entered();

    let artifact = match runner::setup(unit, kind, services, reporter.as_ref()) {
        Ok(artifact) => artifact,
        Err(error) => {
            reporter.report(ScriptEvent::SetupFailed {
                unit_id: unit.id.clone(),
                error: error.clone(),
            });
            return Err(ScriptError::Setup(error));
        }
    };

    let ui_unit = unit.clone();
    let ui_reporter = reporter.clone();
    let result = ui
        .invoke_and_wait(move |state| {
            let binding = state.registry.create(&ui_unit, kind, &trigger, ui_reporter.as_ref());
            runner::run(artifact, &binding)
        })
        .map_err(|e| ScriptError::Host(e.to_string()))?;

    match result {
        Ok(()) => {
            reporter.report(ScriptEvent::Started {
                unit_id: unit.id.clone(),
            });
            Ok(())
        }
        Err(error) => {
            reporter.report(ScriptEvent::RunFailed {
                unit_id: unit.id.clone(),
                error: error.clone(),
            });
            Err(ScriptError::Running(error))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_unit_can_be_claimed_once_until_released() {
        let in_flight = InFlight::default();
        assert!(in_flight.claim("a"));
        assert!(!in_flight.claim("a"));
        assert!(in_flight.claim("b"));
        in_flight.release("a");
        assert!(in_flight.claim("a"));
    }
}
