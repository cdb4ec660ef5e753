use crate::dispatch::Dispatcher;
use crate::helpers::StrippedVerbatimPath;
use crate::host::Trigger;
use crate::queue::FifoQueue;
use crate::script::Language;
use ahash::AHashSet;
use anyhow::{Result, anyhow};
use futures_timer::Delay;
use notify::event::ModifyKind;
use notify::{Config, Error, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

fn is_script_file(path: &Path) -> bool {
    let extension = path.extension().and_then(|ext| ext.to_str());
    Language::ALL
        .iter()
        .any(|language| Some(language.extension()) == extension)
}

fn is_relevant(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_)
        | EventKind::Remove(_)
        | EventKind::Any
        | EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Name(_))
        | EventKind::Modify(ModifyKind::Any) => true,
        EventKind::Access(_)
        | EventKind::Other
        | EventKind::Modify(ModifyKind::Metadata(_))
        | EventKind::Modify(ModifyKind::Other) => false,
    }
}

/// Unit id owning `path`, i.e. the first component below `scripts_dir`.
/// Files in hidden directories or directly in `scripts_dir` belong to no unit.
pub fn unit_of(path: &Path, scripts_dir: &Path) -> Option<String> {
    let relative = path.strip_prefix(scripts_dir).ok()?;
    let mut components = relative.components();
    let Some(Component::Normal(first)) = components.next() else {
        return None;
    };
    components.next()?;
    let id = first.to_string_lossy().to_string();
    if id.starts_with('.') { None } else { Some(id) }
}

/// Loaded units touched by `paths`, sorted and without duplicates.
pub fn changed_units(paths: &[PathBuf], scripts_dir: &Path, loaded: &[String]) -> Vec<String> {
    let loaded: AHashSet<&str> = loaded.iter().map(String::as_str).collect();
    let mut ids: Vec<String> = paths
        .iter()
        .filter(|path| is_script_file(path))
        .filter_map(|path| unit_of(path, scripts_dir))
        .filter(|id| loaded.contains(id.as_str()))
        .collect::<AHashSet<_>>()
        .into_iter()
        .collect();
    ids.sort();
    ids
}

/// Keeps the file watcher alive; stops it when dropped.
pub struct WatchHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct AsyncWatchArgs {
    q: Arc<FifoQueue<Result<Event, Error>>>,
    scripts_dir: PathBuf,
    dispatcher: Arc<Dispatcher>,
    trigger: Trigger,
    stop: Arc<AtomicBool>,
}

async fn async_watch(
    AsyncWatchArgs {
        q,
        scripts_dir,
        dispatcher,
        trigger,
        stop,
    }: AsyncWatchArgs,
) {
    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let mut paths: Vec<PathBuf> = vec![];
        if !q.is_empty() {
            // let editors finish writing before reading the sources
            Delay::new(Duration::from_millis(50)).await;
        }
        while let Some(event) = q.pop() {
            match event {
                Ok(event) if is_relevant(&event.kind) => paths.extend(event.paths),
                Ok(_) => (),
                Err(e) => log::warn!("Watch error: {e}"),
            }
        }

        if paths.is_empty() {
            Delay::new(Duration::from_millis(50)).await;
            continue;
        }

        let paths: Vec<PathBuf> = paths
            .into_iter()
            .map(StrippedVerbatimPath::to_stripped_verbatim_path)
            .collect();
        let changed = changed_units(&paths, &scripts_dir, &dispatcher.loaded());
        if changed.is_empty() {
            continue;
        }
        log::info!("Rerunning {}", changed.join(", "));

        let units = changed
            .iter()
            .filter_map(|id| dispatcher.services().find_unit(id))
            .collect();
        for outcome in dispatcher.rerun(units, trigger.clone()).wait() {
            if let Err(e) = outcome.result {
                log::debug!("Rerun of {} failed: {e}", outcome.unit_id);
            }
        }
    }
}

/// Watches the scripts directory and reruns loaded units whose files change.
pub fn start(dispatcher: Arc<Dispatcher>, trigger: Trigger) -> Result<WatchHandle> {
    let scripts_dir = crate::helpers::get_abs_path(&dispatcher.services().paths.scripts_dir);
    let queue = Arc::new(FifoQueue::<Result<Event, Error>>::new());
    let producer = queue.clone();

    let mut watcher = RecommendedWatcher::new(move |res| producer.push(res), Config::default())
        .map_err(|e| anyhow!("Could not create watcher: {e}"))?;
    watcher
        .watch(&scripts_dir, RecursiveMode::Recursive)
        .map_err(|e| anyhow!("Could not watch {}: {e}", scripts_dir.display()))?;
    log::debug!("watching {}", scripts_dir.display());

    let stop = Arc::new(AtomicBool::new(false));
    let args = AsyncWatchArgs {
        q: queue,
        scripts_dir,
        dispatcher,
        trigger,
        stop: stop.clone(),
    };
    let thread = std::thread::Builder::new()
        .name("liveplug-watch".to_string())
        .spawn(move || {
            let _watcher = watcher;
            futures::executor::block_on(async_watch(args));
        })?;

    Ok(WatchHandle {
        stop,
        thread: Some(thread),
    })
}
