use crate::config::Config;
use crate::dispatch::{Dispatcher, RunOutcome};
use crate::helpers::{self, emojis::*};
use crate::host::{HostContext, HostServices, Trigger};
use crate::report::ConsoleReporter;
use crate::script::{EntryKind, ScriptUnit};
use crate::watcher;
use anyhow::{Result, anyhow};
use console::style;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc;

#[derive(Debug, Clone, Copy, Default)]
pub struct HostOptions {
    pub watch: bool,
    pub run_startup: bool,
    pub plain: bool,
}

/// A line typed into a running host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    Run(Vec<String>),
    Test(Vec<String>),
    /// Reruns every loaded unit
    Rerun,
    /// Unloads the given units, or everything when empty
    Unload(Vec<String>),
    List,
    Help,
    Quit,
}

const HOST_HELP: &str = "Commands:
  run <id..>      run scripts (replaces loaded instances)
  test <id..>     run the test entry files of scripts
  rerun           run every loaded script again
  unload [id..]   unload scripts, all of them without ids
  list            show scripts and whether they are loaded
  quit            unload everything and exit";

impl HostCommand {
    /// `Ok(None)` for a blank line.
    pub fn parse(line: &str) -> Result<Option<HostCommand>, String> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Ok(None);
        };
        let ids: Vec<String> = words.map(str::to_string).collect();
        let command = match name {
            "run" | "test" if ids.is_empty() => return Err(format!("'{name}' needs at least one script id")),
            "run" => HostCommand::Run(ids),
            "test" => HostCommand::Test(ids),
            "rerun" => HostCommand::Rerun,
            "unload" => HostCommand::Unload(ids),
            "list" | "ls" => HostCommand::List,
            "help" | "?" => HostCommand::Help,
            "quit" | "exit" => HostCommand::Quit,
            other => return Err(format!("Unknown command '{other}', type 'help' for a list")),
        };
        Ok(Some(command))
    }
}

enum Input {
    Line(String),
    Interrupt,
}

fn read_services(folder: &Path) -> Result<(Config, HostServices)> {
    let config = Config::read(folder)?;
    let services = HostServices::from_config(folder, &config)?;
    Ok((config, services))
}

/// Looks up each id. Unknown ids are an error so a typo never silently runs nothing.
fn select_units(services: &HostServices, ids: &[String]) -> Result<Vec<ScriptUnit>> {
    if ids.is_empty() {
        return Ok(services.units()?);
    }
    ids.iter()
        .map(|id| {
            services
                .find_unit(id)
                .ok_or_else(|| anyhow!("No script '{id}' in {}", services.paths.scripts_dir.display()))
        })
        .collect()
}

fn all_succeeded(outcomes: &[RunOutcome]) -> bool {
    outcomes.iter().all(|outcome| outcome.result.is_ok())
}

fn start_dispatcher(services: HostServices, config: &Config, plain: bool) -> Result<Dispatcher> {
    services
        .install_runtime()
        .map_err(|e| anyhow!("Could not install runtime support: {e}"))?;
    for (id, error) in services.modules.preload() {
        log::warn!("Could not load host module {id}: {error}");
    }
    Dispatcher::start(Arc::new(services), Arc::new(ConsoleReporter::new(plain)), config.workers())
}

/// Runs `ids` (every unit when empty) once, then unloads them.
/// Returns whether every unit ran.
pub fn run_once(folder: &Path, ids: &[String], kind: EntryKind, plain: bool) -> Result<bool> {
    let _span = tracing::info_span!("liveplug.run").entered();
    let (config, services) = read_services(folder)?;
    let units = select_units(&services, ids)?;
    if units.is_empty() {
        log::warn!("No scripts found in {}", services.paths.scripts_dir.display());
        return Ok(true);
    }

    let dispatcher = start_dispatcher(services, &config, plain)?;
    let context = HostContext::for_folder(folder);
    let outcomes = dispatcher.run(units, kind, Trigger::user(Some(context))).wait();
    dispatcher.shutdown();
    Ok(all_succeeded(&outcomes))
}

pub fn list(folder: &Path) -> Result<()> {
    let (_, services) = read_services(folder)?;
    let units = services.units()?;
    if units.is_empty() {
        println!("No scripts in {}", services.paths.scripts_dir.display());
        return Ok(());
    }
    for unit in units {
        let main = match unit.detect_entry(EntryKind::Main) {
            Ok((language, _)) => language.to_string(),
            Err(_) => "no entry script".to_string(),
        };
        let test = match unit.detect_entry(EntryKind::Test) {
            Ok(_) => " (has tests)",
            Err(_) => "",
        };
        println!("{:<24} {main}{test}", unit.id);
    }
    Ok(())
}

pub fn clean(folder: &Path) -> Result<()> {
    let config = Config::read(folder)?;
    let paths = config.paths(&helpers::get_abs_path(folder));
    helpers::remove_dir_if_exists(&paths.cache_dir)
        .map_err(|e| anyhow!("Could not remove {}: {e}", paths.cache_dir.display()))?;
    println!("{SPARKLES}Removed {}", paths.cache_dir.display());
    Ok(())
}

fn spawn_stdin_reader(sender: mpsc::Sender<Input>) -> Result<()> {
    std::thread::Builder::new()
        .name("liveplug-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if sender.send(Input::Line(line)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::warn!("Could not read from stdin: {e}");
                        break;
                    }
                }
            }
            log::debug!("stdin closed, the host keeps running until interrupted");
        })?;
    Ok(())
}

fn print_status(dispatcher: &Dispatcher) -> Result<()> {
    let loaded = dispatcher.loaded();
    for unit in dispatcher.services().units()? {
        let status = if loaded.contains(&unit.id) {
            style("loaded").green().to_string()
        } else {
            style("idle").dim().to_string()
        };
        println!("{:<24} {status}", unit.id);
    }
    Ok(())
}

/// Handles one command. Returns `false` when the host should stop.
fn handle(command: HostCommand, dispatcher: &Dispatcher, context: &HostContext) -> Result<bool> {
    let services = dispatcher.services();
    let trigger = Trigger::user(Some(context.clone()));
    match command {
        HostCommand::Run(ids) => {
            let units = select_units(services, &ids)?;
            dispatcher.run(units, EntryKind::Main, trigger).wait();
        }
        HostCommand::Test(ids) => {
            let units = select_units(services, &ids)?;
            dispatcher.run(units, EntryKind::Test, trigger).wait();
        }
        HostCommand::Rerun => {
            let loaded = dispatcher.loaded();
            if loaded.is_empty() {
                println!("Nothing is loaded");
                return Ok(true);
            }
            let units = select_units(services, &loaded)?;
            dispatcher.rerun(units, trigger).wait();
        }
        HostCommand::Unload(ids) => {
            let ids = if ids.is_empty() { dispatcher.loaded() } else { ids };
            if ids.is_empty() {
                println!("Nothing to unload");
                return Ok(true);
            }
            let units = select_units(services, &ids)?;
            let unloaded = dispatcher.unload(units)?;
            if unloaded.is_empty() {
                println!("Nothing to unload");
            }
        }
        HostCommand::List => print_status(dispatcher)?,
        HostCommand::Help => println!("{HOST_HELP}"),
        HostCommand::Quit => return Ok(false),
    }
    Ok(true)
}

/// Runs the long-lived host until `quit` or Ctrl-C.
pub fn host(folder: &Path, options: HostOptions) -> Result<()> {
    let (config, services) = read_services(folder)?;
    let startup: Vec<ScriptUnit> = if options.run_startup {
        config
            .run_on_startup
            .iter()
            .filter_map(|id| {
                let unit = services.find_unit(id);
                if unit.is_none() {
                    log::warn!("Startup script '{id}' does not exist");
                }
                unit
            })
            .collect()
    } else {
        vec![]
    };

    let dispatcher = Arc::new(start_dispatcher(services, &config, options.plain)?);
    let context = HostContext::for_folder(folder);

    if !startup.is_empty() {
        log::info!("Running {} startup script(s)", startup.len());
        dispatcher
            .run(startup, EntryKind::Main, Trigger::startup(Some(context.clone())))
            .wait();
    }

    let watch = if options.watch {
        Some(watcher::start(dispatcher.clone(), Trigger::user(Some(context.clone())))?)
    } else {
        None
    };

    let (sender, receiver) = mpsc::channel();
    let interrupt = sender.clone();
    ctrlc::set_handler(move || {
        let _ = interrupt.send(Input::Interrupt);
    })?;
    spawn_stdin_reader(sender)?;

    println!("{ROCKET}Host ready, type 'help' for commands");
    while let Ok(input) = receiver.recv() {
        let line = match input {
            Input::Interrupt => {
                println!("\nExiting...");
                break;
            }
            Input::Line(line) => line,
        };
        let command = match HostCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                println!("{message}");
                continue;
            }
        };
        match handle(command, &dispatcher, &context) {
            Ok(true) => (),
            Ok(false) => break,
            Err(e) => println!("{CROSS}{e}"),
        }
    }

    drop(watch);
    dispatcher.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn parses_host_commands() {
        assert_eq!(HostCommand::parse("run a b").unwrap(), Some(HostCommand::Run(ids(&["a", "b"]))));
        assert_eq!(HostCommand::parse("  test a ").unwrap(), Some(HostCommand::Test(ids(&["a"]))));
        assert_eq!(HostCommand::parse("rerun").unwrap(), Some(HostCommand::Rerun));
        assert_eq!(HostCommand::parse("unload").unwrap(), Some(HostCommand::Unload(vec![])));
        assert_eq!(HostCommand::parse("unload x").unwrap(), Some(HostCommand::Unload(ids(&["x"]))));
        assert_eq!(HostCommand::parse("ls").unwrap(), Some(HostCommand::List));
        assert_eq!(HostCommand::parse("exit").unwrap(), Some(HostCommand::Quit));
        assert_eq!(HostCommand::parse("   ").unwrap(), None);
    }

    #[test]
    fn rejects_unknown_and_incomplete_commands() {
        assert!(HostCommand::parse("run").unwrap_err().contains("at least one"));
        assert!(HostCommand::parse("launch x").unwrap_err().contains("'launch'"));
    }

    #[test]
    fn unknown_ids_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("scripts/known")).unwrap();
        let (_, services) = read_services(dir.path()).unwrap();

        assert_eq!(select_units(&services, &ids(&["known"])).unwrap()[0].id, "known");
        let error = select_units(&services, &ids(&["known", "typo"])).unwrap_err();
        assert!(error.to_string().contains("'typo'"));
        assert_eq!(select_units(&services, &[]).unwrap().len(), 1);
    }

    #[test]
    fn clean_removes_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join(".liveplug/cache/hello-0000");
        fs::create_dir_all(&cache).unwrap();
        clean(dir.path()).unwrap();
        assert!(!dir.path().join(".liveplug/cache").exists());
        clean(dir.path()).unwrap();
    }

    #[test]
    fn one_shot_run_reports_failures() {
        let dir = tempfile::tempdir().unwrap();
        let scripts = dir.path().join("scripts");
        fs::create_dir_all(scripts.join("good")).unwrap();
        fs::write(scripts.join("good/plugin.rhai"), "let x = 1;").unwrap();
        fs::create_dir_all(scripts.join("bad")).unwrap();
        fs::write(scripts.join("bad/plugin.rhai"), r#"throw "boom";"#).unwrap();

        assert!(run_once(dir.path(), &ids(&["good"]), EntryKind::Main, true).unwrap());
        assert!(!run_once(dir.path(), &[], EntryKind::Main, true).unwrap());
        assert!(run_once(dir.path(), &ids(&["missing"]), EntryKind::Main, true).is_err());
    }
}
