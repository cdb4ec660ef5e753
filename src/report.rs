use crate::error::{RunningError, SetupError};
use crate::helpers::emojis::*;
use console::{Term, style};
use std::sync::Mutex;

/// Progress of script runs, reported as it happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptEvent {
    /// Sources changed, the compiler is running
    Compiling { unit_id: String },
    /// Cached output was reused
    UpToDate { unit_id: String },
    CompilerWarning { unit_id: String, message: String },
    /// The script was instantiated and is now loaded
    Started { unit_id: String },
    SetupFailed { unit_id: String, error: SetupError },
    RunFailed { unit_id: String, error: RunningError },
    /// Tearing down a previous instance failed; the new run went ahead
    DisposeFailed { unit_id: String, error: RunningError },
    Unloaded { unit_id: String },
    /// The request was dropped without running
    Skipped { unit_id: String, reason: String },
}

impl ScriptEvent {
    pub fn unit_id(&self) -> &str {
        match self {
            ScriptEvent::Compiling { unit_id }
            | ScriptEvent::UpToDate { unit_id }
            | ScriptEvent::CompilerWarning { unit_id, .. }
            | ScriptEvent::Started { unit_id }
            | ScriptEvent::SetupFailed { unit_id, .. }
            | ScriptEvent::RunFailed { unit_id, .. }
            | ScriptEvent::DisposeFailed { unit_id, .. }
            | ScriptEvent::Unloaded { unit_id }
            | ScriptEvent::Skipped { unit_id, .. } => unit_id,
        }
    }
}

pub trait ScriptReporter: Send + Sync {
    fn report(&self, event: ScriptEvent);
}

/// Discards every event.
pub struct NoopReporter;

impl ScriptReporter for NoopReporter {
    fn report(&self, _event: ScriptEvent) {}
}

/// Keeps every event, for tests and for callers that summarise afterwards.
#[derive(Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<ScriptEvent>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ScriptEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn events_for(&self, unit_id: &str) -> Vec<ScriptEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.unit_id() == unit_id)
            .collect()
    }
}

impl ScriptReporter for CollectingReporter {
    fn report(&self, event: ScriptEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}

/// Prints events to the terminal. Falls back to plain text when not on a TTY.
pub struct ConsoleReporter {
    plain_output: bool,
}

impl ConsoleReporter {
    pub fn new(plain_output: bool) -> Self {
        ConsoleReporter {
            plain_output: plain_output || !Term::stdout().is_term(),
        }
    }
}

/// The line printed for `event`, without styling.
pub fn render(event: &ScriptEvent) -> String {
    match event {
        ScriptEvent::Compiling { unit_id } => format!("Compiling {unit_id}"),
        ScriptEvent::UpToDate { unit_id } => format!("{unit_id} is up to date"),
        ScriptEvent::CompilerWarning { unit_id, message } => format!("Warning in {unit_id}:\n{message}"),
        ScriptEvent::Started { unit_id } => format!("Started {unit_id}"),
        ScriptEvent::SetupFailed { unit_id, error } => format!("Could not set up {unit_id}: {error}"),
        ScriptEvent::RunFailed { unit_id, error } => format!("{unit_id} failed: {error}"),
        ScriptEvent::DisposeFailed { unit_id, error } => format!("{unit_id}: {error}"),
        ScriptEvent::Unloaded { unit_id } => format!("Unloaded {unit_id}"),
        ScriptEvent::Skipped { unit_id, reason } => format!("Skipped {unit_id}: {reason}"),
    }
}

impl ScriptReporter for ConsoleReporter {
    fn report(&self, event: ScriptEvent) {
        let message = render(&event);
        if self.plain_output {
            match event {
                ScriptEvent::SetupFailed { .. }
                | ScriptEvent::RunFailed { .. }
                | ScriptEvent::DisposeFailed { .. }
                | ScriptEvent::CompilerWarning { .. } => eprintln!("{message}"),
                _ => println!("{message}"),
            }
            return;
        }
        match event {
            ScriptEvent::Compiling { .. } => println!("{LINE_CLEAR}{GEAR}{message}"),
            ScriptEvent::UpToDate { .. } => println!("{LINE_CLEAR}{SPARKLES}{}", style(message).dim()),
            ScriptEvent::Started { .. } => println!("{LINE_CLEAR}{ROCKET}{}", style(message).green()),
            ScriptEvent::Unloaded { .. } => println!("{LINE_CLEAR}{RECYCLE}{message}"),
            ScriptEvent::CompilerWarning { .. } | ScriptEvent::Skipped { .. } => {
                eprintln!("{WARNING}{}", style(message).yellow())
            }
            ScriptEvent::SetupFailed { .. } | ScriptEvent::RunFailed { .. } | ScriptEvent::DisposeFailed { .. } => {
                eprintln!("{CROSS}{}", style(message).red())
            }
        }
    }
}
