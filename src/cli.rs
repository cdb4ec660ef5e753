use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::InfoLevel;

/// Compile, hot-load and rerun small scripts inside a long-running host.
#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    /// Verbosity:
    /// -v -> Debug
    /// -vv -> Trace
    /// -q -> Warn
    /// -qq -> Error
    /// -qqq -> Off.
    /// Default (/ no argument given): 'info'
    #[command(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<InfoLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct FolderArg {
    /// The project folder holding `liveplug.json` and the scripts directory.
    #[arg(short, long, default_value = ".")]
    pub folder: String,
}

#[derive(Args, Debug, Clone)]
pub struct HostArgs {
    #[command(flatten)]
    pub folder: FolderArg,

    /// Rerun loaded scripts when their files change.
    #[arg(short, long, default_value_t = false)]
    pub watch: bool,

    /// Do not run the `runOnStartup` scripts.
    #[arg(long, default_value_t = false)]
    pub no_startup: bool,

    /// Print events without colors or emojis.
    #[arg(long, default_value_t = false)]
    pub plain: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Ids of the script units to run. Runs every unit when empty.
    pub ids: Vec<String>,

    /// Run the `plugin-test` entry files instead of the main ones.
    #[arg(short, long, default_value_t = false)]
    pub test: bool,

    #[command(flatten)]
    pub folder: FolderArg,

    /// Print events without colors or emojis.
    #[arg(long, default_value_t = false)]
    pub plain: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start a host that keeps scripts loaded and reads commands from stdin.
    Host(HostArgs),
    /// Run scripts once, unload them and exit.
    Run(RunArgs),
    /// List the script units and their languages.
    List {
        #[command(flatten)]
        folder: FolderArg,
    },
    /// Remove compiled script libraries.
    Clean {
        #[command(flatten)]
        folder: FolderArg,
    },
}

impl std::ops::Deref for FolderArg {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.folder
    }
}
