use anyhow::Result;
use clap::Parser;
use std::{env, io::Write, path::Path};

use liveplug::{cli, commands, script::EntryKind};

fn main() -> Result<()> {
    let raw_args: Vec<String> = env::args().collect();
    let cli = parse_cli(raw_args).unwrap_or_else(|err| err.exit());

    let log_level_filter = cli.verbose.log_level_filter();

    env_logger::Builder::new()
        .format(|buf, record| writeln!(buf, "{}:\n{}", record.level(), record.args()))
        .filter_level(log_level_filter)
        .target(env_logger::fmt::Target::Stdout)
        .init();

    match cli.command {
        cli::Command::Host(host_args) => commands::host(
            Path::new(&*host_args.folder),
            commands::HostOptions {
                watch: host_args.watch,
                run_startup: !host_args.no_startup,
                plain: host_args.plain,
            },
        ),
        cli::Command::Run(run_args) => {
            let kind = if run_args.test { EntryKind::Test } else { EntryKind::Main };
            match commands::run_once(Path::new(&*run_args.folder), &run_args.ids, kind, run_args.plain) {
                Err(e) => {
                    println!("{e}");
                    std::process::exit(1)
                }
                Ok(true) => std::process::exit(0),
                Ok(false) => std::process::exit(1),
            }
        }
        cli::Command::List { folder } => commands::list(Path::new(&*folder)),
        cli::Command::Clean { folder } => commands::clean(Path::new(&*folder)),
    }
}

fn parse_cli(raw_args: Vec<String>) -> Result<cli::Cli, clap::Error> {
    cli::Cli::try_parse_from(&raw_args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<cli::Cli, clap::Error> {
        parse_cli(args.iter().map(|arg| arg.to_string()).collect())
    }

    #[test]
    fn host_defaults_to_current_folder() {
        let cli = parse(&["liveplug", "host"]).expect("expected host command");

        match cli.command {
            cli::Command::Host(host_args) => {
                assert_eq!(host_args.folder.folder, ".");
                assert!(!host_args.watch);
                assert!(!host_args.no_startup);
            }
            other => panic!("expected host command, got {other:?}"),
        }
    }

    #[test]
    fn run_takes_ids_and_flags() {
        let cli = parse(&["liveplug", "run", "a", "b", "--test", "-f", "project"]).expect("expected run command");

        match cli.command {
            cli::Command::Run(run_args) => {
                assert_eq!(run_args.ids, vec!["a", "b"]);
                assert!(run_args.test);
                assert_eq!(run_args.folder.folder, "project");
            }
            other => panic!("expected run command, got {other:?}"),
        }
    }

    #[test]
    fn verbosity_flags_come_before_the_command() {
        let cli = parse(&["liveplug", "-q", "clean", "--folder", "x"]).expect("expected clean command");

        assert_eq!(cli.verbose.log_level_filter(), log::LevelFilter::Warn);
        match cli.command {
            cli::Command::Clean { folder } => assert_eq!(folder.folder, "x"),
            other => panic!("expected clean command, got {other:?}"),
        }
    }

    #[test]
    fn a_command_is_required() {
        assert!(parse(&["liveplug"]).is_err());
        assert!(parse(&["liveplug", "build"]).is_err());
    }
}
