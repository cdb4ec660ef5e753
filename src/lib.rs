pub mod binding;
pub mod build;
pub mod cli;
pub mod commands;
pub mod config;
pub mod deps;
pub mod dispatch;
pub mod error;
pub mod helpers;
pub mod host;
pub mod queue;
pub mod report;
pub mod runner;
pub mod script;
pub mod watcher;
