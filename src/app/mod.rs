//! Binary-side application flow: config, input, progress UI, exit codes.

mod config;
mod exit_handler;
mod input;
mod progress;
mod runtime;

pub(crate) use runtime::run_bookqueue;
