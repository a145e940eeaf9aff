//! Genefetch.
//!
//! Command line driver of the gene database fetch layer: runs the database update scripts,
//! retrieves single artifacts into a database cache, and maintains the persistent stores.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
mod logging;
mod updater;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
