//! Jukebox.
//!
//! Jukebox is a small web service that turns media keys into audio files on demand. Concurrent
//! requests for the same key share a single download, the result is streamed to every requester
//! and removed from disk shortly afterwards.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod endpoints;
mod healthcheck;
mod logging;
mod server;


#[cfg(not(target_env = "msvc"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
