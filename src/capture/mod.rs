//! Capture process adapter: camera command lines, spawning and termination.

mod args;
mod process;

pub use args::*;
pub use process::*;
