//! Command: print version information.
use crate::platform::Platform;

/// Print the snapstate version and host platform to stdout.
#[allow(clippy::print_stdout)]
pub fn run() {
    let version = option_env!("SNAPSTATE_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"));
    let platform = Platform::detect();
    println!("snapstate {version} ({})", platform.os);
}
