//! Process-wide, env-overridable flags read once during initialization.
//!
//! The reference design this crate is modeled on declares a `mod options;`
//! and references `option_is_enabled(...)`-shaped calls from its OS layer
//! but never ships the module. This is that module.

use std::sync::OnceLock;

struct Options {
    verbose: bool,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v == "1").unwrap_or(false)
}

fn options() -> &'static Options {
    static OPTIONS: OnceLock<Options> = OnceLock::new();
    OPTIONS.get_or_init(|| Options {
        verbose: env_flag("SEGALLOC_VERBOSE"),
    })
}

/// Whether page-lifecycle tracing (`debug!`) should be emitted.
#[inline]
pub fn verbose() -> bool {
    options().verbose
}
