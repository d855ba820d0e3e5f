//! Runtime configuration.
//!
//! The crate reads its configuration once, lazily, from the environment.
//! Higher layers that carry their own configuration system can set these
//! variables before the first fiber is created.

use once_cell::sync::Lazy;

/// Default fiber stack size: 128 KiB.
pub const DEFAULT_FIBER_STACK_SIZE: usize = 128 * 1024;

/// Tunables consumed by the runtime.
#[derive(Debug, Clone)]
pub struct Config {
    /// Stack size in bytes for fibers created without an explicit size.
    ///
    /// Environment: `CORIO_FIBER_STACK_SIZE`.
    pub fiber_stack_size: usize,
}

static CONFIG: Lazy<Config> = Lazy::new(|| Config {
    fiber_stack_size: env_usize("CORIO_FIBER_STACK_SIZE", DEFAULT_FIBER_STACK_SIZE),
});

/// The process-wide configuration, initialized on first access.
#[inline(always)]
pub fn config() -> &'static Config {
    &CONFIG
}

fn env_usize(name: &str, default: usize) -> usize {
    match std::env::var(name) {
        Ok(v) => match v.parse() {
            Ok(n) if n > 0 => n,
            _ => {
                log::warn!("ignoring invalid {name}={v:?}");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stack_size() {
        assert_eq!(config().fiber_stack_size, DEFAULT_FIBER_STACK_SIZE);
    }
}
