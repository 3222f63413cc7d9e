//! Start-up configuration, from code or from `GUARDALLOC_*` environment
//! variables.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::alloc::{dispatch::BackendKind, usage::PEAK_UPDATE_THRESHOLD};

pub const ENV_BACKEND: &str = "GUARDALLOC_BACKEND";
pub const ENV_FAIL_ON_LEAK: &str = "GUARDALLOC_FAIL_ON_LEAK";
pub const ENV_IGNORE_LEAKS: &str = "GUARDALLOC_IGNORE_LEAKS";
pub const ENV_DEBUG_FILL: &str = "GUARDALLOC_DEBUG_FILL";
pub const ENV_PEAK_THRESHOLD: &str = "GUARDALLOC_PEAK_THRESHOLD";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemConfig {
    /// Backend the dispatch slot starts on
    pub backend: BackendKind,
    /// Abort when the leak detector finds live blocks
    pub fail_on_leak: bool,
    /// Skip the leak report entirely
    pub ignore_leaks: bool,
    /// Paint fresh guarded payloads with `0xFF`
    pub debug_fill: bool,
    /// Growth in bytes between peak refreshes
    pub peak_threshold: usize,
}

impl MemConfig {
    /// Guarded, failing on leaks and painting memory in debug builds. Lockfree
    /// and quiet otherwise.
    pub const fn new() -> Self {
        let debug = cfg!(debug_assertions);
        Self {
            backend: BackendKind::default_for_build(),
            fail_on_leak: debug,
            ignore_leaks: false,
            debug_fill: debug,
            peak_threshold: PEAK_UPDATE_THRESHOLD,
        }
    }

    /// The defaults, overridden by whatever `GUARDALLOC_*` variables are set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// [`from_env()`](Self::from_env) with a custom variable source.
    /// Unparseable values are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::new();
        if let Some(value) = lookup(ENV_BACKEND) {
            match value.parse() {
                Ok(backend) => config.backend = backend,
                Err(e) => log::warn!("{ENV_BACKEND}: {e}"),
            }
        }
        for (key, field) in [
            (ENV_FAIL_ON_LEAK, &mut config.fail_on_leak),
            (ENV_IGNORE_LEAKS, &mut config.ignore_leaks),
            (ENV_DEBUG_FILL, &mut config.debug_fill),
        ] {
            if let Some(value) = lookup(key) {
                match parse_flag(&value) {
                    Some(flag) => *field = flag,
                    None => log::warn!("{key}: expected a boolean, got {value:?}"),
                }
            }
        }
        if let Some(value) = lookup(ENV_PEAK_THRESHOLD) {
            match value.trim().parse() {
                Ok(threshold) => config.peak_threshold = threshold,
                Err(e) => log::warn!("{ENV_PEAK_THRESHOLD}: {e} ({value:?})"),
            }
        }
        config
    }
}

impl Default for MemConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// The environment configuration, read once per process.
pub static ENV_CONFIG: Lazy<MemConfig> = Lazy::new(|| {
    let config = MemConfig::from_env();
    log::debug!("allocator configuration from environment: {config:?}");
    config
});
