//! Runtime configuration.
//!
//! The checking mode is set via the `FRANKENPTHREAD_MODE` environment variable:
//! - `strict` (default): POSIX behavior. Operations whose outcome POSIX leaves
//!   undefined (unlocking a default-type mutex from a non-owner) follow the
//!   permissive host behavior.
//! - `hardened`: ownership is verified for every mutex type and for condition
//!   waits; violations report `WrongState(NotOwner)`.
//!
//! Sizing knobs are read once:
//! - `FRANKENPTHREAD_STACK_SIZE`: default stack size for created threads.
//! - `FRANKENPTHREAD_MAX_HANDLES`: upper bound on live host wait objects.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, Ordering};

/// Default thread stack size: 2 MiB.
pub const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Default budget of live host wait objects.
pub const DEFAULT_MAX_HANDLES: usize = 1 << 20;

/// Ownership checking mode.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncMode {
    /// POSIX behavior; undefined cases take the permissive host path.
    #[default]
    Strict,
    /// Ownership verified for every lock type.
    Hardened,
}

impl SyncMode {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "hardened" | "checked" | "strict-owner" => Self::Hardened,
            _ => Self::Strict,
        }
    }

    /// Returns true if every unlock must come from the owner.
    #[must_use]
    pub const fn checks_ownership(self) -> bool {
        matches!(self, Self::Hardened)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Hardened => "hardened",
        }
    }
}

// Atomic cache: 0=unresolved, 1=Strict, 2=Hardened, 255=resolving.
// Resolution never blocks, so a lock taken while the environment is being read
// sees Strict instead of waiting on itself.
static CACHED_MODE: AtomicU8 = AtomicU8::new(0);

const MODE_UNRESOLVED: u8 = 0;
const MODE_STRICT: u8 = 1;
const MODE_HARDENED: u8 = 2;
const MODE_RESOLVING: u8 = 255;

fn mode_to_u8(mode: SyncMode) -> u8 {
    match mode {
        SyncMode::Strict => MODE_STRICT,
        SyncMode::Hardened => MODE_HARDENED,
    }
}

fn u8_to_mode(v: u8) -> SyncMode {
    match v {
        MODE_HARDENED => SyncMode::Hardened,
        _ => SyncMode::Strict,
    }
}

/// Get the configured mode (reads env var on first call, caches thereafter).
#[must_use]
pub fn sync_mode() -> SyncMode {
    let cached = CACHED_MODE.load(Ordering::Relaxed);
    if cached != MODE_UNRESOLVED && cached != MODE_RESOLVING {
        return u8_to_mode(cached);
    }
    if cached == MODE_RESOLVING {
        return SyncMode::Strict;
    }

    if CACHED_MODE
        .compare_exchange(
            MODE_UNRESOLVED,
            MODE_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        let v = CACHED_MODE.load(Ordering::Relaxed);
        return if v != MODE_UNRESOLVED && v != MODE_RESOLVING {
            u8_to_mode(v)
        } else {
            SyncMode::Strict
        };
    }

    let mode = std::env::var("FRANKENPTHREAD_MODE")
        .map(|v| SyncMode::from_str_loose(&v))
        .unwrap_or_default();
    CACHED_MODE.store(mode_to_u8(mode), Ordering::Release);
    mode
}

/// Override the cached mode. Returns the previous mode.
pub fn set_sync_mode(mode: SyncMode) -> SyncMode {
    let prev = CACHED_MODE.swap(mode_to_u8(mode), Ordering::SeqCst);
    u8_to_mode(prev)
}

/// Sizing parameters resolved once per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub default_stack_size: usize,
    pub max_native_handles: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_stack_size: DEFAULT_STACK_SIZE,
            max_native_handles: DEFAULT_MAX_HANDLES,
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            default_stack_size: lookup("FRANKENPTHREAD_STACK_SIZE")
                .and_then(|raw| parse_size(&raw))
                .unwrap_or(defaults.default_stack_size),
            max_native_handles: lookup("FRANKENPTHREAD_MAX_HANDLES")
                .and_then(|raw| parse_size(&raw))
                .filter(|&n| n > 0)
                .unwrap_or(defaults.max_native_handles),
        }
    }
}

/// Parse a byte count: decimal, `0x` hex, or a `k`/`m` suffix.
fn parse_size(raw: &str) -> Option<usize> {
    let s = raw.trim().to_ascii_lowercase();
    if let Some(hex) = s.strip_prefix("0x") {
        return usize::from_str_radix(hex, 16).ok();
    }
    let (digits, scale) = match s.as_bytes().last() {
        Some(b'k') => (&s[..s.len() - 1], 1024),
        Some(b'm') => (&s[..s.len() - 1], 1024 * 1024),
        _ => (s.as_str(), 1),
    };
    digits.parse::<usize>().ok()?.checked_mul(scale)
}

static RUNTIME: OnceLock<RuntimeConfig> = OnceLock::new();

/// Process-wide sizing configuration.
#[must_use]
pub fn runtime() -> &'static RuntimeConfig {
    RUNTIME.get_or_init(RuntimeConfig::from_env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_modes() {
        assert_eq!(SyncMode::from_str_loose("strict"), SyncMode::Strict);
        assert_eq!(SyncMode::from_str_loose("HARDENED"), SyncMode::Hardened);
        assert_eq!(SyncMode::from_str_loose("checked"), SyncMode::Hardened);
        assert_eq!(SyncMode::from_str_loose("bogus"), SyncMode::Strict);
    }

    #[test]
    fn ownership_checks_only_in_hardened() {
        assert!(!SyncMode::Strict.checks_ownership());
        assert!(SyncMode::Hardened.checks_ownership());
    }

    #[test]
    fn parse_size_forms() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("64k"), Some(64 * 1024));
        assert_eq!(parse_size("2M"), Some(2 * 1024 * 1024));
        assert_eq!(parse_size("0x1000"), Some(4096));
        assert_eq!(parse_size("lots"), None);
    }

    #[test]
    fn runtime_config_from_lookup() {
        let cfg = RuntimeConfig::from_lookup(|name| match name {
            "FRANKENPTHREAD_STACK_SIZE" => Some("256k".to_string()),
            "FRANKENPTHREAD_MAX_HANDLES" => Some("0".to_string()),
            _ => None,
        });
        assert_eq!(cfg.default_stack_size, 256 * 1024);
        assert_eq!(cfg.max_native_handles, DEFAULT_MAX_HANDLES);
    }

    #[test]
    fn unset_environment_gives_defaults() {
        assert_eq!(RuntimeConfig::from_lookup(|_| None), RuntimeConfig::default());
    }
}
