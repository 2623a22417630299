//! Error number definitions.
//!
//! The `<errno.h>` values that the threading primitives report. Every
//! operation returns its error directly; there is no thread-local errno.

/// Well-known errno constants.
pub const EPERM: i32 = 1;
pub const ENOENT: i32 = 2;
pub const ESRCH: i32 = 3;
pub const EINTR: i32 = 4;
pub const EAGAIN: i32 = 11;
pub const ENOMEM: i32 = 12;
pub const EBUSY: i32 = 16;
pub const EEXIST: i32 = 17;
pub const EINVAL: i32 = 22;
pub const EDEADLK: i32 = 35;
pub const EOVERFLOW: i32 = 75;
pub const ENOTSUP: i32 = 95;
pub const ETIMEDOUT: i32 = 110;

/// Symbolic name for an errno value, for reports and logs.
#[must_use]
pub const fn errno_name(value: i32) -> &'static str {
    match value {
        0 => "OK",
        EPERM => "EPERM",
        ENOENT => "ENOENT",
        ESRCH => "ESRCH",
        EINTR => "EINTR",
        EAGAIN => "EAGAIN",
        ENOMEM => "ENOMEM",
        EBUSY => "EBUSY",
        EEXIST => "EEXIST",
        EINVAL => "EINVAL",
        EDEADLK => "EDEADLK",
        EOVERFLOW => "EOVERFLOW",
        ENOTSUP => "ENOTSUP",
        ETIMEDOUT => "ETIMEDOUT",
        _ => "EUNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linux_values() {
        assert_eq!(EBUSY, 16);
        assert_eq!(EDEADLK, 35);
        assert_eq!(ETIMEDOUT, 110);
    }

    #[test]
    fn names_cover_reported_values() {
        assert_eq!(errno_name(EPERM), "EPERM");
        assert_eq!(errno_name(ETIMEDOUT), "ETIMEDOUT");
        assert_eq!(errno_name(0), "OK");
        assert_eq!(errno_name(9999), "EUNKNOWN");
    }
}
