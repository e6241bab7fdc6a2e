// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Operation mode flags.
//
// Every backend operation takes a `Mode`: a 32-bit bitset that parameterizes
// its behavior. Backends advertise which bits they support via
// `DatabaseBackend::supports`; a call whose mode contains any unsupported
// bit fails with `StorageError::ModeUnsupported` before touching data.

use std::fmt;
use std::ops::BitOr;

/// A bitset of operation flags.
///
/// Modes combine with `|`:
///
/// ```
/// use coffer_storage::mode::Mode;
///
/// let mode = Mode::WAIT | Mode::CONSUME;
/// assert!(mode.contains(Mode::WAIT));
/// assert!(!mode.contains(Mode::APPEND));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Mode(u32);

impl Mode {
    /// No flags set.
    pub const DEFAULT: Mode = Mode(0);

    /// In listings, include `from_key` itself when the iterator lands
    /// exactly on it.
    pub const INCLUSIVE: Mode = Mode(1 << 0);

    /// In `put`, concatenate to the existing value instead of replacing it.
    pub const APPEND: Mode = Mode(1 << 1);

    /// In `get`/`fetch`, erase the keys after the scan completes.
    pub const CONSUME: Mode = Mode(1 << 2);

    /// On a missing key in `exists`/`length`/`get`/`fetch`/`erase`,
    /// suspend until the key appears (or the wait times out).
    pub const WAIT: Mode = Mode(1 << 3);

    /// On a successful `put`, wake tasks waiting on the affected keys.
    pub const NOTIFY: Mode = Mode(1 << 4);

    /// In `put`, skip keys that already exist. With a single-key batch the
    /// skip is reported as `KeyExists` instead.
    pub const NEW_ONLY: Mode = Mode(1 << 5);

    /// In `put`, only overwrite keys that already exist. With a single-key
    /// batch the skip is reported as `NotFound` instead.
    pub const EXIST_ONLY: Mode = Mode(1 << 6);

    /// Disable filtering in listings.
    pub const NO_PREFIX: Mode = Mode(1 << 7);

    /// In listings, report key sizes but do not write key bytes.
    pub const IGNORE_KEYS: Mode = Mode(1 << 8);

    /// Like `IGNORE_KEYS`, but the bytes of the last emitted key are still
    /// written so the caller can resume iteration from it.
    pub const KEEP_LAST: Mode = Mode(1 << 8 | 1 << 9);

    /// With `NOTIFY`, only newly inserted keys trigger notifications;
    /// overwrites stay silent.
    pub const UPDATE_NEW: Mode = Mode(1 << 10);

    /// In listings, treat the filter argument as a suffix instead of a
    /// prefix.
    pub const SUFFIX: Mode = Mode(1 << 11);

    // Feature bits reserved for extended operations. Defined so callers can
    // round-trip them; none of the shipped backends support them.
    pub const NO_RDMA: Mode = Mode(1 << 12);
    pub const LIB_FILTER: Mode = Mode(1 << 13);
    pub const LUA_FILTER: Mode = Mode(1 << 14);
    pub const IGNORE_DOCS: Mode = Mode(1 << 15);
    pub const FILTER_VALUE: Mode = Mode(1 << 16);

    /// Build a mode from raw bits.
    pub const fn from_bits(bits: u32) -> Mode {
        Mode(bits)
    }

    /// The raw bit pattern.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set in `self`.
    pub const fn contains(self, other: Mode) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether every bit of `self` is set in `supported`. This is the test
    /// `DatabaseBackend::supports` implementations perform.
    pub const fn is_subset_of(self, supported: Mode) -> bool {
        supported.contains(self)
    }

    /// The bits of `self` that are missing from `supported`.
    pub const fn difference(self, supported: Mode) -> Mode {
        Mode(self.0 & !supported.0)
    }

    /// Remove the bits of `other` from `self`.
    pub const fn without(self, other: Mode) -> Mode {
        Mode(self.0 & !other.0)
    }
}

impl BitOr for Mode {
    type Output = Mode;

    fn bitor(self, rhs: Mode) -> Mode {
        Mode(self.0 | rhs.0)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return write!(f, "DEFAULT");
        }
        const NAMES: &[(Mode, &str)] = &[
            (Mode::INCLUSIVE, "INCLUSIVE"),
            (Mode::APPEND, "APPEND"),
            (Mode::CONSUME, "CONSUME"),
            (Mode::WAIT, "WAIT"),
            (Mode::NOTIFY, "NOTIFY"),
            (Mode::NEW_ONLY, "NEW_ONLY"),
            (Mode::EXIST_ONLY, "EXIST_ONLY"),
            (Mode::NO_PREFIX, "NO_PREFIX"),
            (Mode::KEEP_LAST, "KEEP_LAST"),
            (Mode::IGNORE_KEYS, "IGNORE_KEYS"),
            (Mode::UPDATE_NEW, "UPDATE_NEW"),
            (Mode::SUFFIX, "SUFFIX"),
            (Mode::NO_RDMA, "NO_RDMA"),
            (Mode::LIB_FILTER, "LIB_FILTER"),
            (Mode::LUA_FILTER, "LUA_FILTER"),
            (Mode::IGNORE_DOCS, "IGNORE_DOCS"),
            (Mode::FILTER_VALUE, "FILTER_VALUE"),
        ];
        let mut remaining = self.0;
        let mut first = true;
        for (mode, name) in NAMES {
            if remaining & mode.0 == mode.0 {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                remaining &= !mode.0;
                first = false;
            }
        }
        if remaining != 0 {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "{remaining:#x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_and_subset() {
        let mode = Mode::WAIT | Mode::CONSUME;
        assert!(mode.contains(Mode::WAIT));
        assert!(mode.contains(Mode::CONSUME));
        assert!(!mode.contains(Mode::APPEND));

        let supported = Mode::WAIT | Mode::CONSUME | Mode::APPEND;
        assert!(mode.is_subset_of(supported));
        assert!(!(mode | Mode::SUFFIX).is_subset_of(supported));
    }

    #[test]
    fn test_keep_last_contains_ignore_keys() {
        assert!(Mode::KEEP_LAST.contains(Mode::IGNORE_KEYS));
        assert!(!Mode::IGNORE_KEYS.contains(Mode::KEEP_LAST));
    }

    #[test]
    fn test_difference() {
        let mode = Mode::WAIT | Mode::SUFFIX;
        let supported = Mode::WAIT;
        assert_eq!(mode.difference(supported), Mode::SUFFIX);
    }

    #[test]
    fn test_without() {
        let mode = Mode::WAIT | Mode::CONSUME;
        assert_eq!(mode.without(Mode::WAIT), Mode::CONSUME);
        assert_eq!(mode.without(Mode::APPEND), mode);
    }

    #[test]
    fn test_display() {
        assert_eq!(Mode::DEFAULT.to_string(), "DEFAULT");
        assert_eq!((Mode::WAIT | Mode::CONSUME).to_string(), "CONSUME|WAIT");
        // KEEP_LAST absorbs its IGNORE_KEYS half.
        assert_eq!(Mode::KEEP_LAST.to_string(), "KEEP_LAST");
        assert_eq!(
            (Mode::IGNORE_KEYS | Mode::SUFFIX).to_string(),
            "IGNORE_KEYS|SUFFIX"
        );
    }

    #[test]
    fn test_from_bits_roundtrip() {
        let mode = Mode::INCLUSIVE | Mode::NOTIFY;
        assert_eq!(Mode::from_bits(mode.bits()), mode);
    }
}
