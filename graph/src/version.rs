// Copyright 2026 Graft project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::fmt;

///
/// A totally pre-ordered token stamped on every stored value, used to decide whether any input of
/// a node has changed since its value was computed.
///
/// Two realizations share the enum:
///   * `Minimal` - strictly less than everything else: the version of every freshly created
///     entry, before it has ever completed.
///   * `At(n)` - a monotone integer version, advanced by change injection and by the start of a
///     new evaluation session.
///
/// The version stored on a completed entry is the version at which its value last _changed_: a
/// re-run that produces an equal value does not re-stamp the entry. Dependents rely on this to
/// avoid recomputing when an input was rebuilt but "didn't really" change.
///
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Version {
    Minimal,
    At(u64),
}

impl Version {
    ///
    /// The version of an entry which has never completed.
    ///
    pub fn initial() -> Version {
        Version::Minimal
    }

    ///
    /// True iff self is at most the given version in the total pre-order.
    ///
    /// A dependency whose version is `at_most` the version of a dependent entry has not changed
    /// since that entry last computed its value.
    ///
    pub fn at_most(&self, other: &Version) -> bool {
        match (self, other) {
            (Version::Minimal, _) => true,
            (_, Version::Minimal) => false,
            (Version::At(s), Version::At(o)) => s <= o,
        }
    }

    pub fn next(self) -> Version {
        match self {
            Version::Minimal => Version::At(0),
            Version::At(n) => Version::At(n + 1),
        }
    }

    ///
    /// The version to stamp on a freshly produced output: the current graph version when the
    /// output changed, and the already-stored version when it did not. Keeping the old stamp on
    /// an equal output is what lets dependents pass their own `at_most` checks and skip
    /// recomputing.
    ///
    pub(crate) fn stamp(self, changed: bool, current: Version) -> Version {
        if changed {
            current
        } else {
            self
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Version::Minimal => write!(f, "v~"),
            Version::At(n) => write!(f, "v{n}"),
        }
    }
}
