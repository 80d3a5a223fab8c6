#![forbid(unsafe_code)]
//! Error types for AgateFS.
//!
//! # Error Taxonomy
//!
//! | Class | Variant(s) | Behavior |
//! |-------|------------|----------|
//! | Corruption | `Corruption` | block verification or invariant failure; fatal to the current operation |
//! | Resource exhaustion | `NoSpace` | no free block for a split, or no suitable extent; returned to the caller |
//! | I/O failure | `Io` | propagated verbatim from the block device; no internal retry |
//! | Format | `Format`, `Parse` | structurally invalid input (bad geometry, bad arguments) |
//! | Name lookup | `NotFound`, `Exists`, `NameTooLong` | directory-level outcomes |
//!
//! Every engine function returns a [`Result`]; on error the function has
//! already released any cursor levels or staged blocks it newly acquired.
//! There is no exception-based control flow anywhere in the workspace.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`AgfsError::to_errno`].
//! The mapping is exhaustive (no wildcard arms) so adding a new variant is a
//! compile error until its errno is assigned.

use thiserror::Error;

/// Unified error type for all AgateFS engine operations.
#[derive(Debug, Error)]
pub enum AgfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata corruption detected at a known device block.
    ///
    /// Raised by block verification (bad magic, bad level, record count out
    /// of bounds, insane sibling pointers) and by structural invariant
    /// violations. The `block` field enables repair triage.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Structurally invalid input or geometry (not on-disk corruption).
    #[error("invalid format: {0}")]
    Format(String),

    /// Parse-layer error surfaced to the caller.
    ///
    /// Carries the string form of a `ParseError` from `agfs-types`. Prefer
    /// `Corruption` when the device block is known.
    #[error("parse error: {0}")]
    Parse(String),

    /// No free blocks available for a split/growth, or no suitable extent.
    #[error("no space left on device")]
    NoSpace,

    /// Named object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Target name already exists.
    #[error("entry exists")]
    Exists,

    /// Name exceeds the directory's name length limit.
    #[error("name too long")]
    NameTooLong,
}

impl AgfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive — every variant has an explicit arm.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::Parse(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::NameTooLong => libc::ENAMETOOLONG,
        }
    }
}

/// Result alias using `AgfsError`.
pub type Result<T> = std::result::Result<T, AgfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(AgfsError, libc::c_int)> = vec![
            (AgfsError::Io(std::io::Error::other("test")), libc::EIO),
            (
                AgfsError::Corruption {
                    block: 0,
                    detail: "test".into(),
                },
                libc::EIO,
            ),
            (AgfsError::Format("test".into()), libc::EINVAL),
            (AgfsError::Parse("test".into()), libc::EINVAL),
            (AgfsError::NoSpace, libc::ENOSPC),
            (AgfsError::NotFound("x".into()), libc::ENOENT),
            (AgfsError::Exists, libc::EEXIST),
            (AgfsError::NameTooLong, libc::ENAMETOOLONG),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        let err = AgfsError::Io(raw);
        assert_eq!(err.to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = AgfsError::Corruption {
            block: 42,
            detail: "bad magic".into(),
        };
        assert_eq!(err.to_string(), "corrupt metadata at block 42: bad magic");
        assert_eq!(AgfsError::NoSpace.to_string(), "no space left on device");
    }
}
