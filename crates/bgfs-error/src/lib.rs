#![forbid(unsafe_code)]
//! Error types for bgfs.
//!
//! # Error Taxonomy
//!
//! bgfs uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `bgfs-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `BgfsError` | `bgfs-error` (this crate) | Errors returned by the allocator, deallocator and truncation engine |
//!
//! `bgfs-error` is independent of `bgfs-types` so the two can be used without
//! a dependency cycle. The `ParseError` → `BgfsError` conversion lives at the
//! boundary that needs it (`bgfs-alloc` mount path).
//!
//! ## Error classes
//!
//! | Class | Variants | Recoverable | Policy |
//! |-------|----------|-------------|--------|
//! | NoSpace | `NoSpace` | yes | returned to the caller |
//! | IoError | `Io` | yes | logged, affected structure cleared, operation terminates |
//! | CorruptionFatal | `Corruption`, `Halted` | no | the filesystem state stops accepting mutations |
//! | Caller error | `InvalidBlock`, `DoubleFree` | yes | returned to the caller, state untouched |
//! | Mount-time | `Format`, `Parse`, `InvalidGeometry`, `UnsupportedBlockSize` | n/a | volume refused |
//!
//! ## errno Mapping
//!
//! Every `BgfsError` variant maps to exactly one POSIX errno via
//! [`BgfsError::to_errno`]. The mapping has no wildcard arm so a new variant
//! does not compile until its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Corruption` | `EIO` |
//! | `Halted` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `Parse` | `EINVAL` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `UnsupportedBlockSize` | `EOPNOTSUPP` |
//! | `NoSpace` | `ENOSPC` |
//! | `InvalidBlock` | `EINVAL` |
//! | `DoubleFree` | `EINVAL` |
//! | `RetryExhausted` | `EAGAIN` |
//! | `ReadOnly` | `EROFS` |

use thiserror::Error;

/// Unified error type for all bgfs operations.
#[derive(Debug, Error)]
pub enum BgfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata invariant violated at a known block.
    ///
    /// Raising this puts the owning filesystem state into the halted mode:
    /// no further bitmap or counter mutation is attempted on untrusted
    /// metadata.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// A mutation was attempted after the filesystem halted on corruption.
    #[error("filesystem halted after corruption: {0}")]
    Halted(String),

    /// Invalid on-disk format (bad magic, inconsistent superblock).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced to the user.
    ///
    /// Carries the string form of a `ParseError` from `bgfs-types`. Prefer
    /// `Corruption` when the block number is known.
    #[error("parse error: {0}")]
    Parse(String),

    /// On-disk geometry is invalid or out of the supported range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// The volume's block size is outside what this build supports.
    #[error("unsupported block size: {0}")]
    UnsupportedBlockSize(String),

    /// No free block available, or only reserved blocks remain and the
    /// caller is not privileged.
    #[error("no space left on device")]
    NoSpace,

    /// The caller handed in a block that is not a data block of this volume.
    #[error("invalid block {block}: {detail}")]
    InvalidBlock { block: u64, detail: String },

    /// The block was already free. Only produced when double frees are
    /// configured to be rejected.
    #[error("double free of block {block}")]
    DoubleFree { block: u64 },

    /// A bounded truncate gave up while buffers were still busy.
    #[error("truncate still busy after {passes} passes")]
    RetryExhausted { passes: u32 },

    /// Filesystem or device is read-only and a write was attempted.
    #[error("read-only filesystem")]
    ReadOnly,
}

impl BgfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// Policy notes:
    /// - `Halted` → `EIO`: the mount is unusable, same as the corruption that
    ///   caused it.
    /// - `InvalidBlock` / `DoubleFree` → `EINVAL`: the caller passed a block
    ///   that cannot be freed.
    /// - `RetryExhausted` → `EAGAIN`: nothing was lost, the caller may retry.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::Halted(_) => libc::EIO,
            Self::Format(_) | Self::Parse(_) | Self::InvalidGeometry(_) => libc::EINVAL,
            Self::UnsupportedBlockSize(_) => libc::EOPNOTSUPP,
            Self::NoSpace => libc::ENOSPC,
            Self::InvalidBlock { .. } | Self::DoubleFree { .. } => libc::EINVAL,
            Self::RetryExhausted { .. } => libc::EAGAIN,
            Self::ReadOnly => libc::EROFS,
        }
    }

    /// Whether this error belongs to the CorruptionFatal class.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corruption { .. } | Self::Halted(_))
    }
}

/// Result alias using `BgfsError`.
pub type Result<T> = std::result::Result<T, BgfsError>;
