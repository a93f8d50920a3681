//! Error types for bucketdb.
//!
//! Expected data outcomes (`NotFound`, `Expired`, `VersionConflict`,
//! `EndOfRange`) travel through the same `Error` type as engine failures;
//! callers branch on [`Error::code`] rather than on the variant when all they
//! need is the wire-level result code.

use std::fmt;

/// Result code reported to the request layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// The operation completed
    Success,
    /// Engine, routing, lock or configuration failure
    GenericFailure,
    /// No record stored under the key
    DataNotFound,
    /// A record exists but its expire time has passed
    DataExpired,
    /// The caller's expected version does not match the stored one
    VersionConflict,
    /// A range scan left its target bucket/area
    EndOfRange,
}

/// The main error type for bucketdb operations.
#[derive(Debug)]
pub enum Error {
    /// A lock was poisoned (internal error)
    LockPoisoned,

    /// I/O error
    Io(std::io::Error),

    /// Serialization/deserialization error
    Serialization(String),

    /// Embedded engine error
    Storage(String),

    /// On-disk structure failed validation
    Corruption(String),

    /// Invalid operation
    InvalidOperation(String),

    /// Configuration rejected at construction time
    InvalidConfig(String),

    /// Stored record shorter than the metadata header
    CorruptRecord {
        /// Length of the blob that failed to decode
        len: usize,
    },

    /// No record for the key
    NotFound,

    /// Record present but expired
    Expired,

    /// Expected version differs from the stored version
    VersionConflict {
        /// Version supplied by the caller
        expected: u32,
        /// Version found in the store
        stored: u32,
    },

    /// Range scan reached the end of its bucket/area
    EndOfRange,

    /// The bucket is not served by any instance
    BucketNotOwned(u32),

    /// `get_next_items` called without an active scan
    ScanNotStarted,
}

impl Error {
    /// Maps the error onto the result-code taxonomy.
    pub fn code(&self) -> ResultCode {
        match self {
            Error::NotFound => ResultCode::DataNotFound,
            Error::Expired => ResultCode::DataExpired,
            Error::VersionConflict { .. } => ResultCode::VersionConflict,
            Error::EndOfRange => ResultCode::EndOfRange,
            _ => ResultCode::GenericFailure,
        }
    }

    /// True for outcomes callers routinely branch on; these are not logged
    /// as failures.
    pub fn is_expected(&self) -> bool {
        self.code() != ResultCode::GenericFailure
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::LockPoisoned => write!(f, "Lock poisoned"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Storage(msg) => write!(f, "Storage error: {}", msg),
            Error::Corruption(msg) => write!(f, "Corruption: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            Error::InvalidConfig(msg) => write!(f, "Invalid config: {}", msg),
            Error::CorruptRecord { len } => {
                write!(f, "Corrupt record: {} bytes is shorter than the header", len)
            }
            Error::NotFound => write!(f, "Data not found"),
            Error::Expired => write!(f, "Data expired"),
            Error::VersionConflict { expected, stored } => write!(
                f,
                "Version conflict: expected {}, stored {}",
                expected, stored
            ),
            Error::EndOfRange => write!(f, "End of range"),
            Error::BucketNotOwned(bucket) => write!(f, "Bucket {} not owned", bucket),
            Error::ScanNotStarted => write!(f, "Scan not started"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

/// A specialized `Result` type for bucketdb operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_outcomes_keep_their_codes() {
        assert_eq!(Error::NotFound.code(), ResultCode::DataNotFound);
        assert_eq!(Error::Expired.code(), ResultCode::DataExpired);
        assert_eq!(
            Error::VersionConflict {
                expected: 1,
                stored: 2
            }
            .code(),
            ResultCode::VersionConflict
        );
        assert_eq!(Error::EndOfRange.code(), ResultCode::EndOfRange);
        assert!(Error::Expired.is_expected());
    }

    #[test]
    fn test_failures_collapse_to_generic() {
        assert_eq!(Error::LockPoisoned.code(), ResultCode::GenericFailure);
        assert_eq!(Error::BucketNotOwned(3).code(), ResultCode::GenericFailure);
        assert_eq!(
            Error::CorruptRecord { len: 2 }.code(),
            ResultCode::GenericFailure
        );
        assert!(!Error::Storage("disk".into()).is_expected());
    }

    #[test]
    fn test_io_error_conversion() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("boom"));
    }
}
