//! Decides which SQLite failures mean the file itself is damaged.

use std::os::raw::c_int;

use rusqlite::ffi;

use crate::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The file is corrupt, unreadable, or the medium is full: quarantine and recreate.
    Fatal,
    /// Constraint violations, lock contention, missing rows and the like: report locally.
    Transient,
}

/// Classify a raw result code, preferring the extended code when one is known.
pub fn is_fatal_code(result_code: c_int, extended_code: Option<c_int>) -> bool {
    let primary = match extended_code {
        Some(extended) if extended != 0 => extended & 0xff,
        _ => result_code & 0xff,
    };
    matches!(
        primary,
        ffi::SQLITE_CORRUPT | ffi::SQLITE_NOTADB | ffi::SQLITE_IOERR | ffi::SQLITE_FULL
    )
}

pub fn classify(err: &rusqlite::Error) -> ErrorClass {
    match err {
        // rusqlite fills extended_code from the connection that produced the error.
        rusqlite::Error::SqliteFailure(ffi_err, _) => {
            let by_code = is_fatal_code(ffi_err.extended_code, Some(ffi_err.extended_code));
            let by_kind = matches!(
                ffi_err.code,
                ffi::ErrorCode::DatabaseCorrupt
                    | ffi::ErrorCode::NotADatabase
                    | ffi::ErrorCode::SystemIoFailure
                    | ffi::ErrorCode::DiskFull
            );
            if by_code || (ffi_err.extended_code == 0 && by_kind) {
                ErrorClass::Fatal
            } else {
                ErrorClass::Transient
            }
        }
        _ => ErrorClass::Transient,
    }
}

pub fn is_fatal(err: &rusqlite::Error) -> bool {
    classify(err) == ErrorClass::Fatal
}

pub fn is_fatal_storage(err: &StorageError) -> bool {
    err.sqlite().map(is_fatal).unwrap_or(false)
}

/// The most specific code carried by an error, for logs and quarantine reason tags.
pub fn error_code(err: &rusqlite::Error) -> Option<c_int> {
    err.sqlite_error().map(|ffi_err| ffi_err.extended_code)
}
