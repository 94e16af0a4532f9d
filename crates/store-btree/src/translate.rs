// Copyright (c) latticedb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

use latticedb_core::Error;
use rusqlite::ErrorCode;

/// The one place SQLite result codes become taxonomy errors. Every native
/// call in this backend funnels its failure through here, so a given code
/// cannot map differently at different call sites.
pub(crate) fn translate(op: &'static str, err: rusqlite::Error) -> Error {
    match err {
        rusqlite::Error::QueryReturnedNoRows => Error::NotFound,
        rusqlite::Error::SqliteFailure(code, message) => {
            let detail = match message {
                Some(m) => format!("{op}: {m}"),
                None => format!("{op}: {code}"),
            };
            match code.code {
                ErrorCode::DatabaseBusy => Error::Busy(detail),
                ErrorCode::DatabaseLocked => Error::Locked(detail),
                ErrorCode::ReadOnly => Error::ReadOnly(detail),
                ErrorCode::ConstraintViolation => Error::Constraint(detail),
                ErrorCode::DiskFull | ErrorCode::TooBig => Error::Full(detail),
                ErrorCode::OutOfMemory => Error::NoMem(detail),
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => Error::Corrupt(detail),
                ErrorCode::TypeMismatch => Error::Mismatch,
                ErrorCode::ApiMisuse => Error::Misuse(detail),
                ErrorCode::NotFound => Error::NotFound,
                _ => Error::Other(detail),
            }
        }
        other => Error::Other(format!("{op}: {other}")),
    }
}
