// Copyright (c) latticedb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

use std::error::Error;
use std::path::Path;

/// Run `f` against a scratch directory that is removed afterwards, even
/// when the closure fails.
pub fn temp_dir<F, R>(f: F) -> Result<R, Box<dyn Error>>
where
    F: FnOnce(&Path) -> Result<R, Box<dyn Error>>,
{
    let dir = tempfile::TempDir::new()?;
    let result = f(dir.path());
    dir.close()?;
    result
}

/// A scratch path inside a temp dir, handed out with its guard so the
/// directory lives as long as the caller keeps it.
pub fn temp_store(name: &str) -> (tempfile::TempDir, String) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name).to_string_lossy().into_owned();
    (dir, path)
}
