// Copyright (c) latticedb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

pub mod encoding;
mod error;
mod key_info;
mod value;

pub use error::{Error, Result};
pub use key_info::{KeyInfo, SortOrder};
pub use value::Value;
