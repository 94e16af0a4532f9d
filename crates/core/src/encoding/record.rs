// Copyright (c) latticedb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

use crate::{Error, Result, Value};

/// Encode row data as a self-describing record. Unlike keys, record bytes
/// carry no ordering contract, so the serde encoding is fine here. An
/// optional permutation reorders the fields at encode time.
pub fn encode_record(fields: &[Value], permutation: Option<&[usize]>) -> Result<Vec<u8>> {
    let values: Vec<&Value> = match permutation {
        Some(perm) => perm
            .iter()
            .map(|&i| {
                fields.get(i).ok_or_else(|| {
                    Error::misuse(format!("record permutation index {i} out of range"))
                })
            })
            .collect::<Result<_>>()?,
        None => fields.iter().collect(),
    };
    bincode::serialize(&values).map_err(|e| Error::corrupt(format!("record encode: {e}")))
}

/// Decode a full record back into its field values.
pub fn decode_record(buf: &[u8]) -> Result<Vec<Value>> {
    bincode::deserialize(buf).map_err(|e| Error::corrupt(format!("record decode: {e}")))
}

/// Decode a single column of a record. Columns past the end of the stored
/// record read as the supplied default (NULL when absent), which is how
/// rows written before an ALTER TABLE keep working.
pub fn decode_column(buf: &[u8], idx: usize, default: Option<&Value>) -> Result<Value> {
    let mut values = decode_record(buf)?;
    if idx < values.len() {
        Ok(values.swap_remove(idx))
    } else {
        Ok(default.cloned().unwrap_or(Value::Null))
    }
}
