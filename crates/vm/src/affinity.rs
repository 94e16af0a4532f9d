// Copyright (c) latticedb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

use latticedb_core::Value;

/// Column affinity applied to register values before key or record
/// encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    None,
    Text,
    Numeric,
    Integer,
    Real,
}

/// Coerce `value` in place. Numeric affinities parse text only when the
/// parse is lossless; text affinity stringifies numerics.
pub fn apply_affinity(value: &mut Value, affinity: Affinity) {
    match affinity {
        Affinity::None => {}
        Affinity::Text => match value {
            Value::Int(v) => *value = Value::Text(v.to_string()),
            Value::Real(v) => *value = Value::Text(v.to_string()),
            _ => {}
        },
        Affinity::Numeric | Affinity::Integer => {
            coerce_numeric(value);
            if affinity == Affinity::Integer {
                if let Value::Real(v) = *value {
                    if v.fract() == 0.0 && v >= i64::MIN as f64 && v <= i64::MAX as f64 {
                        *value = Value::Int(v as i64);
                    }
                }
            }
        }
        Affinity::Real => {
            coerce_numeric(value);
            if let Value::Int(v) = *value {
                *value = Value::Real(v as f64);
            }
        }
    }
}

fn coerce_numeric(value: &mut Value) {
    if let Value::Text(s) = value {
        let trimmed = s.trim();
        if let Ok(i) = trimmed.parse::<i64>() {
            *value = Value::Int(i);
        } else if let Ok(r) = trimmed.parse::<f64>() {
            if r.is_finite() {
                *value = Value::Real(r);
            }
        }
    }
}
