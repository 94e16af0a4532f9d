// Copyright (c) latticedb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

//! Byte encodings for the single ordered key space.
//!
//! Keys are encoded so that plain `memcmp` order over the bytes equals the
//! logical order of the encoded tuple: an order-preserving varint for the
//! storage-unit root, then one tagged field encoding per value (descending
//! fields byte-inverted), then optionally a sequence suffix that makes
//! otherwise-equal sort keys unique. Row data uses a separate
//! self-describing record encoding whose byte order carries no meaning.

mod keycode;
mod record;
mod varint;

pub use keycode::{
    append_seq_suffix, decode_int, decode_root, encode_int_field, encode_key, seq_suffix_start,
    short_key_len,
};
pub use record::{decode_column, decode_record, encode_record};
pub use varint::{get_varint, put_varint, varint_len};
