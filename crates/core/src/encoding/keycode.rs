// Copyright (c) latticedb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

use crate::encoding::varint::{get_varint, put_varint};
use crate::{Error, KeyInfo, Result, SortOrder, Value};

// Field type tags, in storage-class order. Descending fields invert every
// byte of the field encoding, so an inverted tag (`!tag`) is still
// recognisable when a key is scanned without its KeyInfo.
const TAG_NULL: u8 = 0x05;
const TAG_INT: u8 = 0x20;
const TAG_REAL: u8 = 0x28;
const TAG_TEXT: u8 = 0x30;
const TAG_BLOB: u8 = 0x38;

/// Encode a full key: the root varint, then each field in order-preserving
/// form (byte-inverted for descending fields), then, if `seq` is given, the
/// sequence suffix that makes otherwise-equal sort keys unique.
pub fn encode_key(
    root: u64,
    fields: &[Value],
    key_info: &KeyInfo,
    seq: Option<u64>,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(16 + fields.len() * 10);
    put_varint(&mut out, root);
    for (i, field) in fields.iter().enumerate() {
        let start = out.len();
        encode_field(&mut out, field);
        if key_info.order(i) == SortOrder::Desc {
            for b in &mut out[start..] {
                *b = !*b;
            }
        }
    }
    if let Some(seq) = seq {
        append_seq_suffix(&mut out, seq);
    }
    Ok(out)
}

/// Encode one integer field (the rowid fast path used by Insert).
pub fn encode_int_field(out: &mut Vec<u8>, v: i64) {
    out.push(TAG_INT);
    let mut bytes = v.to_be_bytes();
    bytes[0] ^= 1 << 7; // flip sign bit so negatives order first
    out.extend_from_slice(&bytes);
}

fn encode_field(out: &mut Vec<u8>, field: &Value) {
    match field {
        Value::Null => out.push(TAG_NULL),
        Value::Int(v) => encode_int_field(out, *v),
        Value::Real(v) => {
            out.push(TAG_REAL);
            let mut bytes = v.to_be_bytes();
            match v.is_sign_negative() {
                false => bytes[0] ^= 1 << 7, // positive, flip sign bit
                true => bytes.iter_mut().for_each(|b| *b = !*b), // negative, flip all
            }
            out.extend_from_slice(&bytes);
        }
        Value::Text(s) => {
            out.push(TAG_TEXT);
            encode_bytes(out, s.as_bytes());
        }
        Value::Blob(b) => {
            out.push(TAG_BLOB);
            encode_bytes(out, b);
        }
    }
}

// Byte strings are terminated by 0x00 0x00, escaping interior 0x00 as
// 0x00 0xff, so a shorter string orders before any extension of it.
fn encode_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        if b == 0x00 {
            out.push(0x00);
            out.push(0xff);
        } else {
            out.push(b);
        }
    }
    out.push(0x00);
    out.push(0x00);
}

/// Decode the root varint off the front of a key.
pub fn decode_root(key: &[u8]) -> Result<(u64, usize)> {
    get_varint(key).ok_or_else(|| Error::corrupt("truncated root varint"))
}

/// Decode an integer field at the front of `buf` (after the root varint),
/// returning the value and bytes consumed. Used to recover the integer
/// primary key of a row.
pub fn decode_int(buf: &[u8]) -> Result<(i64, usize)> {
    match buf.first() {
        Some(&TAG_INT) => {}
        Some(_) => return Err(Error::corrupt("key field is not an integer")),
        None => return Err(Error::corrupt("empty key field")),
    }
    if buf.len() < 9 {
        return Err(Error::corrupt("truncated integer key field"));
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[1..9]);
    bytes[0] ^= 1 << 7;
    Ok((i64::from_be_bytes(bytes), 9))
}

/// Scan an encoded key and return the byte length of the prefix holding the
/// root varint plus the first `keep_fields` fields, along with the number
/// of fields actually present (the scan stops early at the end of the key
/// or at a sequence suffix).
pub fn short_key_len(key: &[u8], keep_fields: usize) -> Result<(usize, usize)> {
    let (_, mut pos) = decode_root(key)?;
    let mut decoded = 0;
    while decoded < keep_fields && pos < key.len() {
        pos += field_len(&key[pos..])?;
        decoded += 1;
    }
    Ok((pos, decoded))
}

// Length in bytes of the field encoding at the front of `buf`. Descending
// fields are recognised by their inverted tag.
fn field_len(buf: &[u8]) -> Result<usize> {
    let tag = buf[0];
    let (tag, inverted) = match tag {
        TAG_NULL | TAG_INT | TAG_REAL | TAG_TEXT | TAG_BLOB => (tag, false),
        t if matches!(!t, TAG_NULL | TAG_INT | TAG_REAL | TAG_TEXT | TAG_BLOB) => (!t, true),
        _ => return Err(Error::corrupt(format!("unknown key field tag {tag:#04x}"))),
    };
    let len = match tag {
        TAG_NULL => 1,
        TAG_INT | TAG_REAL => 9,
        TAG_TEXT | TAG_BLOB => {
            // Scan for the terminator, honouring the escape. For inverted
            // fields the terminator reads 0xff 0xff and the escape 0xff 0x00.
            let (term, esc) = if inverted { (0xffu8, 0x00u8) } else { (0x00u8, 0xffu8) };
            let mut i = 1;
            loop {
                match buf.get(i) {
                    Some(&b) if b == term => match buf.get(i + 1) {
                        Some(&e) if e == esc => i += 2,
                        Some(_) => break i + 2,
                        None => return Err(Error::corrupt("truncated key string terminator")),
                    },
                    Some(_) => i += 1,
                    None => return Err(Error::corrupt("unterminated key string field")),
                }
            }
        }
        _ => unreachable!(),
    };
    if buf.len() < len {
        return Err(Error::corrupt("truncated key field"));
    }
    Ok(len)
}

/// Append the sequence suffix for `seq`: base-128 groups, most significant
/// first, with the high bit set only on the leading byte so the suffix
/// start can be found by scanning backwards from the end of the key.
pub fn append_seq_suffix(out: &mut Vec<u8>, mut seq: u64) {
    let mut tmp = [0u8; 10];
    let mut n = 0;
    loop {
        n += 1;
        tmp[tmp.len() - n] = (seq & 0x7f) as u8;
        seq >>= 7;
        if seq == 0 {
            break;
        }
    }
    tmp[tmp.len() - n] |= 0x80;
    out.extend_from_slice(&tmp[tmp.len() - n..]);
}

/// Offset at which the trailing sequence suffix of `key` starts. The caller
/// must know a suffix is present; the scan walks back to the byte carrying
/// the high-bit marker.
pub fn seq_suffix_start(key: &[u8]) -> Result<usize> {
    let mut i = key.len();
    loop {
        if i == 0 {
            return Err(Error::corrupt("key has no sequence suffix"));
        }
        i -= 1;
        if key[i] & 0x80 != 0 {
            return Ok(i);
        }
    }
}
