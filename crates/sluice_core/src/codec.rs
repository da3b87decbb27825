//! Byte-level encoding helpers and the table key layout.
//!
//! Every persisted key starts with the owning shard id (big-endian u64)
//! followed by the table id (big-endian u64), so a shard's entire state is
//! the range `[shard_id, shard_id + 1)`. Key column encodings are
//! byte-order preserving so that KV range order matches SQL order.

use anyhow::ensure;

use crate::types::{ColumnType, Datum, Row};

/// Byte length of the `shard_id | table_id` key prefix.
pub const TABLE_PREFIX_LEN: usize = 16;

/// Append a little-endian u32 to `buf`.
pub fn append_u32_le(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Append a little-endian u64 to `buf`.
pub fn append_u64_le(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Append a big-endian u32 to `buf`.
pub fn append_u32_be(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Append a big-endian u64 to `buf`.
pub fn append_u64_be(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Read a little-endian u32 from `data` at `offset`, advancing it.
pub fn read_u32_le(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    ensure!(*offset + 4 <= data.len(), "short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_le_bytes(buf))
}

/// Read a little-endian u64 from `data` at `offset`, advancing it.
pub fn read_u64_le(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    ensure!(*offset + 8 <= data.len(), "short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_le_bytes(buf))
}

/// Read a big-endian u32 from `data` at `offset`, advancing it.
pub fn read_u32_be(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    ensure!(*offset + 4 <= data.len(), "short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

/// Read a big-endian u64 from `data` at `offset`, advancing it.
pub fn read_u64_be(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    ensure!(*offset + 8 <= data.len(), "short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}

/// Read a single byte from `data` at `offset`, advancing it.
pub fn read_u8(data: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    ensure!(*offset < data.len(), "short u8");
    let b = data[*offset];
    *offset += 1;
    Ok(b)
}

/// Read a length-prefixed byte slice (u32 LE length) from `data`.
pub fn read_bytes<'a>(data: &'a [u8], offset: &mut usize) -> anyhow::Result<&'a [u8]> {
    let len = read_u32_le(data, offset)? as usize;
    ensure!(*offset + len <= data.len(), "short byte slice");
    let out = &data[*offset..*offset + len];
    *offset += len;
    Ok(out)
}

/// Append a length-prefixed byte slice (u32 LE length) to `buf`.
pub fn append_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    append_u32_le(buf, data.len() as u32);
    buf.extend_from_slice(data);
}

/// Encode the `shard_id | table_id` key prefix with extra capacity reserved.
pub fn encode_table_prefix(shard_id: u64, table_id: u64, capacity: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(capacity.max(TABLE_PREFIX_LEN));
    append_u64_be(&mut key, shard_id);
    append_u64_be(&mut key, table_id);
    key
}

/// Inclusive-exclusive byte range covering everything a shard owns.
pub fn shard_range(shard_id: u64) -> (Vec<u8>, Vec<u8>) {
    (
        shard_id.to_be_bytes().to_vec(),
        (shard_id + 1).to_be_bytes().to_vec(),
    )
}

/// Byte range covering one table within one shard.
pub fn table_range(shard_id: u64, table_id: u64) -> (Vec<u8>, Vec<u8>) {
    (
        encode_table_prefix(shard_id, table_id, TABLE_PREFIX_LEN),
        encode_table_prefix(shard_id, table_id + 1, TABLE_PREFIX_LEN),
    )
}

// Key column encoding. Each value is prefixed with a presence byte so nulls
// sort first; the payload encodings preserve byte order:
// - integers and timestamps: big-endian with the sign bit flipped
// - doubles: IEEE bits, fully inverted for negatives
// - varchar: 0x00 bytes escaped as 0x00 0xFF, terminated by 0x00 0x00
// - decimals: value scaled to an i128, big-endian with the sign bit flipped

const KEY_NULL: u8 = 0;
const KEY_PRESENT: u8 = 1;

fn append_ordered_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&((v as u64) ^ (1 << 63)).to_be_bytes());
}

fn append_ordered_f64(buf: &mut Vec<u8>, v: f64) {
    let bits = v.to_bits();
    let ordered = if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits ^ (1 << 63)
    };
    buf.extend_from_slice(&ordered.to_be_bytes());
}

fn append_ordered_i128(buf: &mut Vec<u8>, v: i128) {
    buf.extend_from_slice(&((v as u128) ^ (1 << 127)).to_be_bytes());
}

fn append_escaped_str(buf: &mut Vec<u8>, s: &str) {
    for b in s.as_bytes() {
        if *b == 0 {
            buf.push(0);
            buf.push(0xff);
        } else {
            buf.push(*b);
        }
    }
    buf.push(0);
    buf.push(0);
}

/// Append one key column value to `buf` in order-preserving form.
pub fn append_key_datum(
    buf: &mut Vec<u8>,
    value: Option<&Datum>,
    col_type: &ColumnType,
) -> anyhow::Result<()> {
    let Some(value) = value else {
        buf.push(KEY_NULL);
        return Ok(());
    };
    buf.push(KEY_PRESENT);
    match (col_type, value) {
        (ColumnType::TinyInt | ColumnType::Int | ColumnType::BigInt, Datum::Int(v)) => {
            append_ordered_i64(buf, *v);
        }
        (ColumnType::Double, Datum::Double(v)) => append_ordered_f64(buf, *v),
        (ColumnType::Varchar, Datum::Varchar(s)) => append_escaped_str(buf, s),
        (ColumnType::Decimal { scale, .. }, Datum::Decimal(d)) => {
            let mut scaled = *d;
            scaled.rescale(*scale as u32);
            append_ordered_i128(buf, scaled.mantissa());
        }
        (ColumnType::Timestamp, Datum::Timestamp(micros)) => append_ordered_i64(buf, *micros),
        (ct, d) => anyhow::bail!("datum {d:?} does not match key column type {ct:?}"),
    }
    Ok(())
}

/// Encode the key columns of `row` onto an existing key prefix.
pub fn encode_key_cols(
    row: &Row,
    key_cols: &[usize],
    col_types: &[ColumnType],
    mut key: Vec<u8>,
) -> anyhow::Result<Vec<u8>> {
    for &col in key_cols {
        ensure!(col < col_types.len(), "key column {col} out of range");
        append_key_datum(&mut key, row.get(col), &col_types[col])?;
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    #[test]
    fn table_prefix_layout() {
        let key = encode_table_prefix(3, 1000, 32);
        assert_eq!(key.len(), TABLE_PREFIX_LEN);
        assert_eq!(&key[0..8], &3u64.to_be_bytes());
        assert_eq!(&key[8..16], &1000u64.to_be_bytes());
    }

    #[test]
    fn buffer_round_trips() {
        let mut buf = Vec::new();
        append_u32_le(&mut buf, 7);
        append_u64_be(&mut buf, u64::MAX - 1);
        append_bytes(&mut buf, b"abc");
        let mut off = 0;
        assert_eq!(read_u32_le(&buf, &mut off).unwrap(), 7);
        assert_eq!(read_u64_be(&buf, &mut off).unwrap(), u64::MAX - 1);
        assert_eq!(read_bytes(&buf, &mut off).unwrap(), b"abc");
        assert_eq!(off, buf.len());
    }

    #[test]
    fn short_reads_fail() {
        let buf = [1u8, 2];
        let mut off = 0;
        assert!(read_u32_le(&buf, &mut off).is_err());
        assert!(read_u64_be(&buf, &mut off).is_err());
    }

    fn key_for(v: i64) -> Vec<u8> {
        let mut buf = Vec::new();
        append_key_datum(&mut buf, Some(&Datum::Int(v)), &ColumnType::BigInt).unwrap();
        buf
    }

    #[test]
    fn int_keys_preserve_order() {
        let values = [i64::MIN, -10, -1, 0, 1, 42, i64::MAX];
        let mut keys: Vec<Vec<u8>> = values.iter().map(|v| key_for(*v)).collect();
        let sorted = keys.clone();
        keys.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn double_keys_preserve_order() {
        let values = [f64::NEG_INFINITY, -2.5, -0.0, 0.0, 1.5, f64::INFINITY];
        let keys: Vec<Vec<u8>> = values
            .iter()
            .map(|v| {
                let mut buf = Vec::new();
                append_key_datum(&mut buf, Some(&Datum::Double(*v)), &ColumnType::Double).unwrap();
                buf
            })
            .collect();
        for pair in keys.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn varchar_keys_preserve_order_with_embedded_nul() {
        let values = ["", "a", "a\0b", "ab", "b"];
        let keys: Vec<Vec<u8>> = values
            .iter()
            .map(|v| {
                let mut buf = Vec::new();
                append_key_datum(
                    &mut buf,
                    Some(&Datum::Varchar(v.to_string())),
                    &ColumnType::Varchar,
                )
                .unwrap();
                buf
            })
            .collect();
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn decimal_keys_preserve_order() {
        let ty = ColumnType::Decimal {
            precision: 10,
            scale: 2,
        };
        let values = ["-12.34", "-0.01", "0.00", "0.01", "99.99"];
        let keys: Vec<Vec<u8>> = values
            .iter()
            .map(|v| {
                let mut buf = Vec::new();
                let d = Decimal::from_str(v).unwrap();
                append_key_datum(&mut buf, Some(&Datum::Decimal(d)), &ty).unwrap();
                buf
            })
            .collect();
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn null_sorts_first() {
        let mut null_key = Vec::new();
        append_key_datum(&mut null_key, None, &ColumnType::BigInt).unwrap();
        assert!(null_key < key_for(i64::MIN));
    }
}
