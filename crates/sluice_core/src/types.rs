//! Column types, datums and the row codec.
//!
//! A row is encoded as a null bitmap followed by the non-null column
//! payloads in schema order. The same encoding is used for storage values
//! and for rows forwarded between shards, so replicas and peers agree on
//! bytes without a translation step.

use anyhow::ensure;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::codec::{append_u32_le, append_u64_le, read_u32_le, read_u64_le};

/// Supported SQL column types.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    TinyInt,
    Int,
    BigInt,
    Double,
    Varchar,
    Decimal { precision: u8, scale: u8 },
    Timestamp,
}

impl ColumnType {
    /// Stable numeric id, shared with the API column type enum.
    pub fn type_id(&self) -> i32 {
        match self {
            ColumnType::TinyInt => 1,
            ColumnType::Int => 2,
            ColumnType::BigInt => 3,
            ColumnType::Double => 4,
            ColumnType::Varchar => 5,
            ColumnType::Decimal { .. } => 6,
            ColumnType::Timestamp => 7,
        }
    }
}

/// A single column value. Integer-family columns share one variant; the
/// column type decides the visible width.
#[derive(Clone, Debug, PartialEq)]
pub enum Datum {
    Int(i64),
    Double(f64),
    Varchar(String),
    Decimal(Decimal),
    /// Microseconds past the Unix epoch, UTC.
    Timestamp(i64),
}

impl Datum {
    pub fn as_int(&self) -> anyhow::Result<i64> {
        match self {
            Datum::Int(v) => Ok(*v),
            other => anyhow::bail!("expected int datum, got {other:?}"),
        }
    }

    pub fn as_double(&self) -> anyhow::Result<f64> {
        match self {
            Datum::Double(v) => Ok(*v),
            other => anyhow::bail!("expected double datum, got {other:?}"),
        }
    }

    pub fn as_str(&self) -> anyhow::Result<&str> {
        match self {
            Datum::Varchar(v) => Ok(v),
            other => anyhow::bail!("expected varchar datum, got {other:?}"),
        }
    }

    pub fn as_decimal(&self) -> anyhow::Result<Decimal> {
        match self {
            Datum::Decimal(v) => Ok(*v),
            other => anyhow::bail!("expected decimal datum, got {other:?}"),
        }
    }

    pub fn as_timestamp(&self) -> anyhow::Result<i64> {
        match self {
            Datum::Timestamp(v) => Ok(*v),
            other => anyhow::bail!("expected timestamp datum, got {other:?}"),
        }
    }

    /// Render the datum in its canonical textual form (decimals as base-10
    /// strings, timestamps as UTC datetimes).
    pub fn display_string(&self) -> String {
        match self {
            Datum::Int(v) => v.to_string(),
            Datum::Double(v) => v.to_string(),
            Datum::Varchar(v) => v.clone(),
            Datum::Decimal(v) => v.to_string(),
            Datum::Timestamp(micros) => match DateTime::<Utc>::from_timestamp_micros(*micros) {
                Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
                None => micros.to_string(),
            },
        }
    }
}

/// One tuple; `values[i]` is `None` for SQL NULL.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    values: Vec<Option<Datum>>,
}

impl Row {
    pub fn new(values: Vec<Option<Datum>>) -> Self {
        Self { values }
    }

    pub fn get(&self, col: usize) -> Option<&Datum> {
        self.values.get(col).and_then(|v| v.as_ref())
    }

    pub fn is_null(&self, col: usize) -> bool {
        self.get(col).is_none()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Option<Datum>] {
        &self.values
    }

    /// Encode the row onto `buf`: null bitmap, then non-null payloads.
    pub fn encode(&self, col_types: &[ColumnType], buf: &mut Vec<u8>) -> anyhow::Result<()> {
        ensure!(
            self.values.len() == col_types.len(),
            "row has {} columns, schema has {}",
            self.values.len(),
            col_types.len()
        );
        let bitmap_len = (col_types.len() + 7) / 8;
        let bitmap_start = buf.len();
        buf.resize(bitmap_start + bitmap_len, 0);
        for (i, (value, col_type)) in self.values.iter().zip(col_types).enumerate() {
            let Some(value) = value else {
                buf[bitmap_start + i / 8] |= 1 << (i % 8);
                continue;
            };
            match (col_type, value) {
                (ColumnType::TinyInt | ColumnType::Int | ColumnType::BigInt, Datum::Int(v)) => {
                    append_u64_le(buf, *v as u64);
                }
                (ColumnType::Double, Datum::Double(v)) => {
                    append_u64_le(buf, v.to_bits());
                }
                (ColumnType::Varchar, Datum::Varchar(s)) => {
                    append_u32_le(buf, s.len() as u32);
                    buf.extend_from_slice(s.as_bytes());
                }
                (ColumnType::Decimal { .. }, Datum::Decimal(d)) => {
                    let s = d.to_string();
                    append_u32_le(buf, s.len() as u32);
                    buf.extend_from_slice(s.as_bytes());
                }
                (ColumnType::Timestamp, Datum::Timestamp(micros)) => {
                    append_u64_le(buf, *micros as u64);
                }
                (ct, d) => anyhow::bail!("datum {d:?} does not match column type {ct:?}"),
            }
        }
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn encoded(&self, col_types: &[ColumnType]) -> anyhow::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.encode(col_types, &mut buf)?;
        Ok(buf)
    }

    /// Decode one row from `data` given the schema column types.
    pub fn decode(data: &[u8], col_types: &[ColumnType]) -> anyhow::Result<Row> {
        let bitmap_len = (col_types.len() + 7) / 8;
        ensure!(data.len() >= bitmap_len, "short row bitmap");
        let bitmap = &data[..bitmap_len];
        let mut offset = bitmap_len;
        let mut values = Vec::with_capacity(col_types.len());
        for (i, col_type) in col_types.iter().enumerate() {
            if bitmap[i / 8] & (1 << (i % 8)) != 0 {
                values.push(None);
                continue;
            }
            let datum = match col_type {
                ColumnType::TinyInt | ColumnType::Int | ColumnType::BigInt => {
                    Datum::Int(read_u64_le(data, &mut offset)? as i64)
                }
                ColumnType::Double => Datum::Double(f64::from_bits(read_u64_le(data, &mut offset)?)),
                ColumnType::Varchar => {
                    let len = read_u32_le(data, &mut offset)? as usize;
                    ensure!(offset + len <= data.len(), "short varchar payload");
                    let s = std::str::from_utf8(&data[offset..offset + len])?.to_string();
                    offset += len;
                    Datum::Varchar(s)
                }
                ColumnType::Decimal { .. } => {
                    let len = read_u32_le(data, &mut offset)? as usize;
                    ensure!(offset + len <= data.len(), "short decimal payload");
                    let s = std::str::from_utf8(&data[offset..offset + len])?;
                    let d = s.parse::<Decimal>()?;
                    offset += len;
                    Datum::Decimal(d)
                }
                ColumnType::Timestamp => Datum::Timestamp(read_u64_le(data, &mut offset)? as i64),
            };
            values.push(Some(datum));
        }
        ensure!(offset == data.len(), "trailing bytes after row payload");
        Ok(Row { values })
    }
}

/// A batch of rows sharing one schema, with a wire codec used by query
/// replies.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Rows {
    col_types: Vec<ColumnType>,
    rows: Vec<Row>,
}

impl Rows {
    pub fn new(col_types: Vec<ColumnType>) -> Self {
        Self {
            col_types,
            rows: Vec::new(),
        }
    }

    pub fn col_types(&self) -> &[ColumnType] {
        &self.col_types
    }

    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    pub fn append_all(&mut self, other: Rows) {
        self.rows.extend(other.rows);
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn get_row(&self, i: usize) -> &Row {
        &self.rows[i]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// Serialize the batch: row count, then length-prefixed encoded rows.
    /// Column types are not carried; both sides know the schema.
    pub fn serialize(&self) -> anyhow::Result<Vec<u8>> {
        let mut buf = Vec::new();
        append_u32_le(&mut buf, self.rows.len() as u32);
        for row in &self.rows {
            let encoded = row.encoded(&self.col_types)?;
            append_u32_le(&mut buf, encoded.len() as u32);
            buf.extend_from_slice(&encoded);
        }
        Ok(buf)
    }

    /// Inverse of [`Rows::serialize`] for a known schema.
    pub fn deserialize(data: &[u8], col_types: Vec<ColumnType>) -> anyhow::Result<Rows> {
        let mut offset = 0;
        let count = read_u32_le(data, &mut offset)? as usize;
        let mut rows = Vec::with_capacity(count);
        for _ in 0..count {
            let len = read_u32_le(data, &mut offset)? as usize;
            ensure!(offset + len <= data.len(), "short row frame");
            rows.push(Row::decode(&data[offset..offset + len], &col_types)?);
            offset += len;
        }
        ensure!(offset == data.len(), "trailing bytes after rows frame");
        Ok(Rows { col_types, rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn all_types() -> Vec<ColumnType> {
        vec![
            ColumnType::TinyInt,
            ColumnType::Int,
            ColumnType::BigInt,
            ColumnType::Double,
            ColumnType::Varchar,
            ColumnType::Decimal {
                precision: 12,
                scale: 4,
            },
            ColumnType::Timestamp,
        ]
    }

    #[test]
    fn row_round_trip_all_types() {
        let types = all_types();
        let row = Row::new(vec![
            Some(Datum::Int(-3)),
            Some(Datum::Int(123456)),
            Some(Datum::Int(i64::MIN)),
            Some(Datum::Double(2.75)),
            Some(Datum::Varchar("hello world".into())),
            Some(Datum::Decimal(Decimal::from_str("1234.5678").unwrap())),
            Some(Datum::Timestamp(1_700_000_000_000_000)),
        ]);
        let encoded = row.encoded(&types).unwrap();
        let decoded = Row::decode(&encoded, &types).unwrap();
        assert_eq!(row, decoded);
    }

    #[test]
    fn row_round_trip_with_nulls() {
        let types = all_types();
        let row = Row::new(vec![
            None,
            Some(Datum::Int(7)),
            None,
            None,
            Some(Datum::Varchar(String::new())),
            None,
            None,
        ]);
        let encoded = row.encoded(&types).unwrap();
        let decoded = Row::decode(&encoded, &types).unwrap();
        assert_eq!(row, decoded);
        assert!(decoded.is_null(0));
        assert!(!decoded.is_null(1));
    }

    #[test]
    fn mismatched_datum_rejected() {
        let types = vec![ColumnType::BigInt];
        let row = Row::new(vec![Some(Datum::Varchar("nope".into()))]);
        assert!(row.encoded(&types).is_err());
    }

    #[test]
    fn rows_serialize_round_trip() {
        let types = vec![ColumnType::BigInt, ColumnType::Varchar];
        let mut rows = Rows::new(types.clone());
        rows.push(Row::new(vec![
            Some(Datum::Int(1)),
            Some(Datum::Varchar("a".into())),
        ]));
        rows.push(Row::new(vec![Some(Datum::Int(2)), None]));
        let bytes = rows.serialize().unwrap();
        let back = Rows::deserialize(&bytes, types).unwrap();
        assert_eq!(rows, back);
    }

    #[test]
    fn timestamp_display_is_utc_datetime() {
        let d = Datum::Timestamp(0);
        assert_eq!(d.display_string(), "1970-01-01 00:00:00.000000");
    }
}
