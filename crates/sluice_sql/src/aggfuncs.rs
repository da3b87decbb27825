//! Aggregate function state.
//!
//! Each group key owns one `AggState` with an accumulator per aggregate
//! call. The partial path evaluates row contributions (`eval_row`), the
//! full path merges forwarded partial values (`merge_row`); both take a
//! `reverse` flag that must be a true inverse of the forward operation.
//! Sum and count are commutative group operations; min and max keep a
//! sorted multiset of contributions so removing a row really removes its
//! contribution instead of guessing.
//!
//! Persisted form: `u32 row_len | row | aux*` where `row` is the current
//! values encoded as a regular row (what flows downstream) and `aux` holds
//! one length-prefixed frame per function (empty except for min/max).

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use sluice_core::codec::{append_key_datum, append_u32_le, append_u64_le, read_u32_le, read_u64_le};
use sluice_core::types::{ColumnType, Datum, Row};

use crate::parplan::{AggregateCall, PlanExpr};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggFunctionType {
    /// Carries a group-by column through the aggregate output.
    FirstRow,
    Sum,
    Count,
    Min,
    Max,
}

/// One aggregate call bound to its argument expression and value type.
#[derive(Clone, Debug)]
pub struct AggFunction {
    pub func_type: AggFunctionType,
    pub arg: Option<PlanExpr>,
    pub value_type: ColumnType,
}

impl AggFunction {
    pub fn from_calls(calls: &[AggregateCall]) -> Vec<AggFunction> {
        calls
            .iter()
            .map(|call| AggFunction {
                func_type: call.func,
                arg: call.arg.clone(),
                value_type: call.return_type.clone(),
            })
            .collect()
    }

    pub fn value_types(funcs: &[AggFunction]) -> Vec<ColumnType> {
        funcs.iter().map(|f| f.value_type.clone()).collect()
    }
}

#[derive(Clone, Debug)]
struct MultisetEntry {
    datum: Datum,
    count: i64,
}

#[derive(Clone, Debug)]
enum Accumulator {
    FirstRow { value: Option<Datum>, set: bool },
    SumInt(i64),
    SumDouble(f64),
    SumDecimal(Decimal),
    Count(i64),
    MinMax {
        min: bool,
        entries: BTreeMap<Vec<u8>, MultisetEntry>,
    },
}

impl Accumulator {
    fn new(func: &AggFunction) -> anyhow::Result<Accumulator> {
        Ok(match func.func_type {
            AggFunctionType::FirstRow => Accumulator::FirstRow {
                value: None,
                set: false,
            },
            AggFunctionType::Count => Accumulator::Count(0),
            AggFunctionType::Sum => match func.value_type {
                ColumnType::TinyInt | ColumnType::Int | ColumnType::BigInt => Accumulator::SumInt(0),
                ColumnType::Double => Accumulator::SumDouble(0.0),
                ColumnType::Decimal { .. } => Accumulator::SumDecimal(Decimal::ZERO),
                ref other => anyhow::bail!("sum over unsupported type {other:?}"),
            },
            AggFunctionType::Min => Accumulator::MinMax {
                min: true,
                entries: BTreeMap::new(),
            },
            AggFunctionType::Max => Accumulator::MinMax {
                min: false,
                entries: BTreeMap::new(),
            },
        })
    }
}

/// Aggregate state for one group key.
#[derive(Clone, Debug)]
pub struct AggState {
    accs: Vec<Accumulator>,
    changed: bool,
}

impl AggState {
    pub fn new(funcs: &[AggFunction]) -> anyhow::Result<AggState> {
        let accs = funcs
            .iter()
            .map(Accumulator::new)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(AggState {
            accs,
            changed: false,
        })
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Apply one input row's contribution (partial path). `reverse` removes
    /// a previously applied contribution of the same row.
    pub fn eval_row(
        &mut self,
        funcs: &[AggFunction],
        row: &Row,
        reverse: bool,
    ) -> anyhow::Result<()> {
        for (idx, func) in funcs.iter().enumerate() {
            let arg = match &func.arg {
                Some(expr) => expr.eval(row)?,
                None => None,
            };
            self.apply(idx, func, arg, reverse, false)?;
        }
        Ok(())
    }

    /// Merge a forwarded partial value per function (full path).
    pub fn merge_row(
        &mut self,
        funcs: &[AggFunction],
        partial_row: &Row,
        reverse: bool,
    ) -> anyhow::Result<()> {
        for (idx, func) in funcs.iter().enumerate() {
            let contribution = partial_row.get(idx).cloned();
            self.apply(idx, func, contribution, reverse, true)?;
        }
        Ok(())
    }

    fn apply(
        &mut self,
        idx: usize,
        func: &AggFunction,
        value: Option<Datum>,
        reverse: bool,
        merging: bool,
    ) -> anyhow::Result<()> {
        match &mut self.accs[idx] {
            Accumulator::FirstRow { value: slot, set } => {
                // The group key is constant for a group; the first sighting
                // pins it and reversal never unpins it.
                if !*set {
                    if let Some(v) = value {
                        *slot = Some(v);
                        *set = true;
                        self.changed = true;
                    }
                }
            }
            Accumulator::Count(count) => {
                let delta = if merging {
                    match value {
                        Some(Datum::Int(v)) => v,
                        Some(other) => anyhow::bail!("bad count contribution {other:?}"),
                        None => 0,
                    }
                } else if func.arg.is_none() || value.is_some() {
                    1
                } else {
                    0
                };
                if delta != 0 {
                    *count += if reverse { -delta } else { delta };
                    self.changed = true;
                }
            }
            Accumulator::SumInt(sum) => {
                if let Some(v) = value {
                    let v = v.as_int()?;
                    *sum = if reverse {
                        sum.wrapping_sub(v)
                    } else {
                        sum.wrapping_add(v)
                    };
                    self.changed = true;
                }
            }
            Accumulator::SumDouble(sum) => {
                if let Some(v) = value {
                    let v = match v {
                        Datum::Double(d) => d,
                        Datum::Int(i) => i as f64,
                        other => anyhow::bail!("bad double sum argument {other:?}"),
                    };
                    *sum += if reverse { -v } else { v };
                    self.changed = true;
                }
            }
            Accumulator::SumDecimal(sum) => {
                if let Some(v) = value {
                    let v = match v {
                        Datum::Decimal(d) => d,
                        Datum::Int(i) => Decimal::from(i),
                        other => anyhow::bail!("bad decimal sum argument {other:?}"),
                    };
                    if reverse {
                        *sum -= v;
                    } else {
                        *sum += v;
                    }
                    self.changed = true;
                }
            }
            Accumulator::MinMax { entries, .. } => {
                if let Some(v) = value {
                    let mut key = Vec::new();
                    append_key_datum(&mut key, Some(&v), &func.value_type)?;
                    if reverse {
                        if let Some(entry) = entries.get_mut(&key) {
                            entry.count -= 1;
                            if entry.count <= 0 {
                                entries.remove(&key);
                            }
                        }
                    } else {
                        entries
                            .entry(key)
                            .and_modify(|e| e.count += 1)
                            .or_insert(MultisetEntry { datum: v, count: 1 });
                    }
                    self.changed = true;
                }
            }
        }
        Ok(())
    }

    fn current_value(&self, idx: usize) -> Option<Datum> {
        match &self.accs[idx] {
            Accumulator::FirstRow { value, .. } => value.clone(),
            Accumulator::Count(count) => Some(Datum::Int(*count)),
            Accumulator::SumInt(sum) => Some(Datum::Int(*sum)),
            Accumulator::SumDouble(sum) => Some(Datum::Double(*sum)),
            Accumulator::SumDecimal(sum) => Some(Datum::Decimal(*sum)),
            Accumulator::MinMax { min, entries } => {
                let entry = if *min {
                    entries.values().next()
                } else {
                    entries.values().next_back()
                };
                entry.map(|e| e.datum.clone())
            }
        }
    }

    /// The current values as a row in function order.
    pub fn current_row(&self) -> Row {
        Row::new((0..self.accs.len()).map(|i| self.current_value(i)).collect())
    }

    /// Encode into `(row_bytes, stored_value)`; `row_bytes` is what flows
    /// downstream, `stored_value` additionally carries the aux frames.
    pub fn serialize(&self, funcs: &[AggFunction]) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
        let types = AggFunction::value_types(funcs);
        let row_bytes = self.current_row().encoded(&types)?;
        let mut value = Vec::with_capacity(4 + row_bytes.len());
        append_u32_le(&mut value, row_bytes.len() as u32);
        value.extend_from_slice(&row_bytes);
        for (idx, func) in funcs.iter().enumerate() {
            let frame = match &self.accs[idx] {
                Accumulator::MinMax { entries, .. } => {
                    let mut frame = Vec::new();
                    append_u32_le(&mut frame, entries.len() as u32);
                    let single = [func.value_type.clone()];
                    for entry in entries.values() {
                        let datum_row = Row::new(vec![Some(entry.datum.clone())]);
                        let encoded = datum_row.encoded(&single)?;
                        append_u32_le(&mut frame, encoded.len() as u32);
                        frame.extend_from_slice(&encoded);
                        append_u64_le(&mut frame, entry.count as u64);
                    }
                    frame
                }
                _ => Vec::new(),
            };
            append_u32_le(&mut value, frame.len() as u32);
            value.extend_from_slice(&frame);
        }
        Ok((row_bytes, value))
    }

    /// Decode a stored value. Returns the state plus the row bytes that
    /// were current when it was stored (the downstream "previous row").
    pub fn deserialize(data: &[u8], funcs: &[AggFunction]) -> anyhow::Result<(AggState, Vec<u8>)> {
        let types = AggFunction::value_types(funcs);
        let mut offset = 0;
        let row_len = read_u32_le(data, &mut offset)? as usize;
        anyhow::ensure!(offset + row_len <= data.len(), "short agg state row");
        let row_bytes = data[offset..offset + row_len].to_vec();
        let row = Row::decode(&row_bytes, &types)?;
        offset += row_len;

        let mut state = AggState::new(funcs)?;
        for (idx, func) in funcs.iter().enumerate() {
            let frame_len = read_u32_le(data, &mut offset)? as usize;
            anyhow::ensure!(offset + frame_len <= data.len(), "short agg aux frame");
            let frame = &data[offset..offset + frame_len];
            offset += frame_len;
            match &mut state.accs[idx] {
                Accumulator::MinMax { entries, .. } => {
                    let mut fo = 0;
                    let count = read_u32_le(frame, &mut fo)? as usize;
                    let single = [func.value_type.clone()];
                    for _ in 0..count {
                        let dlen = read_u32_le(frame, &mut fo)? as usize;
                        anyhow::ensure!(fo + dlen <= frame.len(), "short multiset entry");
                        let datum_row = Row::decode(&frame[fo..fo + dlen], &single)?;
                        fo += dlen;
                        let multiplicity = read_u64_le(frame, &mut fo)? as i64;
                        let datum = datum_row
                            .get(0)
                            .cloned()
                            .ok_or_else(|| anyhow::anyhow!("null multiset entry"))?;
                        let mut key = Vec::new();
                        append_key_datum(&mut key, Some(&datum), &func.value_type)?;
                        entries.insert(
                            key,
                            MultisetEntry {
                                datum,
                                count: multiplicity,
                            },
                        );
                    }
                }
                Accumulator::FirstRow { value, set } => {
                    if let Some(v) = row.get(idx) {
                        *value = Some(v.clone());
                        *set = true;
                    }
                }
                Accumulator::Count(count) => {
                    if let Some(v) = row.get(idx) {
                        *count = v.as_int()?;
                    }
                }
                Accumulator::SumInt(sum) => {
                    if let Some(v) = row.get(idx) {
                        *sum = v.as_int()?;
                    }
                }
                Accumulator::SumDouble(sum) => {
                    if let Some(v) = row.get(idx) {
                        *sum = v.as_double()?;
                    }
                }
                Accumulator::SumDecimal(sum) => {
                    if let Some(v) = row.get(idx) {
                        *sum = v.as_decimal()?;
                    }
                }
            }
        }
        anyhow::ensure!(offset == data.len(), "trailing bytes in agg state");
        Ok((state, row_bytes))
    }
}
