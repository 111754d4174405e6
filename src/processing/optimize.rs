//! Dtype narrowing for processed chunks.

use polars::prelude::*;
use serde::{Deserialize, Serialize};

/// How hard processed chunks are optimized
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationLevel {
    /// Leave dtypes alone
    Conservative,
    /// Narrow Int64 columns
    #[default]
    Moderate,
    /// Also narrow Float64 to Float32 when every value is exact in f32
    Aggressive,
}

fn narrowest_int(min: i64, max: i64) -> Option<DataType> {
    if min >= i8::MIN as i64 && max <= i8::MAX as i64 {
        Some(DataType::Int8)
    } else if min >= i16::MIN as i64 && max <= i16::MAX as i64 {
        Some(DataType::Int16)
    } else if min >= i32::MIN as i64 && max <= i32::MAX as i64 {
        Some(DataType::Int32)
    } else {
        None
    }
}

fn int_bounds(dtype: &DataType) -> Option<(i64, i64)> {
    match dtype {
        DataType::Int8 => Some((i8::MIN as i64, i8::MAX as i64)),
        DataType::Int16 => Some((i16::MIN as i64, i16::MAX as i64)),
        DataType::Int32 => Some((i32::MIN as i64, i32::MAX as i64)),
        _ => None,
    }
}

/// Every value survives the round trip through f32 unchanged.
fn exact_in_f32(ca: &Float64Chunked) -> bool {
    ca.into_iter()
        .flatten()
        .all(|v| v.is_nan() || v as f32 as f64 == v)
}

fn target_for(series: &Series, level: OptimizationLevel) -> Option<DataType> {
    match series.dtype() {
        DataType::Int64 => {
            let ca = series.i64().ok()?;
            narrowest_int(ca.min()?, ca.max()?)
        }
        DataType::Float64 if level == OptimizationLevel::Aggressive => {
            let ca = series.f64().ok()?;
            (ca.null_count() < ca.len() && exact_in_f32(ca)).then_some(DataType::Float32)
        }
        _ => None,
    }
}

/// `series` can be cast to `target` without losing values.
fn fits(series: &Series, target: &DataType) -> bool {
    match (series.dtype(), target) {
        (DataType::Int64, target) => {
            let (Some((lo, hi)), Ok(ca)) = (int_bounds(target), series.i64()) else {
                return false;
            };
            match (ca.min(), ca.max()) {
                (Some(min), Some(max)) => min >= lo && max <= hi,
                _ => true,
            }
        }
        (DataType::Float64, DataType::Float32) => series.f64().is_ok_and(exact_in_f32),
        _ => false,
    }
}

/// Narrowed column types fixed for a whole traversal.
///
/// Built once from the full table so that every chunk of a run narrows the
/// same columns to the same types and the chunks stack back together. A
/// chunk whose values no longer fit a planned type (a transform rewrote
/// them) keeps that column wide.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DtypePlan {
    targets: Vec<(String, DataType)>,
}

impl DtypePlan {
    pub fn from_frame(df: &DataFrame, level: OptimizationLevel) -> Self {
        if level == OptimizationLevel::Conservative {
            return Self::default();
        }
        let targets = df
            .get_columns()
            .iter()
            .filter_map(|column| {
                let series = column.as_materialized_series();
                target_for(series, level).map(|target| (series.name().to_string(), target))
            })
            .collect();
        Self { targets }
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn target(&self, column: &str) -> Option<&DataType> {
        self.targets
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, dtype)| dtype)
    }

    /// Cast the planned columns of `df`. Returns one description per converted column.
    pub fn apply(&self, df: &mut DataFrame) -> Vec<String> {
        let mut applied = Vec::new();
        for (name, target) in &self.targets {
            let Some(series) = df
                .column(name)
                .ok()
                .map(|c| c.as_materialized_series().clone())
            else {
                continue;
            };
            if !fits(&series, target) {
                continue;
            }
            if let Ok(narrowed) = series.cast(target) {
                if df.replace(name.as_str(), narrowed).is_ok() {
                    applied.push(format!("{name}: {} -> {target}", series.dtype()));
                }
            }
        }
        applied
    }
}

/// Narrow numeric columns of `df` according to `level`, judged on `df` alone.
///
/// Returns one description per converted column.
pub fn optimize_frame(df: &mut DataFrame, level: OptimizationLevel) -> Vec<String> {
    DtypePlan::from_frame(df, level).apply(df)
}
