//! # Observation Loading and Validation
//!
//! This module is the entry point for census data. It reads a tab-separated
//! file with one row per individual and census interval, validates it against
//! the configured column names, and turns it into the columnar
//! `ObservationSet` used by the statistical core.
//!
//! - Every row must have a strictly positive exposure length and a 0/1 outcome.
//! - Key columns (group, plot, census, site) are read as text whatever their
//!   stored type, so numeric census codes become categorical levels.
//! - Numeric covariates must be complete and finite.

use crate::config::ColumnConfig;
use ahash::AHashSet;
use itertools::Itertools;
use ndarray::{Array1, ArrayView1};
use polars::prelude::*;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The required column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing or null values were found in the required column '{0}'.")]
    MissingValuesFound(String),
    #[error("Non-finite values (NaN or Infinity) were found in the required column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("Row {row}: exposure length must be strictly positive, found {value}.")]
    InvalidExposure { row: usize, value: f64 },
    #[error("Row {row}: outcome must be 0 or 1, found {value}.")]
    InvalidOutcome { row: usize, value: f64 },
    #[error("Covariate column '{name}' has {found} rows, expected {expected}.")]
    ColumnLengthMismatch {
        name: String,
        found: usize,
        expected: usize,
    },
    #[error("Covariate '{0}' is not present in the table.")]
    UnknownCovariate(String),
    #[error("The observation set is empty.")]
    Empty,
    #[error("Group key '{0}' is reserved for the pooled group of insufficient groups.")]
    ReservedGroupLabel(String),
}

/// One individual at one census, as described by the census data.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub group: String,
    pub plot: String,
    pub census: String,
    pub site: String,
    /// Numeric covariates by name: the hazard covariate and the controls.
    pub covariates: BTreeMap<String, f64>,
    /// Length of the census interval; strictly positive.
    pub exposure: f64,
    /// Death within the interval.
    pub outcome: bool,
}

/// The covariate table a fitted model predicts from: named numeric columns
/// plus the categorical census key.
#[derive(Debug, Clone, PartialEq)]
pub struct CovariateFrame {
    columns: BTreeMap<String, Array1<f64>>,
    census: Vec<String>,
}

impl CovariateFrame {
    pub fn new(
        columns: BTreeMap<String, Array1<f64>>,
        census: Vec<String>,
    ) -> Result<Self, DataError> {
        let expected = census.len();
        for (name, values) in &columns {
            if values.len() != expected {
                return Err(DataError::ColumnLengthMismatch {
                    name: name.clone(),
                    found: values.len(),
                    expected,
                });
            }
        }
        Ok(Self { columns, census })
    }

    pub fn n_rows(&self) -> usize {
        self.census.len()
    }

    pub fn column(&self, name: &str) -> Result<ArrayView1<'_, f64>, DataError> {
        self.columns
            .get(name)
            .map(|c| c.view())
            .ok_or_else(|| DataError::UnknownCovariate(name.to_string()))
    }

    pub fn column_mut(&mut self, name: &str) -> Result<&mut Array1<f64>, DataError> {
        self.columns
            .get_mut(name)
            .ok_or_else(|| DataError::UnknownCovariate(name.to_string()))
    }

    /// Overwrites every row of `name` with `value`.
    pub fn pin(&mut self, name: &str, value: f64) -> Result<(), DataError> {
        self.column_mut(name)?.fill(value);
        Ok(())
    }

    pub fn census(&self) -> &[String] {
        &self.census
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    fn select_rows(&self, rows: &[usize]) -> Self {
        let columns = self
            .columns
            .iter()
            .map(|(name, values)| {
                (
                    name.clone(),
                    rows.iter().map(|&r| values[r]).collect::<Array1<f64>>(),
                )
            })
            .collect();
        let census = rows.iter().map(|&r| self.census[r].clone()).collect();
        Self { columns, census }
    }
}

/// A validated, columnar set of observations.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationSet {
    pub group: Vec<String>,
    pub plot: Vec<String>,
    pub site: Vec<String>,
    pub covariates: CovariateFrame,
    pub exposure: Array1<f64>,
    /// 0/1 death indicator.
    pub outcome: Array1<f64>,
}

impl ObservationSet {
    /// Builds a set from row records. All records must carry the same covariate names.
    pub fn from_observations(observations: &[Observation]) -> Result<Self, DataError> {
        let first = observations.first().ok_or(DataError::Empty)?;
        let names: Vec<String> = first.covariates.keys().cloned().collect();

        let mut columns: BTreeMap<String, Vec<f64>> = names
            .iter()
            .map(|n| (n.clone(), Vec::with_capacity(observations.len())))
            .collect();
        let mut census = Vec::with_capacity(observations.len());
        let mut group = Vec::with_capacity(observations.len());
        let mut plot = Vec::with_capacity(observations.len());
        let mut site = Vec::with_capacity(observations.len());
        let mut exposure = Vec::with_capacity(observations.len());
        let mut outcome = Vec::with_capacity(observations.len());

        for obs in observations {
            if obs.covariates.len() != names.len() {
                return Err(DataError::ColumnLengthMismatch {
                    name: "covariates".to_string(),
                    found: obs.covariates.len(),
                    expected: names.len(),
                });
            }
            for (name, column) in columns.iter_mut() {
                let value = obs
                    .covariates
                    .get(name)
                    .ok_or_else(|| DataError::UnknownCovariate(name.clone()))?;
                column.push(*value);
            }
            group.push(obs.group.clone());
            plot.push(obs.plot.clone());
            census.push(obs.census.clone());
            site.push(obs.site.clone());
            exposure.push(obs.exposure);
            outcome.push(if obs.outcome { 1.0 } else { 0.0 });
        }

        let columns = columns
            .into_iter()
            .map(|(n, v)| (n, Array1::from_vec(v)))
            .collect();
        let set = Self {
            group,
            plot,
            site,
            covariates: CovariateFrame::new(columns, census)?,
            exposure: Array1::from_vec(exposure),
            outcome: Array1::from_vec(outcome),
        };
        set.validate()?;
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.group.len()
    }

    pub fn is_empty(&self) -> bool {
        self.group.is_empty()
    }

    /// Checks the row invariants: finite covariates, exposure > 0, outcome in {0, 1}.
    pub fn validate(&self) -> Result<(), DataError> {
        if self.is_empty() {
            return Err(DataError::Empty);
        }
        for (name, values) in &self.covariates.columns {
            if values.iter().any(|v| !v.is_finite()) {
                return Err(DataError::NonFiniteValuesFound(name.clone()));
            }
        }
        for (row, &value) in self.exposure.iter().enumerate() {
            if !(value > 0.0) || !value.is_finite() {
                return Err(DataError::InvalidExposure { row, value });
            }
        }
        for (row, &value) in self.outcome.iter().enumerate() {
            if value != 0.0 && value != 1.0 {
                return Err(DataError::InvalidOutcome { row, value });
            }
        }
        Ok(())
    }

    /// Copies the given rows into a new set, preserving their order.
    pub fn subset(&self, rows: &[usize]) -> Self {
        Self {
            group: rows.iter().map(|&r| self.group[r].clone()).collect(),
            plot: rows.iter().map(|&r| self.plot[r].clone()).collect(),
            site: rows.iter().map(|&r| self.site[r].clone()).collect(),
            covariates: self.covariates.select_rows(rows),
            exposure: rows.iter().map(|&r| self.exposure[r]).collect(),
            outcome: rows.iter().map(|&r| self.outcome[r]).collect(),
        }
    }

    /// Replaces every group key with `label`.
    pub fn relabel(mut self, label: &str) -> Self {
        self.group.iter_mut().for_each(|g| *g = label.to_string());
        self
    }

    /// Number of distinct census levels.
    pub fn census_levels(&self) -> usize {
        self.covariates.census.iter().collect::<AHashSet<_>>().len()
    }

    pub fn deaths(&self) -> usize {
        self.outcome.iter().filter(|&&y| y == 1.0).count()
    }
}

/// Number of distinct values, treating `-0.0` and `0.0` as equal.
pub fn count_distinct(values: ArrayView1<f64>) -> usize {
    values.iter().map(|v| (v + 0.0).to_bits()).unique().count()
}

/// `(min, max)` of a non-empty column.
pub fn value_range(values: ArrayView1<f64>) -> Option<(f64, f64)> {
    values.iter().copied().minmax().into_option()
}

/// Loads and validates observations from a tab-separated file.
pub fn load_observations(path: &Path, columns: &ColumnConfig) -> Result<ObservationSet, DataError> {
    log::info!("Loading observations from '{}'", path.display());

    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
        )
        .finish()?;

    let available: AHashSet<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    let mut required = vec![
        columns.group.as_str(),
        columns.plot.as_str(),
        columns.census.as_str(),
        columns.hazard.as_str(),
        columns.size.as_str(),
        columns.total_density.as_str(),
        columns.exposure.as_str(),
        columns.outcome.as_str(),
    ];
    if let Some(site) = &columns.site {
        required.push(site.as_str());
    }
    for name in &required {
        if !available.contains(*name) {
            return Err(DataError::ColumnNotFound(name.to_string()));
        }
    }

    let n = df.height();
    let group = internal::extract_text_column(&df, &columns.group)?;
    let plot = internal::extract_text_column(&df, &columns.plot)?;
    let census = internal::extract_text_column(&df, &columns.census)?;
    let site = match &columns.site {
        Some(name) => internal::extract_text_column(&df, name)?,
        None => vec![String::new(); n],
    };

    let mut covariates = BTreeMap::new();
    for name in [&columns.hazard, &columns.size, &columns.total_density] {
        let values = internal::extract_numeric_column(&df, name)?;
        covariates.insert(name.clone(), Array1::from_vec(values));
    }
    let exposure = Array1::from_vec(internal::extract_numeric_column(&df, &columns.exposure)?);
    let outcome = Array1::from_vec(internal::extract_numeric_column(&df, &columns.outcome)?);

    let set = ObservationSet {
        group,
        plot,
        site,
        covariates: CovariateFrame::new(covariates, census)?,
        exposure,
        outcome,
    };
    set.validate()?;
    log::info!(
        "Loaded {} observations ({} deaths) across {} groups.",
        set.len(),
        set.deaths(),
        set.group.iter().collect::<AHashSet<_>>().len()
    );
    Ok(set)
}

mod internal {
    use super::*;

    pub(super) fn extract_numeric_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<f64>, DataError> {
        let series = df.column(column_name)?;
        if series.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }
        let casted = series
            .cast(&DataType::Float64)
            .map_err(|_| DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            })?;
        if casted.null_count() > 0 {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            });
        }
        let values: Vec<f64> = casted.f64()?.rechunk().into_no_null_iter().collect();
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(values)
    }

    pub(super) fn extract_text_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<String>, DataError> {
        let column = df.column(column_name)?;
        if column.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }
        let casted = column.as_materialized_series().cast(&DataType::String)?;
        let values = casted
            .str()?
            .into_iter()
            .map(|v| v.unwrap_or_default().to_string())
            .collect();
        Ok(values)
    }
}
