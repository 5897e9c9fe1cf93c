//! Data-sufficiency screening of groups.
//!
//! Each group's hazard covariate must take at least `min_distinct_values`
//! distinct values over a range of at least `min_range`. Groups that fail are
//! merged, once, into a single pooled group before any model is fitted.

use crate::config::QualificationConfig;
use crate::data::{DataError, ObservationSet, count_distinct, value_range};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSufficiencyRecord {
    pub group: String,
    pub n_obs: usize,
    pub distinct_values: usize,
    pub range: f64,
    pub deaths: usize,
    pub survivors: usize,
    pub qualified: bool,
    /// Group the observations are modeled in: the group itself or the pooled label.
    pub assigned_group: String,
}

impl GroupSufficiencyRecord {
    pub fn compute(
        group: &str,
        observations: &ObservationSet,
        hazard: &str,
        config: &QualificationConfig,
    ) -> Result<Self, DataError> {
        let values = observations.covariates.column(hazard)?;
        let distinct_values = count_distinct(values);
        let range = value_range(values).map_or(0.0, |(lo, hi)| hi - lo);
        let deaths = observations.deaths();
        let qualified = distinct_values >= config.min_distinct_values && range >= config.min_range;
        Ok(Self {
            group: group.to_string(),
            n_obs: observations.len(),
            distinct_values,
            range,
            deaths,
            survivors: observations.len() - deaths,
            qualified,
            assigned_group: if qualified {
                group.to_string()
            } else {
                config.pooled_label.clone()
            },
        })
    }
}

/// The modelable groups of a run.
#[derive(Debug, Clone)]
pub struct QualifiedGroups {
    /// One record per original group, in key order.
    pub records: Vec<GroupSufficiencyRecord>,
    /// Record of the pooled group itself, when any group was pooled.
    pub pooled_record: Option<GroupSufficiencyRecord>,
    /// Standalone groups plus the pooled group, keyed by group label.
    pub groups: BTreeMap<String, ObservationSet>,
}

impl QualifiedGroups {
    /// Original groups merged into the pooled group.
    pub fn pooled_members(&self) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| !r.qualified)
            .map(|r| r.group.as_str())
            .collect()
    }
}

/// Partitions observations by group and pools the insufficient groups.
pub fn qualify_groups(
    observations: &ObservationSet,
    hazard: &str,
    config: &QualificationConfig,
) -> Result<QualifiedGroups, DataError> {
    let mut rows_by_group: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (row, group) in observations.group.iter().enumerate() {
        rows_by_group.entry(group.as_str()).or_default().push(row);
    }
    if rows_by_group.contains_key(config.pooled_label.as_str()) {
        return Err(DataError::ReservedGroupLabel(config.pooled_label.clone()));
    }

    let mut records = Vec::with_capacity(rows_by_group.len());
    let mut groups = BTreeMap::new();
    let mut pooled_rows = Vec::new();

    for (group, rows) in rows_by_group {
        let subset = observations.subset(&rows);
        let record = GroupSufficiencyRecord::compute(group, &subset, hazard, config)?;
        if record.qualified {
            groups.insert(group.to_string(), subset);
        } else {
            log::info!(
                "Group '{group}' has {} distinct '{hazard}' values over a range of {}; pooling into '{}'.",
                record.distinct_values,
                record.range,
                config.pooled_label
            );
            pooled_rows.extend(rows);
        }
        records.push(record);
    }

    let pooled_record = if pooled_rows.is_empty() {
        None
    } else {
        pooled_rows.sort_unstable();
        let pooled = observations
            .subset(&pooled_rows)
            .relabel(&config.pooled_label);
        let record =
            GroupSufficiencyRecord::compute(&config.pooled_label, &pooled, hazard, config)?;
        if !record.qualified {
            log::warn!(
                "The pooled group '{}' itself fails the sufficiency screen; fitting it anyway.",
                config.pooled_label
            );
        }
        groups.insert(config.pooled_label.clone(), pooled);
        Some(record)
    };

    Ok(QualifiedGroups {
        records,
        pooled_record,
        groups,
    })
}
