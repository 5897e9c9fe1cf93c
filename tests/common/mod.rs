#![allow(dead_code)]

use densdep::data::{Observation, ObservationSet};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// True log-hazard slope of the synthetic data in the density covariate.
pub const HAZARD_SLOPE: f64 = 0.35;
pub const BASE_LOG_HAZARD: f64 = -3.2;
pub const CENSUS_INTERVAL: f64 = 5.0;

fn log_hazard(con_dens: f64, height: f64) -> f64 {
    BASE_LOG_HAZARD + HAZARD_SLOPE * con_dens - 0.04 * height
}

/// `n` rows of one group, with the density covariate drawn from `levels`.
/// Deaths follow a cloglog hazard over a 5-year census interval.
pub fn group_rows(group: &str, levels: &[f64], n: usize, rng: &mut StdRng) -> Vec<Observation> {
    (0..n)
        .map(|i| {
            let con_dens = levels[rng.gen_range(0..levels.len())];
            let height = rng.gen_range(0.5..15.0_f64);
            let tot_dens = con_dens + rng.gen_range(0.0..8.0_f64);
            let eta = log_hazard(con_dens, height) + CENSUS_INTERVAL.ln();
            let p = 1.0 - (-eta.exp()).exp();
            Observation {
                group: group.to_string(),
                plot: format!("P{}", i % 7),
                census: format!("{}", 1 + i % 3),
                site: String::new(),
                covariates: BTreeMap::from([
                    ("con_dens".to_string(), con_dens),
                    ("height".to_string(), height),
                    ("tot_dens".to_string(), tot_dens),
                ]),
                exposure: CENSUS_INTERVAL,
                outcome: rng.r#gen::<f64>() < p,
            }
        })
        .collect()
}

/// Group A: 10 distinct density values spanning 5. Group B: 2 values spanning 0.5.
pub fn two_group_observations(seed: u64) -> Vec<Observation> {
    let mut rng = StdRng::seed_from_u64(seed);
    let a_levels: Vec<f64> = (0..10).map(|i| i as f64 * 5.0 / 9.0).collect();
    let mut rows = group_rows("A", &a_levels, 500, &mut rng);
    rows.extend(group_rows("B", &[0.0, 0.5], 300, &mut rng));
    rows
}

pub fn two_group_set(seed: u64) -> ObservationSet {
    ObservationSet::from_observations(&two_group_observations(seed)).unwrap()
}

/// Mean per-unit-time derivative of the death probability at the observed rows,
/// for an exposure of `offset`.
pub fn true_mean_slope(rows: &[Observation], offset: f64) -> f64 {
    let total: f64 = rows
        .iter()
        .map(|r| {
            let t = log_hazard(r.covariates["con_dens"], r.covariates["height"]).exp();
            offset * HAZARD_SLOPE * t * (-offset * t).exp()
        })
        .sum();
    total / rows.len() as f64
}

/// Renders observations as the tab-separated input file format.
pub fn to_tsv(rows: &[Observation]) -> String {
    let mut out = String::from("sp\tplot\tcensus\tcon_dens\theight\ttot_dens\tinterval\tstatus\n");
    for r in rows {
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            r.group,
            r.plot,
            r.census,
            r.covariates["con_dens"],
            r.covariates["height"],
            r.covariates["tot_dens"],
            r.exposure,
            u8::from(r.outcome)
        )
        .unwrap();
    }
    out
}
