#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Mutex;

use densdep::aggregate::{EffectRow, write_tsv};
use densdep::config::AnalysisConfig;
use densdep::data::load_observations;
use densdep::pipeline::{AnalysisResults, ProgressObserver, Stage, run_analysis};
use densdep::qualify::qualify_groups;

#[derive(Parser)]
#[command(
    name = "densdep",
    version,
    about = "Density-dependent mortality: per-group smooth hazard models and average marginal effects"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Screen, fit and estimate marginal effects for every group
    #[command(about = "Run the full analysis (outputs: *.tsv tables in --out)")]
    Run(RunArgs),

    /// Show the data-sufficiency screen without fitting any model
    #[command(about = "Print the sufficiency table and the pooled membership")]
    Qualify(QualifyArgs),

    /// Print the effective configuration as TOML
    #[command(about = "Print the default (or loaded) configuration as TOML")]
    Config(ConfigArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Path to the tab-separated observations file
    #[arg(value_name = "OBSERVATIONS")]
    observations: PathBuf,

    /// Directory the result tables are written to
    #[arg(long, value_name = "DIR")]
    out: PathBuf,

    /// Analysis configuration (TOML); defaults apply when omitted
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Number of coefficient draws per marginal effect
    #[arg(long, value_name = "N")]
    iterations: Option<usize>,

    /// Base seed of the coefficient draws
    #[arg(long)]
    seed: Option<u64>,

    /// Exposure length the probabilities refer to
    #[arg(long)]
    offset: Option<f64>,

    /// Minimum distinct hazard-covariate values of a standalone group
    #[arg(long, value_name = "N")]
    min_distinct: Option<usize>,

    /// Minimum hazard-covariate range of a standalone group
    #[arg(long)]
    min_range: Option<f64>,

    /// Worker threads (defaults to all cores)
    #[arg(long, value_name = "N")]
    threads: Option<usize>,

    /// Do not write the per-draw samples tables
    #[arg(long)]
    no_samples: bool,
}

#[derive(Args)]
struct QualifyArgs {
    /// Path to the tab-separated observations file
    #[arg(value_name = "OBSERVATIONS")]
    observations: PathBuf,

    /// Analysis configuration (TOML); defaults apply when omitted
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write the sufficiency table to this path instead of only printing it
    #[arg(long, value_name = "PATH")]
    out: Option<PathBuf>,
}

#[derive(Args)]
struct ConfigArgs {
    /// Configuration file to validate and echo
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn load_config(path: Option<&Path>) -> Result<AnalysisConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            println!("Loading configuration from: {}", path.display());
            Ok(AnalysisConfig::load(path)?)
        }
        None => Ok(AnalysisConfig::default()),
    }
}

impl RunArgs {
    fn apply_overrides(&self, config: &mut AnalysisConfig) {
        if let Some(iterations) = self.iterations {
            config.marginal.iterations = iterations;
        }
        if let Some(seed) = self.seed {
            config.marginal.seed = seed;
        }
        if let Some(offset) = self.offset {
            config.marginal.offset = offset;
        }
        if let Some(min_distinct) = self.min_distinct {
            config.qualification.min_distinct_values = min_distinct;
        }
        if let Some(min_range) = self.min_range {
            config.qualification.min_range = min_range;
        }
        if self.threads.is_some() {
            config.threads = self.threads;
        }
        if self.no_samples {
            config.marginal.keep_samples = false;
        }
    }
}

/// Progress bar per pipeline stage.
struct BarObserver {
    bar: Mutex<Option<ProgressBar>>,
}

impl BarObserver {
    fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }
}

impl ProgressObserver for BarObserver {
    fn stage_started(&self, stage: Stage, tasks: usize) {
        let bar = ProgressBar::new(tasks as u64);
        if let Ok(style) = ProgressStyle::with_template(&format!(
            ">  {stage:<28} [{{bar:40.cyan/blue}}] {{pos}}/{{len}} ({{eta}})"
        )) {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏ "));
        }
        if let Ok(mut slot) = self.bar.lock() {
            *slot = Some(bar);
        }
    }

    fn task_finished(&self, _stage: Stage) {
        if let Ok(slot) = self.bar.lock() {
            if let Some(bar) = slot.as_ref() {
                bar.inc(1);
            }
        }
    }

    fn stage_finished(&self, _stage: Stage) {
        if let Ok(mut slot) = self.bar.lock() {
            if let Some(bar) = slot.take() {
                bar.finish();
            }
        }
    }
}

fn print_effects(title: &str, rows: &[EffectRow]) {
    if rows.is_empty() {
        return;
    }
    println!("\n{title}:");
    println!("  {:<24} {:<16} {:>14} {:>14}", "group", "scenario", "estimate", "std_error");
    for row in rows {
        println!(
            "  {:<24} {:<16} {:>14.6e} {:>14.6e}",
            row.group, row.scenario, row.estimate, row.std_error
        );
    }
}

fn print_summary(results: &AnalysisResults) {
    println!(
        "\nAccepted groups: {}",
        results
            .accepted
            .iter()
            .map(|a| a.group.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    if !results.pooled_members.is_empty() {
        println!("Pooled groups: {}", results.pooled_members.join(", "));
    }
    for row in results.rejected_models() {
        println!(
            "Rejected: {} ({} model) at {}: {}",
            row.group, row.model, row.state, row.reason
        );
    }
    for failure in &results.tables.effect_failures {
        println!(
            "Marginal effects failed: {} / {}: {}",
            failure.group, failure.scenario, failure.reason
        );
    }
    print_effects("AME", &results.tables.ame);
    print_effects("rAME", &results.tables.rame);
}

fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(args.config.as_deref())?;
    args.apply_overrides(&mut config);
    config.validate()?;

    println!("Loading observations from: {}", args.observations.display());
    let observations = load_observations(&args.observations, &config.columns)?;
    println!("Loaded {} observations.", observations.len());

    let observer = BarObserver::new();
    let results = run_analysis(&observations, &config, &observer)?;
    print_summary(&results);

    let written = results.tables.write_to_dir(&args.out)?;
    println!("\nWrote {} tables to: {}", written.len(), args.out.display());
    Ok(())
}

fn qualify(args: QualifyArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args.config.as_deref())?;
    let observations = load_observations(&args.observations, &config.columns)?;
    let qualified = qualify_groups(&observations, &config.columns.hazard, &config.qualification)?;

    println!(
        "  {:<24} {:>8} {:>9} {:>10} {:>7} {:>10}  {}",
        "group", "n_obs", "distinct", "range", "deaths", "survivors", "assigned"
    );
    for r in qualified.records.iter().chain(qualified.pooled_record.iter()) {
        println!(
            "  {:<24} {:>8} {:>9} {:>10.4} {:>7} {:>10}  {}",
            r.group, r.n_obs, r.distinct_values, r.range, r.deaths, r.survivors, r.assigned_group
        );
    }
    let pooled = qualified.pooled_members();
    if pooled.is_empty() {
        println!("\nEvery group qualifies on its own.");
    } else {
        println!(
            "\n{} group(s) pooled into '{}': {}",
            pooled.len(),
            config.qualification.pooled_label,
            pooled.join(", ")
        );
    }

    if let Some(out) = &args.out {
        let mut rows = qualified.records.clone();
        rows.extend(qualified.pooled_record.clone());
        write_tsv(out, &rows)?;
        println!("Sufficiency table saved to: {}", out.display());
    }
    Ok(())
}

fn print_config(args: ConfigArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => AnalysisConfig::load(path)?,
        None => AnalysisConfig::default(),
    };
    print!("{}", config.to_toml()?);
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let Cli { command } = Cli::parse();

    let result = match command {
        Some(Commands::Run(args)) => run(args),
        Some(Commands::Qualify(args)) => qualify(args),
        Some(Commands::Config(args)) => print_config(args),
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
