mod common;

use std::fs;
use std::process::Command;

use tempfile::tempdir;

#[test]
fn run_writes_all_tables() {
    let tmp = tempdir().expect("temporary directory");
    let input = tmp.path().join("observations.tsv");
    fs::write(&input, common::to_tsv(&common::two_group_observations(21))).expect("write input");
    let config = tmp.path().join("analysis.toml");
    fs::write(
        &config,
        "[marginal]\nkeep_samples = false\n\n[[marginal.scenarios]]\nname = \"slope\"\nchange = { kind = \"derivative\" }\n",
    )
    .expect("write config");
    let out = tmp.path().join("results");

    let status = Command::new(env!("CARGO_BIN_EXE_densdep"))
        .args([
            "run",
            input.to_str().expect("path str"),
            "--out",
            out.to_str().expect("path str"),
            "--config",
            config.to_str().expect("path str"),
            "--iterations",
            "50",
            "--threads",
            "2",
        ])
        .status()
        .expect("run densdep cli");

    assert!(status.success(), "CLI exited with status {status:?}");
    for name in [
        "sufficiency.tsv",
        "model_report.tsv",
        "coefficients.tsv",
        "fit_summary.tsv",
        "ame.tsv",
        "rame.tsv",
    ] {
        assert!(out.join(name).exists(), "{name} missing");
    }
    assert!(!out.join("ame_samples.tsv").exists());
    let rame = fs::read_to_string(out.join("rame.tsv")).expect("read rame");
    assert_eq!(rame.lines().count(), 3);
}

#[test]
fn qualify_reports_pooled_groups() {
    let tmp = tempdir().expect("temporary directory");
    let input = tmp.path().join("observations.tsv");
    fs::write(&input, common::to_tsv(&common::two_group_observations(4))).expect("write input");

    let output = Command::new(env!("CARGO_BIN_EXE_densdep"))
        .args(["qualify", input.to_str().expect("path str")])
        .output()
        .expect("run densdep cli");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("pooled into 'insufficient_data': B"));
}

#[test]
fn invalid_configuration_exits_with_error() {
    let tmp = tempdir().expect("temporary directory");
    let input = tmp.path().join("observations.tsv");
    fs::write(&input, common::to_tsv(&common::two_group_observations(4))).expect("write input");

    let output = Command::new(env!("CARGO_BIN_EXE_densdep"))
        .args([
            "run",
            input.to_str().expect("path str"),
            "--out",
            tmp.path().join("out").to_str().expect("path str"),
            "--iterations",
            "1",
        ])
        .output()
        .expect("run densdep cli");

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error:"));
}
