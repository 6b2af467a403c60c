//! Smoke tests -- verify the binary runs and key subcommands work.

use assert_cmd::Command;
use predicates::prelude::*;

fn pimbridge() -> Command {
    let mut cmd = Command::cargo_bin("pimbridge").unwrap();
    // Keep the host's config out of the picture.
    cmd.env("PIMBRIDGE_CONFIG", "/nonexistent/pimbridge.toml");
    cmd
}

#[test]
fn test_cli_help() {
    pimbridge()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("processing-in-memory"));
}

#[test]
fn test_cli_version() {
    pimbridge()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("pimbridge"));
}

#[test]
fn test_subcommands_exist() {
    for sub in ["verify", "gemm", "eltwise", "config"] {
        pimbridge().args([sub, "--help"]).assert().success();
    }
}

#[test]
fn test_eltwise_add_regression() {
    pimbridge()
        .args(["eltwise", "--len", "32", "--op", "add"])
        .assert()
        .success()
        .stdout(predicates::str::contains("Add x 32"))
        .stdout(predicates::str::contains("3.0"))
        .stdout(predicates::str::contains("1.0").not());
}

#[test]
fn test_eltwise_rejects_unknown_op() {
    pimbridge()
        .args(["eltwise", "--op", "sub"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("unknown elementwise op"));
}

#[test]
fn test_gemm_prints_output_shape() {
    pimbridge()
        .args(["gemm", "--input", "2,3,4,8", "--out-width", "16", "--activation", "relu"])
        .assert()
        .success()
        .stdout(predicates::str::contains("output shape: [2, 3, 4, 16]"));
}

#[test]
fn test_gemm_no_block() {
    pimbridge()
        .args(["gemm", "--input", "3,4,8", "--out-width", "5", "--no-block"])
        .assert()
        .success()
        .stdout(predicates::str::contains("queued op"))
        .stdout(predicates::str::contains("output shape: [3, 4, 5]"));
}

#[test]
fn test_gemm_unsupported_rank_fails() {
    pimbridge()
        .args(["gemm", "--input", "4,8", "--out-width", "5"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("rank 2 not supported"));
}

#[test]
fn test_verify_json_passes() {
    pimbridge()
        .args(["verify", "--json", "--threads", "2"])
        .assert()
        .success()
        .stdout(predicates::str::contains("\"Pass\""))
        .stdout(predicates::str::contains("\"Fail\"").not());
}

#[test]
fn test_config_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pimbridge.toml");
    std::fs::write(&path, "[verify]\nseed = 77\n").unwrap();

    pimbridge()
        .args(["--config", path.to_str().unwrap(), "config"])
        .assert()
        .success()
        .stdout(predicates::str::contains("seed = 77"));
}
