use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn bin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_vecfit"))
}

fn tmp_path(filename: &str) -> PathBuf {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let mut p = std::env::temp_dir();
    p.push(format!("vecfit_cli_{}_{}_{}", std::process::id(), nanos, filename));
    p
}

fn run_json(args: &[&str]) -> serde_json::Value {
    let out: Output = Command::new(bin_path())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run {:?} {:?}: {}", bin_path(), args, e));
    assert!(out.status.success(), "stderr={}", String::from_utf8_lossy(&out.stderr));
    serde_json::from_slice(&out.stdout).expect("stdout should be JSON")
}

#[test]
fn generate_reports_row_count_and_digest() {
    let v = run_json(&["generate", "--events", "1234", "--seed", "9"]);
    assert_eq!(v["n_events"], 1234);
    assert_eq!(v["observable"], "x");
    assert_eq!(v["digest"].as_str().unwrap().len(), 64);
}

#[test]
fn same_seed_gives_identical_digest() {
    let args = ["generate", "--preset", "gauss-exp", "--events", "500", "--seed", "42"];
    let a = run_json(&args);
    let b = run_json(&args);
    assert_eq!(a["digest"], b["digest"]);

    let c = run_json(&["generate", "--preset", "gauss-exp", "--events", "500", "--seed", "43"]);
    assert_ne!(a["digest"], c["digest"]);
}

#[test]
fn zero_events_is_valid() {
    let v = run_json(&["generate", "--preset", "gauss-exp", "--events", "0"]);
    assert_eq!(v["n_events"], 0);
}

#[test]
fn generate_writes_columns() {
    let path = tmp_path("data.json");
    run_json(&["generate", "--preset", "gauss-exp", "--events", "50", "--output", path.to_str().unwrap()]);
    let text = std::fs::read_to_string(&path).expect("dataset file should exist");
    let _ = std::fs::remove_file(&path);
    let v: serde_json::Value = serde_json::from_str(&text).unwrap();
    let column = v["columns"][0].as_array().unwrap();
    assert_eq!(column.len(), 50);
    assert!(column.iter().all(|x| (0.0..=20.0).contains(&x.as_f64().unwrap())));
}

#[test]
fn backends_lists_every_strategy() {
    let v = run_json(&["backends", "--json"]);
    let rows = v.as_array().unwrap();
    let names: Vec<&str> = rows.iter().map(|r| r["name"].as_str().unwrap()).collect();
    assert_eq!(names, ["fit_Scalar", "fit_CPU", "fit_CUDA"]);
    assert_eq!(rows[0]["available"], true);
    assert_eq!(rows[1]["available"], true);
    if cfg!(not(feature = "cuda")) {
        assert_eq!(rows[2]["registered"], false);
        assert_eq!(rows[2]["available"], false);
    }
}
