use std::path::PathBuf;
use std::process::{Command, Output};

fn bin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_vecfit"))
}

fn run(args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run {:?} {:?}: {}", bin_path(), args, e))
}

const MIXTURE: &[&str] = &["--preset", "gauss-exp", "--events", "4000", "--seed", "3"];

#[test]
fn bench_prints_name_and_elapsed_rows() {
    let mut args = vec!["bench", "--backend", "scalar,cpu"];
    args.extend_from_slice(MIXTURE);
    let out = run(&args);
    assert!(out.status.success(), "stderr={}", String::from_utf8_lossy(&out.stderr));

    let stdout = String::from_utf8_lossy(&out.stdout);
    let rows: Vec<&str> = stdout.lines().collect();
    assert_eq!(rows.len(), 2, "stdout={stdout}");
    for (row, name) in rows.iter().zip(["fit_Scalar", "fit_CPU"]) {
        let mut cols = row.split_whitespace();
        assert_eq!(cols.next(), Some(name));
        let ms: f64 = cols.next().unwrap().parse().expect("elapsed ms column");
        assert!(ms >= 0.0);
    }
}

#[cfg(not(feature = "cuda"))]
#[test]
fn bench_completes_when_gpu_is_unavailable() {
    let mut args = vec!["bench", "--json"];
    args.extend_from_slice(MIXTURE);
    let out = run(&args);
    assert!(out.status.success(), "stderr={}", String::from_utf8_lossy(&out.stderr));

    let v: serde_json::Value = serde_json::from_slice(&out.stdout).expect("stdout should be JSON");
    assert_eq!(v["n_events"], 4000);
    let entries = v["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0]["outcome"], "completed");
    assert_eq!(entries[1]["outcome"], "completed");
    assert_eq!(entries[2]["name"], "fit_CUDA");
    assert_eq!(entries[2]["outcome"], "unavailable");
    assert!(entries[2]["reason"].as_str().unwrap().contains("cuda"));
}

#[test]
fn bench_repetitions_add_rows() {
    let mut args = vec!["bench", "--backend", "cpu", "--repetitions", "3", "--json"];
    args.extend_from_slice(MIXTURE);
    let out = run(&args);
    assert!(out.status.success(), "stderr={}", String::from_utf8_lossy(&out.stderr));
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let reps: Vec<u64> = v["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["repetition"].as_u64().unwrap())
        .collect();
    assert_eq!(reps, [0, 1, 2]);
}

#[test]
fn bench_rejects_unknown_backend() {
    let out = run(&["bench", "--backend", "tpu"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("tpu"));
}
