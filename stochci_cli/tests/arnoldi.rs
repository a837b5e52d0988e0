#![allow(missing_docs)]

mod common;

use assert_cmd::Command;
use assert_fs::TempDir;
use ndarray::Array2;
use ndarray_npy::read_npy;

#[test]
fn projection_matrices_land_on_disk() {
    let hf = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    common::write_system(&hf);
    common::write_trial(&hf);

    Command::cargo_bin("stochci")
        .unwrap()
        .args(["-d", hf.path().to_str().unwrap()])
        .args(["-y", out.path().to_str().unwrap()])
        .args(["arnoldi", "--max-iter", "20", "--n-trial", "2"])
        .args(["--restart-int", "5", "--restart-technique", "eig"])
        .args(["--trial-vec", hf.path().join("trial").to_str().unwrap()])
        .assert()
        .success();

    for sample in 1..=4 {
        let b: Array2<f64> = read_npy(out.path().join(format!("b_mat_{sample}.npy"))).unwrap();
        let d: Array2<f64> = read_npy(out.path().join(format!("d_mat_{sample}.npy"))).unwrap();
        assert_eq!(b.dim(), (2, 2));
        assert_eq!(d.dim(), (2, 2));
        assert!(b.iter().chain(d.iter()).all(|value| value.is_finite()));
    }
}

#[test]
fn unknown_restart_technique_is_a_configuration_error() {
    let hf = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    common::write_system(&hf);

    Command::cargo_bin("stochci")
        .unwrap()
        .args(["-d", hf.path().to_str().unwrap()])
        .args(["-y", out.path().to_str().unwrap()])
        .args(["arnoldi", "--restart-technique", "qr"])
        .assert()
        .failure();
}
