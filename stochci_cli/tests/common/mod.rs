#![allow(missing_docs)]
#![allow(dead_code)]

use assert_fs::fixture::{FileWriteStr, PathChild};
use assert_fs::TempDir;
use ndarray::Array4;

fn set_eri(eris: &mut Array4<f64>, i: usize, j: usize, k: usize, l: usize, value: f64) {
    for [p, q, r, s] in [
        [i, j, k, l],
        [j, i, k, l],
        [i, j, l, k],
        [j, i, l, k],
        [k, l, i, j],
        [l, k, i, j],
        [k, l, j, i],
        [l, k, j, i],
    ] {
        eris[[p, q, r, s]] = value;
    }
}

/// Writes a coupled 2-orbital, 2-electron system into `dir`.
pub fn write_system(dir: &TempDir) {
    dir.child("sys_params.txt")
        .write_str("n_elec\n2\nn_frozen\n0\nn_orb\n2\neps\n0.01\nhf_energy\n-1.4\n")
        .unwrap();
    dir.child("symm.txt").write_str("0 0\n").unwrap();
    dir.child("hcore.txt")
        .write_str("-1.0,0.15,0.15,-2.0\n")
        .unwrap();

    let mut eris = Array4::zeros((2, 2, 2, 2));
    set_eri(&mut eris, 0, 0, 0, 0, 0.6);
    set_eri(&mut eris, 1, 1, 1, 1, 0.55);
    set_eri(&mut eris, 0, 0, 1, 1, 0.45);
    set_eri(&mut eris, 0, 1, 0, 1, 0.12);
    set_eri(&mut eris, 0, 1, 1, 1, 0.07);
    set_eri(&mut eris, 0, 0, 0, 1, 0.05);

    let values: Vec<String> = eris.iter().map(ToString::to_string).collect();
    dir.child("eris.txt").write_str(&values.join(",")).unwrap();
}

/// Writes a trial-vector pair over the four Sz = 0 determinants.
pub fn write_trial(dir: &TempDir) {
    // bit strings {0,2}, {0,3}, {1,2}, {1,3} as decimal integers
    dir.child("trialdets").write_str("5\n9\n6\n10\n").unwrap();
    dir.child("trialvals")
        .write_str("1.0\n0.8\n0.6\n0.4\n")
        .unwrap();
}

/// Parses a one-value-per-line output file.
pub fn read_column(dir: &TempDir, name: &str) -> Vec<f64> {
    std::fs::read_to_string(dir.child(name).path())
        .unwrap()
        .lines()
        .map(|line| line.trim().parse().unwrap())
        .collect()
}
