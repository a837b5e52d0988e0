use crate::GlobalConfiguration;
use anyhow::{bail, Context, Result};
use ndarray::{Array2, Array4};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;
use stochci::bitstring::{det_bytes, set_bit};
use stochci::matel::Integrals;
use stochci::power::Distribution;

/// Everything parsed from the `--hf-path` directory.
pub struct Setup {
    pub sys: SysParams,
    pub ints: Integrals,
    /// Irrep labels of the active spatial orbitals.
    pub symm: Vec<u8>,
}

pub fn load_setup(cfg: &GlobalConfiguration) -> Result<Setup> {
    let sys = read_sys_params(&cfg.hf_path)?;
    let ints = read_integrals(&cfg.hf_path, &sys)?;
    let symm_raw = read_symm(&cfg.hf_path, usize::from(sys.n_orb))?;
    let symm = symm_raw[usize::from(sys.n_frozen / 2)..].to_vec();
    Ok(Setup { sys, ints, symm })
}

pub fn parse_distribution(name: &str) -> Result<Distribution> {
    match name {
        "NU" => Ok(Distribution::NearUniform),
        "HB" => Ok(Distribution::HeatBath),
        "HB_unnorm" => Ok(Distribution::HeatBathUnnorm),
        other => bail!("unknown distribution '{other}'; expected NU, HB, or HB_unnorm"),
    }
}

/// Contents of `sys_params.txt`.
pub struct SysParams {
    pub n_elec: u8,
    pub n_frozen: u8,
    pub n_orb: u8,
    pub eps: f64,
    pub hf_energy: f64,
}

impl SysParams {
    /// Active spatial orbitals.
    pub fn n_active_orb(&self) -> u8 {
        self.n_orb - self.n_frozen / 2
    }

    /// Active electrons.
    pub fn n_active_elec(&self) -> u8 {
        self.n_elec - self.n_frozen
    }

    /// Bits in a determinant index.
    pub fn n_bits(&self) -> u8 {
        2 * self.n_active_orb()
    }
}

pub fn read_sys_params(hf_path: &Path) -> Result<SysParams> {
    let path = hf_path.join("sys_params.txt");
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("unable to open '{}'", path.display()))?;
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());

    let mut field = |key: &str| -> Result<f64> {
        let label = lines
            .next()
            .with_context(|| format!("missing label '{key}' in sys_params.txt"))?;
        if label.trim() != key {
            bail!("expected label '{key}' in sys_params.txt, found '{}'", label.trim());
        }
        let value = lines
            .next()
            .with_context(|| format!("missing value for '{key}' in sys_params.txt"))?;
        value
            .trim()
            .parse::<f64>()
            .with_context(|| format!("unparseable value for '{key}' in sys_params.txt"))
    };

    let n_elec = field("n_elec")? as u8;
    let n_frozen = field("n_frozen")? as u8;
    let n_orb = field("n_orb")? as u8;
    let eps = field("eps")?;
    let hf_energy = field("hf_energy")?;

    if n_frozen % 2 != 0 {
        bail!("n_frozen must be even, found {n_frozen}");
    }
    if n_elec <= n_frozen {
        bail!("no active electrons: n_elec = {n_elec}, n_frozen = {n_frozen}");
    }

    Ok(SysParams {
        n_elec,
        n_frozen,
        n_orb,
        eps,
        hf_energy,
    })
}

pub fn read_symm(hf_path: &Path, tot_orb: usize) -> Result<Vec<u8>> {
    let path = hf_path.join("symm.txt");
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("unable to open '{}'", path.display()))?;
    let labels: Vec<u8> = text
        .split_whitespace()
        .map(|token| token.parse::<u8>().context("unparseable irrep label"))
        .collect::<Result<_>>()?;
    if labels.len() != tot_orb {
        bail!(
            "symm.txt lists {} orbitals where {tot_orb} were expected",
            labels.len()
        );
    }
    if let Some(&bad) = labels.iter().find(|&&label| label >= 8) {
        bail!("irrep label {bad} is outside the point group");
    }
    Ok(labels)
}

fn read_csv_values(path: &Path, expected: usize) -> Result<Vec<f64>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("unable to open '{}'", path.display()))?;
    let values: Vec<f64> = text
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .map(|token| {
            token
                .parse::<f64>()
                .with_context(|| format!("unparseable number '{token}' in '{}'", path.display()))
        })
        .collect::<Result<_>>()?;
    if values.len() != expected {
        bail!(
            "'{}' holds {} values where {expected} were expected",
            path.display(),
            values.len()
        );
    }
    Ok(values)
}

pub fn read_integrals(hf_path: &Path, params: &SysParams) -> Result<Integrals> {
    let tot_orb = usize::from(params.n_orb);

    let h_core = read_csv_values(&hf_path.join("hcore.txt"), tot_orb * tot_orb)?;
    let h_core = Array2::from_shape_vec((tot_orb, tot_orb), h_core).unwrap();

    let eris = read_csv_values(&hf_path.join("eris.txt"), tot_orb.pow(4))?;
    let eris = Array4::from_shape_vec((tot_orb, tot_orb, tot_orb, tot_orb), eris).unwrap();

    Ok(Integrals::new(h_core, eris, params.n_frozen))
}

/// Reads the `<prefix>dets` / `<prefix>vals` trial-vector pair; the
/// determinants are decimal integers of at most 64 bits.
pub fn read_trial(prefix: &Path, n_bits: u8) -> Result<(Vec<u8>, Vec<f64>)> {
    let det_path = prefix.with_file_name(format!(
        "{}dets",
        prefix.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
    ));
    let val_path = prefix.with_file_name(format!(
        "{}vals",
        prefix.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
    ));

    let det_text = std::fs::read_to_string(&det_path)
        .with_context(|| format!("unable to open '{}'", det_path.display()))?;
    let val_text = std::fs::read_to_string(&val_path)
        .with_context(|| format!("unable to open '{}'", val_path.display()))?;

    let width = det_bytes(n_bits);
    let mut dets = vec![];
    for token in det_text.split_whitespace() {
        let bits: u64 = token.parse().context("unparseable determinant")?;
        dets.extend_from_slice(&bits.to_le_bytes()[..width]);
    }
    let vals: Vec<f64> = val_text
        .split_whitespace()
        .map(|token| token.parse::<f64>().context("unparseable trial value"))
        .collect::<Result<_>>()?;

    if dets.len() / width != vals.len() {
        bail!(
            "trial vector lists {} determinants but {} values",
            dets.len() / width,
            vals.len()
        );
    }
    Ok((dets, vals))
}

/// The Hartree-Fock determinant: the lowest active orbitals doubly
/// occupied.
pub fn hf_det(params: &SysParams) -> Vec<u8> {
    let n_orb = params.n_active_orb();
    let mut det = vec![0_u8; det_bytes(params.n_bits())];
    for sp in 0..params.n_active_elec() / 2 {
        set_bit(&mut det, sp);
        set_bit(&mut det, sp + n_orb);
    }
    det
}

/// Reads this rank's deterministic-subspace length back from `dense.txt`.
pub fn load_determ_len(dir: &Path, rank: usize) -> Result<usize> {
    let path = dir.join("dense.txt");
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("unable to open '{}'", path.display()))?;
    let lengths: Vec<usize> = text
        .trim()
        .split(',')
        .map(|token| token.trim().parse::<usize>().context("unparseable dense.txt"))
        .collect::<Result<_>>()?;
    lengths
        .get(rank)
        .copied()
        .with_context(|| format!("dense.txt lists no entry for rank {rank}"))
}

/// Appends one value to `<dir>/<name>`, one line per call.
pub fn append_value(dir: &Path, name: &str, value: impl std::fmt::Display) -> Result<()> {
    let path = dir.join(name);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("unable to append to '{}'", path.display()))?;
    writeln!(file, "{value}")?;
    Ok(())
}

/// Records the run parameters as YAML in `<dir>/params.txt`.
pub fn write_params<P: Serialize>(dir: &Path, params: &P) -> Result<()> {
    let text = serde_yaml::to_string(params).context("unable to serialise run parameters")?;
    std::fs::write(dir.join("params.txt"), text).context("unable to write params.txt")?;
    Ok(())
}
