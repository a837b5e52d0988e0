use crate::helpers::{self, Setup};
use crate::{GlobalConfiguration, Subcommand};
use anyhow::{bail, Result};
use clap::Parser;
use itertools::Itertools;
use ndarray_npy::write_npy;
use rand::SeedableRng;
use rand_pcg::Pcg64;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use stochci::arnoldi::{ArnoldiDriver, ArnoldiParams, NormTechnique, RestartTechnique};
use stochci::comm::{Comm, SerialComm, ThreadComm};
use stochci::hashtable::gen_scrambler;
use stochci::vector::DistVec;

/// Evolve a block of iterates and project onto trial vectors, for excited
/// states.
#[derive(Parser, Serialize)]
pub struct Opts {
    /// Number of trial vectors; the largest-magnitude elements of the
    /// trial-vector file seed one iterate each.
    #[arg(long, default_value_t = 2)]
    n_trial: usize,
    /// Compression target per iterate.
    #[arg(long, short = 'm', default_value_t = 1000)]
    vec_nonz: usize,
    /// Trial-vector file prefix (reads <prefix>dets and <prefix>vals).
    #[arg(long, value_name = "PREFIX")]
    trial_vec: Option<PathBuf>,
    /// Iterations between restarts.
    #[arg(long, default_value_t = 10)]
    restart_int: u64,
    /// Restart recombination: eig, h_inv, or r_inv.
    #[arg(long, default_value = "eig")]
    restart_technique: String,
    /// Iterate normalisation: none, 1-norm, or max-1-norm.
    #[arg(long, default_value = "1-norm")]
    norm_technique: String,
    /// Initial capacity of the determinant store.
    #[arg(long, short = 'p', default_value_t = 4096)]
    max_dets: usize,
    /// Iterations to run.
    #[arg(long, default_value_t = 200)]
    max_iter: u64,
}

fn parse_restart(name: &str) -> Result<RestartTechnique> {
    match name {
        "eig" => Ok(RestartTechnique::Eig),
        "h_inv" => Ok(RestartTechnique::HInv),
        "r_inv" => Ok(RestartTechnique::RInv),
        other => bail!("unknown restart technique '{other}'; expected eig, h_inv, or r_inv"),
    }
}

fn parse_norm(name: &str) -> Result<NormTechnique> {
    match name {
        "none" => Ok(NormTechnique::None),
        "1-norm" => Ok(NormTechnique::OneNorm),
        "max-1-norm" => Ok(NormTechnique::MaxOneNorm),
        other => bail!("unknown norm technique '{other}'; expected none, 1-norm, or max-1-norm"),
    }
}

impl Subcommand for Opts {
    fn run(&self, cfg: &GlobalConfiguration) -> Result<ExitCode> {
        let setup = helpers::load_setup(cfg)?;
        parse_restart(&self.restart_technique)?;
        parse_norm(&self.norm_technique)?;
        if self.n_trial == 0 {
            bail!("--n-trial must be positive");
        }

        std::fs::create_dir_all(&cfg.result_dir)?;
        helpers::write_params(&cfg.result_dir, self)?;

        if cfg.procs <= 1 {
            run_rank(&SerialComm, cfg, self, &setup)?;
        } else {
            let comms = ThreadComm::create(cfg.procs);
            let setup_ref = &setup;
            std::thread::scope(|scope| -> Result<()> {
                let handles: Vec<_> = comms
                    .into_iter()
                    .map(|comm| scope.spawn(move || run_rank(&comm, cfg, self, setup_ref)))
                    .collect();
                for handle in handles {
                    handle.join().expect("rank panicked")?;
                }
                Ok(())
            })?;
        }
        Ok(ExitCode::SUCCESS)
    }
}

fn run_rank<C: Comm>(
    comm: &C,
    cfg: &GlobalConfiguration,
    opts: &Opts,
    setup: &Setup,
) -> Result<()> {
    let sys = &setup.sys;
    let n_bits = sys.n_bits();
    let n_orb = sys.n_active_orb();
    let n_occ = usize::from(sys.n_active_elec());
    let det_width = stochci::bitstring::det_bytes(n_bits);

    let common = gen_scrambler(n_bits, &mut Pcg64::seed_from_u64(cfg.seed));
    let local = gen_scrambler(
        n_bits,
        &mut Pcg64::seed_from_u64(cfg.seed ^ (comm.rank() as u64 + 1).wrapping_mul(0x9e3779b97f4a7c15)),
    );

    let mut vec: DistVec<f64> = DistVec::new(
        n_bits,
        n_occ,
        2 * opts.n_trial,
        opts.max_dets,
        16 * opts.vec_nonz + 4096,
        comm.size(),
        common,
        local,
    );

    // the n_trial largest-magnitude trial elements each seed one trial
    // vector and the matching initial iterate
    let (t_dets, t_vals) = match &opts.trial_vec {
        Some(prefix) => helpers::read_trial(prefix, n_bits)?,
        None => (helpers::hf_det(sys), vec![1.0]),
    };
    let elements: Vec<(&[u8], f64)> = t_dets
        .chunks_exact(det_width)
        .zip(t_vals.iter().copied())
        .sorted_by(|(_, x), (_, y)| y.abs().partial_cmp(&x.abs()).unwrap())
        .collect();
    if elements.len() < opts.n_trial {
        bail!(
            "the trial vector holds {} elements, fewer than the {} trials requested",
            elements.len(),
            opts.n_trial
        );
    }

    let mut trial_dets = vec![];
    let mut trial_vals = vec![];
    for (t, &(det, _)) in elements.iter().take(opts.n_trial).enumerate() {
        vec.set_curr_vec_idx(t);
        if comm.rank() == 0 {
            vec.add(det, 1.0, true, comm);
        }
        vec.perform_add(comm);
        trial_dets.push(det.to_vec());
        trial_vals.push(vec![1.0]);
    }

    let params = ArnoldiParams {
        eps: sys.eps,
        restart_int: opts.restart_int,
        restart_technique: parse_restart(&opts.restart_technique)?,
        norm_technique: parse_norm(&opts.norm_technique)?,
        target_nonz: opts.vec_nonz,
    };
    let rng = Pcg64::seed_from_u64(cfg.seed.wrapping_add(1 + comm.rank() as u64));
    let mut driver = ArnoldiDriver::new(
        vec,
        &trial_dets,
        &trial_vals,
        params,
        &setup.ints,
        &setup.symm,
        n_orb,
        comm,
        rng,
    );

    for iteration in 1..=opts.max_iter {
        let stats = driver.iterate();
        if comm.rank() == 0 && iteration % opts.restart_int == 0 {
            let sample = iteration / opts.restart_int;
            write_npy(
                cfg.result_dir.join(format!("b_mat_{sample}.npy")),
                &stats.h_overlap,
            )?;
            write_npy(
                cfg.result_dir.join(format!("d_mat_{sample}.npy")),
                &stats.overlap,
            )?;
        }
    }
    Ok(())
}
