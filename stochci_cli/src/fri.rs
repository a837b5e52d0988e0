use crate::helpers::{self, Setup};
use crate::{GlobalConfiguration, Subcommand};
use anyhow::{bail, Result};
use clap::Parser;
use itertools::Itertools;
use rand::SeedableRng;
use rand_pcg::Pcg64;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use stochci::comm::{Comm, SerialComm, ThreadComm};
use stochci::hashtable::{gen_scrambler, load_scrambler};
use stochci::power::{FriDriver, PowerParams, TrialVector};
use stochci::symm::SymmLookup;
use stochci::vector::DistVec;

/// Run systematic FRI on the Hamiltonian under `--hf-path`.
#[derive(Parser, Serialize)]
pub struct Opts {
    /// One-norm at which the shift starts tracking the iterate.
    #[arg(long, short = 't', default_value_t = 1000.0)]
    target_norm: f64,
    /// Compression target for the iterate's support.
    #[arg(long, short = 'm', default_value_t = 1000)]
    vec_nonz: usize,
    /// Target number of off-diagonal draws per iteration.
    #[arg(long, short = 'M', default_value_t = 10_000)]
    mat_nonz: usize,
    /// Initiator threshold on the element magnitude; 0 disables gating.
    #[arg(long, short = 'i', default_value_t = 0.0)]
    initiator_thresh: f64,
    /// Leading trial-vector elements treated exactly (the deterministic
    /// subspace), largest magnitudes first.
    #[arg(long, short = 's', default_value_t = 0)]
    det_space: usize,
    /// Initial capacity of the determinant store.
    #[arg(long, short = 'p', default_value_t = 4096)]
    max_dets: usize,
    /// Trial-vector file prefix (reads <prefix>dets and <prefix>vals).
    #[arg(long, value_name = "PREFIX")]
    trial_vec: Option<PathBuf>,
    /// Restore a checkpoint from this directory before iterating.
    #[arg(long, short = 'l', value_name = "DIR")]
    load_dir: Option<PathBuf>,
    /// Iterations to run.
    #[arg(long, default_value_t = 1000)]
    max_iter: u64,
    /// Iterations between shift updates.
    #[arg(long, default_value_t = 10)]
    shift_interval: u32,
    /// Iterations between checkpoints.
    #[arg(long, default_value_t = 1000)]
    save_interval: u64,
    /// Weight of the double-excitation branch of the factored sampling.
    #[arg(long, default_value_t = 0.4)]
    p_doub: f64,
    /// Damping of the shift update.
    #[arg(long, default_value_t = 0.05)]
    damping: f64,
}

impl Subcommand for Opts {
    fn run(&self, cfg: &GlobalConfiguration) -> Result<ExitCode> {
        let setup = helpers::load_setup(cfg)?;
        if self.vec_nonz == 0 {
            bail!("--vec-nonz must be positive");
        }
        if self.mat_nonz == 0 {
            bail!("--mat-nonz must be positive");
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
    let lookup = SymmLookup::new(&setup.symm);

    let common = match &opts.load_dir {
        Some(dir) => load_scrambler(&dir.join("hash.dat"), n_bits)?,
        None => gen_scrambler(n_bits, &mut Pcg64::seed_from_u64(cfg.seed)),
    };
    let local = gen_scrambler(
        n_bits,
        &mut Pcg64::seed_from_u64(cfg.seed ^ (comm.rank() as u64 + 1).wrapping_mul(0x9e3779b97f4a7c15)),
    );

    let adder_cap = 4 * opts.mat_nonz + 4096;
    let mut vec: DistVec<f64> = DistVec::new(
        n_bits,
        n_occ,
        1,
        opts.max_dets,
        adder_cap,
        comm.size(),
        common,
        local,
    );

    let (t_dets, t_vals) = match &opts.trial_vec {
        Some(prefix) => helpers::read_trial(prefix, n_bits)?,
        None => (helpers::hf_det(sys), vec![1.0]),
    };

    if let Some(dir) = &opts.load_dir {
        vec.load(dir, comm)?;
        vec.set_n_determ(helpers::load_determ_len(dir, comm.rank())?);
    } else {
        // initial vector: the trial elements, largest magnitudes first so
        // the leading det_space positions become the deterministic
        // subspace on whichever rank owns them
        let elements: Vec<(&[u8], f64)> = t_dets
            .chunks_exact(det_width)
            .zip(t_vals.iter().copied())
            .sorted_by(|(_, x), (_, y)| y.abs().partial_cmp(&x.abs()).unwrap())
            .collect();

        if comm.rank() == 0 {
            for &(det, val) in elements.iter().take(opts.det_space) {
                vec.add(det, val, true, comm);
            }
        }
        vec.perform_add(comm);
        vec.set_n_determ(vec.n_nonz());
        vec.set_min_del_idx(vec.n_nonz());

        if comm.rank() == 0 {
            for &(det, val) in elements.iter().skip(opts.det_space) {
                vec.add(det, val, true, comm);
            }
        }
        vec.perform_add(comm);
    }

    let trial = TrialVector::build(
        &t_dets,
        &t_vals,
        &mut vec,
        &setup.ints,
        &setup.symm,
        n_orb,
        n_occ,
    );

    let params = PowerParams {
        eps: sys.eps,
        p_doub: opts.p_doub,
        init_thresh: opts.initiator_thresh,
        target_norm: opts.target_norm,
        damping: opts.damping,
        shift_interval: opts.shift_interval,
        matr_samp: opts.mat_nonz,
        target_nonz: opts.vec_nonz,
    };
    let rng = Pcg64::seed_from_u64(cfg.seed.wrapping_add(1 + comm.rank() as u64));
    let mut driver = FriDriver::new(
        vec,
        params,
        &setup.ints,
        &setup.symm,
        &lookup,
        n_orb,
        trial,
        sys.hf_energy,
        comm,
        rng,
    );

    for iteration in 1..=opts.max_iter {
        let stats = driver.iterate();
        if comm.rank() == 0 {
            helpers::append_value(&cfg.result_dir, "projnum.txt", stats.proj_num)?;
            helpers::append_value(&cfg.result_dir, "projden.txt", stats.proj_den)?;
            helpers::append_value(&cfg.result_dir, "N.txt", stats.one_norm)?;
            helpers::append_value(&cfg.result_dir, "nonz.txt", stats.n_nonz)?;
            helpers::append_value(&cfg.result_dir, "sign.txt", stats.nonini_occupied_adds)?;
            if iteration % u64::from(opts.shift_interval) == 0 {
                helpers::append_value(&cfg.result_dir, "S.txt", stats.shift)?;
                helpers::append_value(&cfg.result_dir, "norm.txt", stats.one_norm)?;
            }
        }
        if iteration % opts.save_interval == 0 {
            driver.vec.save(&cfg.result_dir, comm)?;
        }
    }
    driver.vec.save(&cfg.result_dir, comm)?;
    Ok(())
}
