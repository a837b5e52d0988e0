use crate::helpers::{self, Setup};
use crate::{GlobalConfiguration, Subcommand};
use anyhow::{bail, Result};
use clap::Parser;
use rand::SeedableRng;
use rand_pcg::Pcg64;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use stochci::comm::{Comm, SerialComm, ThreadComm};
use stochci::hashtable::{gen_scrambler, load_scrambler};
use stochci::power::{FciqmcDriver, PowerParams, TrialVector};
use stochci::symm::SymmLookup;
use stochci::vector::DistVec;

/// Run integer-walker FCIQMC on the Hamiltonian under `--hf-path`.
#[derive(Parser, Serialize)]
pub struct Opts {
    /// One-norm at which the shift starts tracking the population.
    #[arg(long, short = 't', default_value_t = 1000.0)]
    target_norm: f64,
    /// Initial walkers on the Hartree-Fock determinant.
    #[arg(long, short = 'n', default_value_t = 100)]
    ini_vec: u32,
    /// Initiator threshold on the walker count; 0 disables gating.
    #[arg(long, short = 'i', default_value_t = 0.0)]
    initiator_thresh: f64,
    /// Initial capacity of the determinant store.
    #[arg(long, short = 'p', default_value_t = 4096)]
    max_dets: usize,
    /// Proposal distribution: NU, HB, or HB_unnorm.
    #[arg(long, short = 'q', default_value = "NU")]
    distribution: String,
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
    /// Probability of attempting a double excitation.
    #[arg(long, default_value_t = 0.4)]
    p_doub: f64,
    /// Damping of the shift update.
    #[arg(long, default_value_t = 0.05)]
    damping: f64,
}

impl Subcommand for Opts {
    fn run(&self, cfg: &GlobalConfiguration) -> Result<ExitCode> {
        let setup = helpers::load_setup(cfg)?;
        helpers::parse_distribution(&self.distribution)?;
        if self.max_dets == 0 {
            bail!("--max-dets must be positive");
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
    let lookup = SymmLookup::new(&setup.symm);
    let distribution = helpers::parse_distribution(&opts.distribution)?;

    // the common scrambler is derived from the seed identically on every
    // rank, or restored from the checkpoint it was persisted to
    let common = match &opts.load_dir {
        Some(dir) => load_scrambler(&dir.join("hash.dat"), n_bits)?,
        None => gen_scrambler(n_bits, &mut Pcg64::seed_from_u64(cfg.seed)),
    };
    let local = gen_scrambler(
        n_bits,
        &mut Pcg64::seed_from_u64(cfg.seed ^ (comm.rank() as u64 + 1).wrapping_mul(0x9e3779b97f4a7c15)),
    );

    let adder_cap = (4.0 * opts.target_norm) as usize + 4096;
    let mut vec: DistVec<i32> = DistVec::new(
        n_bits,
        n_occ,
        1,
        opts.max_dets,
        adder_cap,
        comm.size(),
        common,
        local,
    );

    if let Some(dir) = &opts.load_dir {
        vec.load(dir, comm)?;
    } else {
        if comm.rank() == 0 {
            vec.add(&helpers::hf_det(sys), opts.ini_vec as i32, true, comm);
        }
        vec.perform_add(comm);
    }

    let (t_dets, t_vals) = match &opts.trial_vec {
        Some(prefix) => helpers::read_trial(prefix, n_bits)?,
        None => (helpers::hf_det(sys), vec![1.0]),
    };
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
        matr_samp: 0,
        target_nonz: 0,
    };
    let rng = Pcg64::seed_from_u64(cfg.seed.wrapping_add(1 + comm.rank() as u64));
    let mut driver = FciqmcDriver::new(
        vec,
        params,
        &setup.ints,
        &setup.symm,
        &lookup,
        n_orb,
        distribution,
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
