#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(missing_docs)]

mod arnoldi;
mod fciqmc;
mod fri;
mod helpers;

use anyhow::Result;
use clap::Parser;
use enum_dispatch::enum_dispatch;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Clone, Parser)]
pub struct GlobalConfiguration {
    /// Directory holding sys_params.txt, symm.txt, hcore.txt and eris.txt.
    #[arg(long, short = 'd', value_name = "DIR")]
    pub hf_path: PathBuf,
    /// Directory where the result files are appended.
    #[arg(long, short = 'y', value_name = "DIR", default_value = ".")]
    pub result_dir: PathBuf,
    /// Seed of the per-rank random streams and the hash scramblers.
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
    /// Number of in-process ranks to run (threads over shared mailboxes).
    #[arg(long, default_value_t = 1)]
    pub procs: usize,
}

#[enum_dispatch]
pub trait Subcommand {
    fn run(&self, cfg: &GlobalConfiguration) -> Result<ExitCode>;
}

#[enum_dispatch(Subcommand)]
#[derive(Parser)]
pub enum SubcommandEnum {
    Arnoldi(arnoldi::Opts),
    Fciqmc(fciqmc::Opts),
    Fri(fri::Opts),
}

#[derive(Parser)]
#[command(
    arg_required_else_help = true,
    author,
    about,
    disable_help_subcommand = true,
    name = "stochci",
    version
)]
pub struct Opts {
    #[command(flatten)]
    pub configuration: GlobalConfiguration,
    #[command(subcommand)]
    pub subcommand: SubcommandEnum,
}
