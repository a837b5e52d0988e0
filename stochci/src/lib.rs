#![warn(clippy::all, clippy::cargo, clippy::nursery, clippy::pedantic)]
#![warn(missing_docs)]

//! Fast randomized iteration (FRI) for the eigenproblem of sparse
//! configuration-interaction Hamiltonians over Slater-determinant bases.
//!
//! The crate supplies the iteration engine and the systems infrastructure
//! it runs on: bit-packed determinant algebra, symmetry-aware excitation
//! enumeration, Slater-Condon matrix elements, near-uniform and heat-bath
//! proposal distributions, a distributed hashed sparse vector with
//! buffered cross-process addition, the stochastic compression kernel, and
//! the power-method and subspace drivers built from them. All
//! cross-process traffic goes through the [`comm::Comm`] trait; nothing in
//! the engine names a transport.

pub mod adder;
pub mod arnoldi;
pub mod bitstring;
pub mod comm;
pub mod compress;
pub mod hashtable;
pub mod heat_bath;
pub mod linalg;
pub mod matel;
pub mod near_uniform;
pub mod power;
pub mod symm;
pub mod vector;
