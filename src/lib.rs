#![warn(rust_2018_idioms, missing_docs, missing_debug_implementations)]

//! Multi-ensemble reweighting estimators for the free energies of discrete states.
//!
//! A system is simulated under several bias conditions $K$, each adding a known reduced bias
//! energy to the states it visits. The estimators in this crate combine all of that data into
//! unbiased state free energies $f_i$:
//!
//! - [`wham`] uses visit counts only;
//! - [`dtram`] uses transition counts and per-state bias energies;
//! - [`tram`] uses transition counts and per-frame bias energies.
//!
//! Each estimator exposes its individual fixed-point sweeps as free functions, so that callers can
//! write their own driver loops, and a builder-configured struct whose `estimate` method runs a
//! complete iteration under a [`Convergence`] policy.
//!
//! Please reference the following if you use this code in your research:
//!
//! [1] Wu H, Mey ASJS, Rosta E and Noé F. Statistically optimal analysis of state-discretized
//! trajectory data from multiple thermodynamic states. J. Chem. Phys. 141:214106, 2014.
//! <http://dx.doi.org/10.1063/1.4902240>
//!
//! [2] Wu H, Paul F, Wehmeyer C and Noé F. Multiensemble Markov models of molecular
//! thermodynamics and kinetics. Proc. Natl. Acad. Sci. USA 113:E3221, 2016.
//! <http://dx.doi.org/10.1073/pnas.1525092113>

#[macro_use]
extern crate derive_builder;

pub mod convergence;
pub mod dtram;
/// Errors returned when building estimators and test systems
pub mod errors;
pub mod lse;
mod reversible;
/// Discrete test systems with exactly known free energies and dynamics
pub mod testsystems;
pub mod tram;
pub mod validation;
pub mod wham;

pub use crate::convergence::{Convergence, Status};
pub use crate::dtram::{Dtram, DtramEstimate};
pub use crate::errors::{EstimatorError, Result};
pub use crate::tram::{Tram, TramEstimate};
pub use crate::wham::{Wham, WhamEstimate};
