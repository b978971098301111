//! Non-rigid registration of 3D point sets by Coherent Point Drift, with the
//! smoothing kernel replaced by a low-rank basis so that every iteration
//! stays linear in the model size.

pub mod basis;
pub mod caps;
pub mod config;
mod context;
mod driver;
mod error;
pub mod estep;
mod mstep;
mod sigma;
mod workspace;

pub use lrcpd_common::{PointSet, Real};

pub use self::{
    basis::LowRankBasis,
    config::{BasisConfig, BasisMethod, CpdConfig, Thresholds, Windowing},
    context::CpdContext,
    driver::{
        register, register_into, Cancel, ConvergenceResult, Criteria, Guard, Registrar, Registration,
        Termination,
    },
    error::{Error, Result, Status},
    estep::{CpuBackend, EStep, Unavailable},
};
