//! Reference CPU training library
//!
//! The interpreter only needs a narrow surface from a training library:
//! a registry that builds solvers from a [`SolverParameter`], solvers that
//! step, and a network that resolves layers and blobs by name. This module
//! provides a small deterministic CPU implementation of that surface.
//!
//! [`SolverParameter`]: crate::param::SolverParameter

pub mod blob;
pub mod layers;
pub mod net;
pub mod registry;
pub mod solver;

pub use blob::Blob;
pub use layers::{Layer, LayerKind, MemoryDataLayer};
pub use net::Net;
pub use registry::{SolverCreator, SolverRegistry};
pub use solver::{GradientSolver, LrPolicy, Method, Solver};

use thiserror::Error;

use crate::param::ParamError;

/// Training library errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown solver type '{requested}' (known types: {known})")]
    UnknownSolverType { requested: String, known: String },

    #[error("solver type '{0}' is already registered")]
    DuplicateSolverType(String),

    #[error("unknown learning rate policy '{0}'")]
    UnknownLrPolicy(String),

    #[error("unknown regularization type '{0}'")]
    UnknownRegularization(String),

    #[error("solver parameters name no network (set net_param, net or train_net)")]
    NoNetwork,

    #[error("failed to read network file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid network definition: {0}")]
    NetParam(#[from] ParamError),

    #[error("invalid network: {0}")]
    InvalidNet(String),

    #[error("layer '{0}' must be reset with data before forwarding")]
    MemoryDataNotReset(String),

    #[error("layer '{layer}': {message}")]
    InvalidReset { layer: String, message: String },
}
