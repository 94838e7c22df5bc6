//! Solver registry
//!
//! Maps the `type` string of a [`SolverParameter`] to a constructor. The
//! registry is process-wide; the built-in gradient solvers are present from
//! first use and embedders may add their own.

use std::collections::BTreeMap;
use std::sync::{OnceLock, RwLock};

use crate::param::SolverParameter;

use super::{EngineError, GradientSolver, Method, Solver};

pub type SolverCreator = fn(&SolverParameter) -> Result<Box<dyn Solver>, EngineError>;

pub struct SolverRegistry;

static REGISTRY: OnceLock<RwLock<BTreeMap<String, SolverCreator>>> = OnceLock::new();

fn create_sgd(param: &SolverParameter) -> Result<Box<dyn Solver>, EngineError> {
    Ok(Box::new(GradientSolver::new(Method::Sgd, param)?))
}

fn create_nesterov(param: &SolverParameter) -> Result<Box<dyn Solver>, EngineError> {
    Ok(Box::new(GradientSolver::new(Method::Nesterov, param)?))
}

fn create_adam(param: &SolverParameter) -> Result<Box<dyn Solver>, EngineError> {
    Ok(Box::new(GradientSolver::new(Method::Adam, param)?))
}

fn registry() -> &'static RwLock<BTreeMap<String, SolverCreator>> {
    REGISTRY.get_or_init(|| {
        let mut map: BTreeMap<String, SolverCreator> = BTreeMap::new();
        map.insert(Method::Sgd.type_name().to_string(), create_sgd);
        map.insert(Method::Nesterov.type_name().to_string(), create_nesterov);
        map.insert(Method::Adam.type_name().to_string(), create_adam);
        RwLock::new(map)
    })
}

impl SolverRegistry {
    /// Add a solver type. Fails if the name is taken.
    pub fn register(name: &str, creator: SolverCreator) -> Result<(), EngineError> {
        let mut map = registry().write().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(name) {
            return Err(EngineError::DuplicateSolverType(name.to_string()));
        }
        map.insert(name.to_string(), creator);
        log::debug!("Registered solver type {}", name);
        Ok(())
    }

    /// Registered type names, sorted.
    pub fn types() -> Vec<String> {
        let map = registry().read().unwrap_or_else(|e| e.into_inner());
        map.keys().cloned().collect()
    }

    /// Build a solver for `param.type`.
    pub fn create(param: &SolverParameter) -> Result<Box<dyn Solver>, EngineError> {
        let requested = param.solver_type();
        let creator = {
            let map = registry().read().unwrap_or_else(|e| e.into_inner());
            map.get(requested).copied()
        };

        match creator {
            Some(creator) => {
                log::info!("Creating {} solver", requested);
                creator(param)
            }
            None => Err(EngineError::UnknownSolverType {
                requested: requested.to_string(),
                known: Self::types().join(", "),
            }),
        }
    }
}
