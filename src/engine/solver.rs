//! Gradient-descent solvers
//!
//! A solver owns the training network and advances it one iteration at a
//! time: forward/backward over `iter_size` batches, then one parameter
//! update computed by the configured [`Method`].

use std::collections::VecDeque;

use crate::param::SolverParameter;

use super::{EngineError, Net};

/// What the interpreter needs from a training solver.
pub trait Solver {
    /// Registry key this solver was created under.
    fn solver_type(&self) -> &str;

    fn param(&self) -> &SolverParameter;

    /// Completed iterations.
    fn iter(&self) -> i32;

    fn net(&self) -> &Net;

    fn net_mut(&mut self) -> &mut Net;

    /// Run `iters` training iterations.
    fn step(&mut self, iters: i32) -> Result<(), EngineError>;
}

// =============================================================================
// Learning rate policy
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum LrPolicy {
    Fixed,
    Step { gamma: f32, stepsize: i32 },
    MultiStep { gamma: f32, stepvalues: Vec<i32> },
    Exp { gamma: f32 },
    Inv { gamma: f32, power: f32 },
    Poly { power: f32, max_iter: i32 },
    Sigmoid { gamma: f32, stepsize: i32 },
}

impl LrPolicy {
    pub fn from_param(param: &SolverParameter) -> Result<Self, EngineError> {
        let gamma = param.gamma();
        let policy = match param.lr_policy() {
            "fixed" => LrPolicy::Fixed,
            "step" => LrPolicy::Step {
                gamma,
                stepsize: param.stepsize().max(1),
            },
            "multistep" => LrPolicy::MultiStep {
                gamma,
                stepvalues: param.stepvalue.clone(),
            },
            "exp" => LrPolicy::Exp { gamma },
            "inv" => LrPolicy::Inv {
                gamma,
                power: param.power(),
            },
            "poly" => LrPolicy::Poly {
                power: param.power(),
                max_iter: param.max_iter().max(1),
            },
            "sigmoid" => LrPolicy::Sigmoid {
                gamma,
                stepsize: param.stepsize(),
            },
            other => return Err(EngineError::UnknownLrPolicy(other.to_string())),
        };
        Ok(policy)
    }

    /// Learning rate at iteration `iter`.
    pub fn rate(&self, base_lr: f32, iter: i32) -> f32 {
        let it = iter as f32;
        match self {
            LrPolicy::Fixed => base_lr,
            LrPolicy::Step { gamma, stepsize } => base_lr * gamma.powi(iter / stepsize),
            LrPolicy::MultiStep { gamma, stepvalues } => {
                let passed = stepvalues.iter().filter(|&&v| iter >= v).count();
                base_lr * gamma.powi(passed as i32)
            }
            LrPolicy::Exp { gamma } => base_lr * gamma.powi(iter),
            LrPolicy::Inv { gamma, power } => base_lr * (1.0 + gamma * it).powf(-power),
            LrPolicy::Poly { power, max_iter } => base_lr * (1.0 - it / *max_iter as f32).max(0.0).powf(*power),
            LrPolicy::Sigmoid { gamma, stepsize } => {
                base_lr * (1.0 / (1.0 + (-gamma * (it - *stepsize as f32)).exp()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Regularization {
    L1,
    L2,
}

impl Regularization {
    fn from_param(param: &SolverParameter) -> Result<Self, EngineError> {
        match param.regularization_type() {
            "L1" => Ok(Regularization::L1),
            "L2" => Ok(Regularization::L2),
            other => Err(EngineError::UnknownRegularization(other.to_string())),
        }
    }
}

// =============================================================================
// GradientSolver
// =============================================================================

/// Update rule applied to each learnable blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Sgd,
    Nesterov,
    Adam,
}

impl Method {
    pub fn type_name(self) -> &'static str {
        match self {
            Method::Sgd => "SGD",
            Method::Nesterov => "Nesterov",
            Method::Adam => "Adam",
        }
    }
}

#[derive(Debug)]
pub struct GradientSolver {
    method: Method,
    param: SolverParameter,
    policy: LrPolicy,
    regularization: Regularization,
    net: Net,
    iter: i32,
    /// Momentum (or Adam first moment) per learnable blob
    history: Vec<Vec<f32>>,
    /// Adam second moment per learnable blob
    second_moment: Vec<Vec<f32>>,
    losses: VecDeque<f32>,
    smoothed_loss: f32,
}

impl GradientSolver {
    pub fn new(method: Method, param: &SolverParameter) -> Result<Self, EngineError> {
        log::info!("Initializing solver from parameters:\n{}", param);
        let policy = LrPolicy::from_param(param)?;
        let regularization = Regularization::from_param(param)?;
        let net = Net::from_solver_param(param)?;

        let history: Vec<Vec<f32>> = net.learnable_params().map(|b| vec![0.0; b.count()]).collect();
        let second_moment = match method {
            Method::Adam => history.clone(),
            _ => Vec::new(),
        };

        log::info!("Solver scaffolding done.");
        Ok(Self {
            method,
            param: param.clone(),
            policy,
            regularization,
            net,
            iter: 0,
            history,
            second_moment,
            losses: VecDeque::new(),
            smoothed_loss: 0.0,
        })
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn smoothed_loss(&self) -> f32 {
        self.smoothed_loss
    }

    fn display_now(&self) -> bool {
        let display = self.param.display();
        display > 0 && self.iter % display == 0
    }

    fn update_smoothed_loss(&mut self, loss: f32, start_iter: i32, average_loss: usize) {
        if self.losses.len() < average_loss {
            self.losses.push_back(loss);
            let size = self.losses.len() as f32;
            self.smoothed_loss = (self.smoothed_loss * (size - 1.0) + loss) / size;
        } else {
            let idx = (self.iter - start_iter) as usize % average_loss;
            self.smoothed_loss += (loss - self.losses[idx]) / average_loss as f32;
            self.losses[idx] = loss;
        }
    }

    fn clip_gradients(&mut self) {
        let clip = self.param.clip_gradients();
        if clip < 0.0 {
            return;
        }
        let l2norm = self.net.learnable_params().map(|b| b.sumsq_diff()).sum::<f32>().sqrt();
        if l2norm > clip {
            let scale = clip / l2norm;
            log::info!(
                "Gradient clipping: scaling down gradients (L2 norm {} > {}) by scale factor {}",
                l2norm,
                clip,
                scale
            );
            for blob in self.net.learnable_params_mut() {
                blob.scale_diff(scale);
            }
        }
    }

    fn apply_update(&mut self) {
        let rate = self.policy.rate(self.param.base_lr(), self.iter);
        if self.display_now() {
            log::info!("Iteration {}, lr = {}", self.iter, rate);
        }
        self.clip_gradients();

        let iter_size = self.param.iter_size().max(1);
        let decay = self.param.weight_decay();
        let momentum = self.param.momentum();
        let momentum2 = self.param.momentum2();
        let delta = self.param.delta();
        let t = self.iter + 1;

        for (i, blob) in self.net.learnable_params_mut().enumerate() {
            if iter_size > 1 {
                blob.scale_diff(1.0 / iter_size as f32);
            }

            if decay != 0.0 {
                let data = blob.data().to_vec();
                for (d, w) in blob.diff_mut().iter_mut().zip(data) {
                    *d += match self.regularization {
                        Regularization::L2 => decay * w,
                        Regularization::L1 if w > 0.0 => decay,
                        Regularization::L1 if w < 0.0 => -decay,
                        Regularization::L1 => 0.0,
                    };
                }
            }

            let history = &mut self.history[i];
            match self.method {
                Method::Sgd => {
                    for (d, h) in blob.diff_mut().iter_mut().zip(history.iter_mut()) {
                        *h = momentum * *h + rate * *d;
                        *d = *h;
                    }
                }
                Method::Nesterov => {
                    for (d, h) in blob.diff_mut().iter_mut().zip(history.iter_mut()) {
                        let previous = *h;
                        *h = momentum * *h + rate * *d;
                        *d = (1.0 + momentum) * *h - momentum * previous;
                    }
                }
                Method::Adam => {
                    let correction = (1.0 - momentum2.powi(t)).sqrt() / (1.0 - momentum.powi(t));
                    let second = &mut self.second_moment[i];
                    for ((d, m), v) in blob.diff_mut().iter_mut().zip(history.iter_mut()).zip(second.iter_mut()) {
                        *m = momentum * *m + (1.0 - momentum) * *d;
                        *v = momentum2 * *v + (1.0 - momentum2) * *d * *d;
                        *d = rate * correction * *m / (v.sqrt() + delta);
                    }
                }
            }

            blob.update();
        }
    }
}

impl Solver for GradientSolver {
    fn solver_type(&self) -> &str {
        self.method.type_name()
    }

    fn param(&self) -> &SolverParameter {
        &self.param
    }

    fn iter(&self) -> i32 {
        self.iter
    }

    fn net(&self) -> &Net {
        &self.net
    }

    fn net_mut(&mut self) -> &mut Net {
        &mut self.net
    }

    fn step(&mut self, iters: i32) -> Result<(), EngineError> {
        let start_iter = self.iter;
        let stop_iter = self.iter.saturating_add(iters.max(0));
        let average_loss = self.param.average_loss().max(1) as usize;
        let iter_size = self.param.iter_size().max(1);
        self.losses.clear();
        self.smoothed_loss = 0.0;

        while self.iter < stop_iter {
            self.net.clear_param_diffs();

            let mut loss = 0.0;
            for _ in 0..iter_size {
                loss += self.net.forward_backward()?;
            }
            loss /= iter_size as f32;

            self.update_smoothed_loss(loss, start_iter, average_loss);
            if self.display_now() {
                log::info!("Iteration {}, loss = {}", self.iter, self.smoothed_loss);
            }

            self.apply_update();
            self.iter += 1;
        }

        log::debug!("{} solver stepped {} -> {}", self.solver_type(), start_iter, self.iter);
        Ok(())
    }
}
