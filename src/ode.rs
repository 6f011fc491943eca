//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Explicit Runge-Kutta integrators over tensor states.
//!
//! A state is a small tuple of tensors. The forward pass of an ODE block
//! integrates a single tensor; the adjoint pass integrates the augmented
//! state `[z, a, a_theta...]`.

use std::fmt;
use std::str::FromStr;

use smallvec::SmallVec;
use tch::Tensor;

use crate::ErrPack;
use crate::config::ConfigError;
use crate::tensor::TensorOpError;

pub mod adaptive;
pub mod adjoint;
pub mod fixed_grid;
pub mod tableau;
pub mod time_schedule;


pub use adjoint::{AdjointFunc, AdjointGradients, AdjointTape, adjoint_backward};
pub use time_schedule::{Horizon, TimeSchedule};

use adaptive::AdaptiveSolver;
use fixed_grid::FixedGridSolver;
use tableau::ButcherTableau;

//--------------------------------------------------------------------------------------------------

pub type State = SmallVec<[Tensor; 4]>;

pub fn shallow_copy(state: &[Tensor]) -> State {
	state.iter().map(Tensor::shallow_clone).collect()
}

/// Right-hand side of `dy/dt = f(t, y)`.
pub trait Dynamics {
	fn eval(&self, t: f64, y: &[Tensor]) -> Result<State, ErrPack<TensorOpError>>;
}

impl<F> Dynamics for F
where
	F: Fn(f64, &[Tensor]) -> Result<State, ErrPack<TensorOpError>>,
{
	fn eval(&self, t: f64, y: &[Tensor]) -> Result<State, ErrPack<TensorOpError>> {
		self(t, y)
	}
}

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Method {
	#[default]
	Dopri5,
	Bosh3,
	AdaptiveHeun,
	Euler,
	Midpoint,
	Rk4,
}

impl Method {
	pub const ALL: [Self; 6] =
		[Self::Dopri5, Self::Bosh3, Self::AdaptiveHeun, Self::Euler, Self::Midpoint, Self::Rk4];

	pub fn name(self) -> &'static str {
		match self {
			Self::Dopri5 => "dopri5",
			Self::Bosh3 => "bosh3",
			Self::AdaptiveHeun => "adaptive_heun",
			Self::Euler => "euler",
			Self::Midpoint => "midpoint",
			Self::Rk4 => "rk4",
		}
	}

	pub fn tableau(self) -> &'static ButcherTableau {
		match self {
			Self::Dopri5 => &tableau::DOPRI5,
			Self::Bosh3 => &tableau::BOSH3,
			Self::AdaptiveHeun => &tableau::ADAPTIVE_HEUN,
			Self::Euler => &tableau::EULER,
			Self::Midpoint => &tableau::MIDPOINT,
			Self::Rk4 => &tableau::RK4,
		}
	}

	pub fn is_adaptive(self) -> bool {
		matches!(self, Self::Dopri5 | Self::Bosh3 | Self::AdaptiveHeun)
	}
}

impl FromStr for Method {
	type Err = ErrPack<ConfigError>;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::ALL.into_iter().find(|m| m.name() == s).ok_or_else(|| {
			ErrPack::with_message(ConfigError::UnknownMethod, format!("unknown solver method '{s}'"))
		})
	}
}

impl fmt::Display for Method {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.name())
	}
}

//--------------------------------------------------------------------------------------------------

/// Whether an ODE block reports only the state at the end of the schedule,
/// or the states at every scheduled time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum OutputMode {
	#[default]
	Final,
	Trajectory,
}

#[derive(Debug, Clone)]
pub struct SolverOptions {
	pub method: Method,
	pub rtol: f64,
	pub atol: f64,

	/// Initial step of adaptive methods. Selected automatically when `None`.
	pub first_step: Option<f64>,

	/// Maximum step of fixed-grid methods. The output times form the grid when `None`.
	pub step_size: Option<f64>,

	pub max_num_steps: usize,
	pub safety: f64,
	pub ifactor: f64,
	pub dfactor: f64,
}

impl SolverOptions {
	pub fn new(method: Method, tol: f64) -> Self {
		Self {
			method,
			rtol: tol,
			atol: tol,
			first_step: None,
			step_size: None,
			max_num_steps: i32::MAX as usize,
			safety: 0.9,
			ifactor: 10.0,
			dfactor: 0.2,
		}
	}
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SolverStats {
	pub nfe: usize,
	pub accepted: usize,
	pub rejected: usize,
}

pub struct Solution {
	/// One state per requested time, the first one being the initial state.
	pub states: Vec<State>,
	pub stats: SolverStats,
}

//--------------------------------------------------------------------------------------------------

/// Integrates `func` from `times[0]` through every point of `times`.
///
/// `times` must be monotonic; it may run backwards.
pub fn odeint(
	func: &dyn Dynamics,
	y0: &[Tensor],
	times: &[f64],
	options: &SolverOptions,
) -> Result<Solution, ErrPack<TensorOpError>> {
	check_times(times)?;
	let tableau = options.method.tableau();
	let (states, stats) = if options.method.is_adaptive() {
		let mut solver = AdaptiveSolver { func, tableau, options, stats: SolverStats::default() };
		let states = solver.integrate(y0, times)?;
		(states, solver.stats)
	} else {
		let mut solver = FixedGridSolver { func, tableau, options, stats: SolverStats::default() };
		let states = solver.integrate(y0, times)?;
		(states, solver.stats)
	};
	log::debug!(
		"odeint[{}]: t={:?}..{:?} nfe={} accepted={} rejected={}",
		options.method,
		times.first(),
		times.last(),
		stats.nfe,
		stats.accepted,
		stats.rejected,
	);
	Ok(Solution { states, stats })
}

fn check_times(times: &[f64]) -> Result<(), ErrPack<TensorOpError>> {
	if times.is_empty() {
		return Err(ErrPack::with_message(TensorOpError::InvalidTimes, "no integration times"));
	}
	if let Some(t) = times.iter().find(|t| !t.is_finite()) {
		return Err(ErrPack::with_message(
			TensorOpError::InvalidTimes,
			format!("integration time {t} is not finite"),
		));
	}
	let forward = times.windows(2).all(|w| matches!(w, [a, b] if a <= b));
	let backward = times.windows(2).all(|w| matches!(w, [a, b] if a >= b));
	if !(forward || backward) {
		return Err(ErrPack::with_message(
			TensorOpError::InvalidTimes,
			format!("integration times must be monotonic, got {times:?}"),
		));
	}
	Ok(())
}
