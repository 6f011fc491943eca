//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use tch::Tensor;

use crate::ErrPack;
use crate::tensor::{self, TensorOpError};

use super::tableau::ButcherTableau;
use super::{Dynamics, SolverOptions, SolverStats, State, shallow_copy};

//--------------------------------------------------------------------------------------------------

/// Runge-Kutta integration on a fixed grid.
///
/// Without `step_size`, the grid is the list of output times. With it, each
/// interval between output times is split into equal steps no longer than
/// `step_size`.
pub struct FixedGridSolver<'a> {
	pub func: &'a dyn Dynamics,
	pub tableau: &'static ButcherTableau,
	pub options: &'a SolverOptions,
	pub stats: SolverStats,
}

impl FixedGridSolver<'_> {
	pub fn integrate(
		&mut self,
		y0: &[Tensor],
		times: &[f64],
	) -> Result<Vec<State>, ErrPack<TensorOpError>> {
		let mut out = Vec::with_capacity(times.len());
		let mut y = shallow_copy(y0);
		let mut steps = 0;
		for (i, &t_next) in times.iter().enumerate() {
			let t_prev = if i == 0 { t_next } else { times.get(i - 1).copied().unwrap_or(t_next) };
			let span = t_next - t_prev;
			if span != 0.0 {
				let n = self.substeps(span);
				let h = span / n as f64;
				for j in 0..n {
					steps += 1;
					if steps > self.options.max_num_steps {
						return Err(ErrPack::with_message(
							TensorOpError::TooManySteps,
							format!("reached {} steps", self.options.max_num_steps),
						));
					}
					let t = t_prev + j as f64 * h;
					let f0 = self.func.eval(t, &y)?;
					let step = self.tableau.step(self.func, t, &y, &f0, h)?;
					self.stats.nfe += step.nfe + 1;
					self.stats.accepted += 1;
					for component in &step.y1 {
						if !tensor::is_finite(component)? {
							return Err(ErrPack::with_message(
								TensorOpError::NonFiniteState,
								format!("state became non-finite at t={}", t + h),
							));
						}
					}
					y = step.y1;
				}
			}
			out.push(shallow_copy(&y));
		}
		Ok(out)
	}

	fn substeps(&self, span: f64) -> usize {
		match self.options.step_size {
			Some(step) if step > 0.0 => (span.abs() / step).ceil().max(1.0) as usize,
			_ => 1,
		}
	}
}
