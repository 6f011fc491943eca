//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use tch::Tensor;

use crate::ErrPack;
use crate::tensor::{self, TensorOpError};

use super::tableau::{ButcherTableau, add_weighted};
use super::{Dynamics, SolverOptions, SolverStats, State, shallow_copy};

//--------------------------------------------------------------------------------------------------

/// Embedded Runge-Kutta integration with step size control.
///
/// Steps are clipped so that every requested output time is hit exactly.
pub struct AdaptiveSolver<'a> {
	pub func: &'a dyn Dynamics,
	pub tableau: &'static ButcherTableau,
	pub options: &'a SolverOptions,
	pub stats: SolverStats,
}

impl AdaptiveSolver<'_> {
	pub fn integrate(
		&mut self,
		y0: &[Tensor],
		times: &[f64],
	) -> Result<Vec<State>, ErrPack<TensorOpError>> {
		let (Some(&t0), Some(&t_end)) = (times.first(), times.last()) else {
			return Ok(Vec::new());
		};
		let direction = if t_end < t0 { -1.0 } else { 1.0 };

		let mut out = Vec::with_capacity(times.len());
		out.push(shallow_copy(y0));

		let mut t = t0;
		let mut y = shallow_copy(y0);
		let mut f0 = self.eval(t, &y)?;
		let mut dt = match self.options.first_step {
			Some(h) => h.abs() * direction,
			None => self.initial_step(t0, &y, &f0, direction)?,
		};

		let mut steps = 0;
		for &t_next in times.iter().skip(1) {
			while (t_next - t) * direction > 0.0 {
				if (t_next - t).abs() <= f64::EPSILON * t.abs().max(1.0) {
					// within rounding of the output time
					t = t_next;
					break;
				}
				let clipped = (t + dt - t_next) * direction > 0.0;
				let h = if clipped { t_next - t } else { dt };
				if !h.is_finite() || h.abs() <= f64::EPSILON * t.abs().max(1.0) {
					return Err(ErrPack::with_message(
						TensorOpError::StepSizeUnderflow,
						format!("step size {h:e} underflows at t={t}"),
					));
				}
				steps += 1;
				if steps > self.options.max_num_steps {
					return Err(ErrPack::with_message(
						TensorOpError::TooManySteps,
						format!(
							"reached {} steps at t={t} while integrating to {t_next}",
							self.options.max_num_steps
						),
					));
				}

				let step = self.tableau.step(self.func, t, &y, &f0, h)?;
				self.stats.nfe += step.nfe;
				let ratio = error_ratio(&step.error, &y, &step.y1, self.options)?;

				let accept = ratio <= 1.0;
				if accept {
					t = if clipped { t_next } else { t + h };
					f0 = match step.f1 {
						Some(f1) => f1,
						None => self.eval(t, &step.y1)?,
					};
					y = step.y1;
					self.stats.accepted += 1;
				} else {
					self.stats.rejected += 1;
				}

				let proposed = self.optimal_step(h, ratio);
				dt = if clipped && accept && proposed.abs() < dt.abs() { dt } else { proposed };
			}
			out.push(shallow_copy(&y));
		}
		Ok(out)
	}

	fn eval(&mut self, t: f64, y: &[Tensor]) -> Result<State, ErrPack<TensorOpError>> {
		self.stats.nfe += 1;
		self.func.eval(t, y)
	}

	/// Initial step heuristic from Hairer, Norsett & Wanner, "Solving Ordinary
	/// Differential Equations I", section II.4.
	fn initial_step(
		&mut self,
		t0: f64,
		y0: &[Tensor],
		f0: &[Tensor],
		direction: f64,
	) -> Result<f64, ErrPack<TensorOpError>> {
		let SolverOptions { rtol, atol, .. } = *self.options;
		let scale = y0
			.iter()
			.map(|y| Ok(y.f_abs()?.f_mul_scalar(rtol)?.f_add_scalar(atol)?))
			.collect::<Result<Vec<_>, ErrPack<TensorOpError>>>()?;

		let d0 = scaled_norm(y0, &scale)?;
		let d1 = scaled_norm(f0, &scale)?;
		let h0 = if d0 < 1e-5 || d1 < 1e-5 { 1e-6 } else { 0.01 * d0 / d1 };

		let f0_state = shallow_copy(f0);
		let y1 = add_weighted(y0, h0 * direction, &[1.0], std::slice::from_ref(&f0_state))?;
		let f1 = self.eval(t0 + h0 * direction, &y1)?;
		let diff = f1
			.iter()
			.zip(f0)
			.map(|(a, b)| a.f_sub(b).map_err(ErrPack::from))
			.collect::<Result<Vec<_>, _>>()?;
		let d2 = scaled_norm(&diff, &scale)? / h0;

		let order = f64::from(self.tableau.order - 1);
		let h1 = if d1 <= 1e-15 && d2 <= 1e-15 {
			f64::max(1e-6, h0 * 1e-3)
		} else {
			(0.01 / f64::max(d1, d2)).powf(1.0 / (order + 1.0))
		};
		let h = f64::min(100.0 * h0, h1);
		Ok(if h.is_finite() { h * direction } else { 1e-6 * direction })
	}

	fn optimal_step(&self, last_step: f64, ratio: f64) -> f64 {
		let SolverOptions { safety, ifactor, dfactor, .. } = *self.options;
		if ratio == 0.0 {
			return last_step * ifactor;
		}
		// never shrink after an accepted step
		let dfactor = if ratio < 1.0 { 1.0 } else { dfactor };
		let exponent = 1.0 / f64::from(self.tableau.order);
		let factor = safety / ratio.powf(exponent);
		let factor = if factor.is_finite() { factor.clamp(dfactor, ifactor) } else { dfactor };
		last_step * factor
	}
}

//--------------------------------------------------------------------------------------------------

/// `max_c rms(err_c / (atol + rtol * max(|y0_c|, |y1_c|)))`
///
/// Non-finite values yield `f64::INFINITY` so the step is rejected.
pub fn error_ratio(
	error: &[Tensor],
	y0: &[Tensor],
	y1: &[Tensor],
	options: &SolverOptions,
) -> Result<f64, ErrPack<TensorOpError>> {
	let mut ratio = 0.0_f64;
	for ((err, y0), y1) in error.iter().zip(y0).zip(y1) {
		let tol = y0
			.f_abs()?
			.f_maximum(&y1.f_abs()?)?
			.f_mul_scalar(options.rtol)?
			.f_add_scalar(options.atol)?;
		let r = tensor::rms(&err.f_div(&tol)?)?;
		if !r.is_finite() {
			return Ok(f64::INFINITY);
		}
		ratio = ratio.max(r);
	}
	Ok(ratio)
}

fn scaled_norm(values: &[Tensor], scale: &[Tensor]) -> Result<f64, ErrPack<TensorOpError>> {
	let mut norm = 0.0_f64;
	for (v, s) in values.iter().zip(scale) {
		norm = norm.max(tensor::rms(&v.f_div(s)?)?);
	}
	Ok(norm)
}
