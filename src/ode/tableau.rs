//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use tch::Tensor;

use crate::ErrPack;
use crate::tensor::TensorOpError;

use super::{Dynamics, State, shallow_copy};

//--------------------------------------------------------------------------------------------------

/// Coefficients of an explicit Runge-Kutta method.
///
///     k_1 = f(t, y)
///     k_{i+1} = f(t + alpha[i] h, y + h sum_j beta[i][j] k_j)
///     y_1 = y + h sum_j c_sol[j] k_j
///     err = h sum_j c_error[j] k_j
///
/// `c_error` is empty for fixed-grid methods. When `fsal` is set, the last
/// stage is evaluated at `y_1`, so its derivative can be reused by the next step.
pub struct ButcherTableau {
	pub alpha: &'static [f64],
	pub beta: &'static [&'static [f64]],
	pub c_sol: &'static [f64],
	pub c_error: &'static [f64],
	pub order: u32,
	pub fsal: bool,
}

/// Dormand-Prince 5(4)
pub const DOPRI5: ButcherTableau = ButcherTableau {
	alpha: &[1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0],
	beta: &[
		&[1.0 / 5.0],
		&[3.0 / 40.0, 9.0 / 40.0],
		&[44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0],
		&[19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0, -212.0 / 729.0],
		&[9017.0 / 3168.0, -355.0 / 33.0, 46732.0 / 5247.0, 49.0 / 176.0, -5103.0 / 18656.0],
		&[35.0 / 384.0, 0.0, 500.0 / 1113.0, 125.0 / 192.0, -2187.0 / 6784.0, 11.0 / 84.0],
	],
	c_sol: &[35.0 / 384.0, 0.0, 500.0 / 1113.0, 125.0 / 192.0, -2187.0 / 6784.0, 11.0 / 84.0, 0.0],
	c_error: &[
		71.0 / 57600.0,
		0.0,
		-71.0 / 16695.0,
		71.0 / 1920.0,
		-17253.0 / 339200.0,
		22.0 / 525.0,
		-1.0 / 40.0,
	],
	order: 5,
	fsal: true,
};

/// Bogacki-Shampine 3(2)
pub const BOSH3: ButcherTableau = ButcherTableau {
	alpha: &[1.0 / 2.0, 3.0 / 4.0, 1.0],
	beta: &[&[1.0 / 2.0], &[0.0, 3.0 / 4.0], &[2.0 / 9.0, 1.0 / 3.0, 4.0 / 9.0]],
	c_sol: &[2.0 / 9.0, 1.0 / 3.0, 4.0 / 9.0, 0.0],
	c_error: &[2.0 / 9.0 - 7.0 / 24.0, 1.0 / 3.0 - 1.0 / 4.0, 4.0 / 9.0 - 1.0 / 3.0, -1.0 / 8.0],
	order: 3,
	fsal: true,
};

/// Heun's method with an embedded Euler error estimate.
pub const ADAPTIVE_HEUN: ButcherTableau = ButcherTableau {
	alpha: &[1.0],
	beta: &[&[1.0]],
	c_sol: &[0.5, 0.5],
	c_error: &[-0.5, 0.5],
	order: 2,
	fsal: false,
};

pub const EULER: ButcherTableau = ButcherTableau {
	alpha: &[],
	beta: &[],
	c_sol: &[1.0],
	c_error: &[],
	order: 1,
	fsal: false,
};

pub const MIDPOINT: ButcherTableau = ButcherTableau {
	alpha: &[1.0 / 2.0],
	beta: &[&[1.0 / 2.0]],
	c_sol: &[0.0, 1.0],
	c_error: &[],
	order: 2,
	fsal: false,
};

pub const RK4: ButcherTableau = ButcherTableau {
	alpha: &[1.0 / 2.0, 1.0 / 2.0, 1.0],
	beta: &[&[1.0 / 2.0], &[0.0, 1.0 / 2.0], &[0.0, 0.0, 1.0]],
	c_sol: &[1.0 / 6.0, 1.0 / 3.0, 1.0 / 3.0, 1.0 / 6.0],
	c_error: &[],
	order: 4,
	fsal: false,
};

//--------------------------------------------------------------------------------------------------

pub struct StepResult {
	pub y1: State,

	/// `f(t + h, y1)` when the tableau is FSAL.
	pub f1: Option<State>,

	/// Local error estimate. Empty for tableaus without `c_error`.
	pub error: State,

	/// Number of function evaluations performed by the step.
	pub nfe: usize,
}

impl ButcherTableau {
	/// Takes one step of size `h` from `(t, y)`, where `f0 = f(t, y)`.
	pub fn step(
		&self,
		func: &dyn Dynamics,
		t: f64,
		y: &[Tensor],
		f0: &[Tensor],
		h: f64,
	) -> Result<StepResult, ErrPack<TensorOpError>> {
		let mut ks: Vec<State> = Vec::with_capacity(self.c_sol.len());
		ks.push(shallow_copy(f0));
		let mut y_last = None;
		let mut nfe = 0;
		for (i, (&alpha, &beta)) in self.alpha.iter().zip(self.beta).enumerate() {
			let yi = add_weighted(y, h, beta, &ks)?;
			let ki = func.eval(t + alpha * h, &yi)?;
			nfe += 1;
			ks.push(ki);
			if i + 1 == self.alpha.len() {
				y_last = Some(yi);
			}
		}

		let (y1, f1) = match (self.fsal, y_last) {
			(true, Some(y_last)) => (y_last, ks.last().map(|k| shallow_copy(k))),
			_ => (add_weighted(y, h, self.c_sol, &ks)?, None),
		};

		let error = if self.c_error.is_empty() {
			State::new()
		} else {
			weighted_sum(y, h, self.c_error, &ks)?
		};

		Ok(StepResult { y1, f1, error, nfe })
	}
}

//--------------------------------------------------------------------------------------------------

/// `y + h * sum_j coef[j] * ks[j]`, component-wise.
pub fn add_weighted(
	y: &[Tensor],
	h: f64,
	coef: &[f64],
	ks: &[State],
) -> Result<State, ErrPack<TensorOpError>> {
	let sum = weighted_sum(y, h, coef, ks)?;
	y.iter().zip(sum.iter()).map(|(y, s)| y.f_add(s).map_err(ErrPack::from)).collect()
}

/// `h * sum_j coef[j] * ks[j]`, component-wise. `y` only provides the shapes
/// for all-zero coefficient rows.
fn weighted_sum(
	y: &[Tensor],
	h: f64,
	coef: &[f64],
	ks: &[State],
) -> Result<State, ErrPack<TensorOpError>> {
	let mut out = State::with_capacity(y.len());
	for (c, y_c) in y.iter().enumerate() {
		let mut acc: Option<Tensor> = None;
		for (&w, k) in coef.iter().zip(ks) {
			if w == 0.0 {
				continue;
			}
			let Some(k_c) = k.get(c) else {
				return Err(ErrPack::with_message(
					TensorOpError::InvalidShape,
					format!("derivative has {} components, state has {}", k.len(), y.len()),
				));
			};
			let term = k_c.f_mul_scalar(w * h)?;
			acc = Some(match acc {
				Some(acc) => acc.f_add(&term)?,
				None => term,
			});
		}
		out.push(match acc {
			Some(acc) => acc,
			None => y_c.f_zeros_like()?,
		});
	}
	Ok(out)
}
