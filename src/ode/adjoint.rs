//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::rc::Rc;

use tch::Tensor;

use crate::ErrPack;
use crate::tensor::TensorOpError;

use super::{Dynamics, OutputMode, SolverOptions, State, odeint};

//--------------------------------------------------------------------------------------------------

/// A learned right-hand side that can be differentiated with the adjoint method.
pub trait AdjointFunc {
	/// Tensors with respect to which parameter gradients are computed.
	fn parameters(&self) -> Vec<Tensor>;

	/// Evaluates `f(t, z)` during the backward pass.
	fn eval_backward(&self, t: f64, z: &Tensor) -> Result<Tensor, ErrPack<TensorOpError>>;
}

struct BackwardView<'a> {
	func: &'a dyn AdjointFunc,
}

impl Dynamics for BackwardView<'_> {
	fn eval(&self, t: f64, y: &[Tensor]) -> Result<State, ErrPack<TensorOpError>> {
		let z = first(y)?;
		Ok(smallvec::smallvec![self.func.eval_backward(t, z)?])
	}
}

//--------------------------------------------------------------------------------------------------

/// The augmented system integrated backwards in time:
///
///     dz/dt       =  f(t, z)
///     da/dt       = -a^T df/dz
///     da_theta/dt = -a^T df/dtheta
///
/// State layout: `[z, a, a_theta_0, a_theta_1, ...]`.
struct AugmentedDynamics<'a> {
	func: &'a dyn Dynamics,
	params: &'a [Tensor],
}

impl Dynamics for AugmentedDynamics<'_> {
	fn eval(&self, t: f64, y: &[Tensor]) -> Result<State, ErrPack<TensorOpError>> {
		let z = first(y)?.detach().set_requires_grad(true);
		let Some(a) = y.get(1) else {
			return Err(ErrPack::with_message(
				TensorOpError::InvalidShape,
				"augmented state is missing the adjoint component",
			));
		};
		tch::with_grad(|| {
			let f = self.func.eval(t, std::slice::from_ref(&z))?;
			let f = first(&f)?;
			let objective = f.f_mul(a)?.f_sum(f.kind())?;

			let mut inputs = Vec::with_capacity(self.params.len() + 1);
			inputs.push(z.shallow_clone());
			inputs.extend(self.params.iter().map(Tensor::shallow_clone));
			let vjps = Tensor::f_run_backward(&[objective], inputs.as_slice(), false, false)?;

			let mut out = State::with_capacity(vjps.len() + 1);
			out.push(f.detach());
			for vjp in vjps {
				out.push(vjp.f_neg()?);
			}
			Ok(out)
		})
	}
}

pub struct AdjointGradients {
	/// Gradient with respect to the initial state.
	pub input: Tensor,

	/// Gradients with respect to the parameters, in the order they were given.
	pub params: Vec<Tensor>,
}

/// Computes gradients of a loss with respect to the initial state and the
/// parameters of `func`, given the forward solution `states` at `times` and
/// the loss gradient at each time point (`None` where the loss does not
/// depend on that state).
///
/// At each time point the state `z` is restored from the forward solution.
pub fn adjoint_backward(
	func: &dyn Dynamics,
	params: &[Tensor],
	times: &[f64],
	states: &[Tensor],
	grads: &[Option<Tensor>],
	options: &SolverOptions,
) -> Result<AdjointGradients, ErrPack<TensorOpError>> {
	let n = times.len();
	if n == 0 || states.len() != n || grads.len() != n {
		return Err(ErrPack::with_message(
			TensorOpError::InvalidShape,
			format!(
				"adjoint needs one state and one gradient per time, got {n} times, {} states, {} gradients",
				states.len(),
				grads.len()
			),
		));
	}

	let augmented = AugmentedDynamics { func, params };
	tch::no_grad(|| {
		let mut a = grad_or_zeros(grads.last(), states.last())?;
		let mut a_theta = params
			.iter()
			.map(|p| p.f_zeros_like().map_err(ErrPack::from))
			.collect::<Result<Vec<_>, _>>()?;

		for i in (1..n).rev() {
			let (Some(&t_i), Some(&t_prev), Some(z)) = (times.get(i), times.get(i - 1), states.get(i))
			else {
				break;
			};

			let mut y = State::with_capacity(params.len() + 2);
			y.push(z.shallow_clone());
			y.push(a);
			y.extend(a_theta.drain(..));

			let solution = odeint(&augmented, &y, &[t_i, t_prev], options)?;
			let Some(mut last) = solution.states.into_iter().last() else {
				return Err(ErrPack::with_message(TensorOpError::InvalidShape, "empty adjoint solution"));
			};
			log::debug!(
				"adjoint: t={t_i}..{t_prev} nfe={} accepted={} rejected={}",
				solution.stats.nfe,
				solution.stats.accepted,
				solution.stats.rejected
			);

			a_theta = last.drain(2..).collect();
			a = last.pop().ok_or_else(|| {
				ErrPack::with_message(TensorOpError::InvalidShape, "adjoint state lost its components")
			})?;
			if let Some(Some(g)) = grads.get(i - 1) {
				a = a.f_add(g)?;
			}
		}
		Ok(AdjointGradients { input: a, params: a_theta })
	})
}

fn grad_or_zeros(
	grad: Option<&Option<Tensor>>,
	like: Option<&Tensor>,
) -> Result<Tensor, ErrPack<TensorOpError>> {
	match (grad, like) {
		(Some(Some(g)), _) => Ok(g.shallow_clone()),
		(_, Some(like)) => Ok(like.f_zeros_like()?),
		(_, None) => Err(ErrPack::with_message(TensorOpError::InvalidShape, "no final state")),
	}
}

fn first(y: &[Tensor]) -> Result<&Tensor, ErrPack<TensorOpError>> {
	y.first()
		.ok_or_else(|| ErrPack::with_message(TensorOpError::InvalidShape, "empty ODE state"))
}

//--------------------------------------------------------------------------------------------------

/// One integration done in adjoint mode, waiting for its output gradient.
pub struct AdjointRecord {
	pub func: Rc<dyn AdjointFunc>,

	/// The initial state as seen by the caller, still attached to its graph.
	pub input: Tensor,
	pub times: Vec<f64>,

	/// Forward solution at every time point (detached).
	pub states: Vec<Tensor>,

	/// The leaf tensor returned to the caller; its `.grad()` is the output gradient.
	pub output: Tensor,
	pub mode: OutputMode,
	pub options: SolverOptions,
}

impl AdjointRecord {
	fn backward(&self) -> Result<(), ErrPack<TensorOpError>> {
		let d_out = self.output.grad();
		if !d_out.defined() {
			log::warn!("adjoint: output of an ODE block received no gradient, skipping");
			return Ok(());
		}

		let n = self.times.len();
		let grads: Vec<Option<Tensor>> = match self.mode {
			OutputMode::Final => {
				let mut grads: Vec<Option<Tensor>> = (0..n).map(|_| None).collect();
				if let Some(last) = grads.last_mut() {
					*last = Some(d_out);
				}
				grads
			},
			OutputMode::Trajectory => d_out.f_unbind(0)?.into_iter().map(Some).collect(),
		};

		let params = self.func.parameters();
		let view = BackwardView { func: &*self.func };
		let gradients =
			adjoint_backward(&view, &params, &self.times, &self.states, &grads, &self.options)?;

		// push the gradients into the graph that produced the input and into the parameters
		tch::with_grad(|| {
			let kind = self.input.kind();
			let mut total = self.input.f_mul(&gradients.input)?.f_sum(kind)?;
			for (p, g) in params.iter().zip(&gradients.params) {
				total = total.f_add(&p.f_mul(g)?.f_sum(kind)?)?;
			}
			if total.requires_grad() {
				total.f_backward()?;
			}
			Ok(())
		})
	}
}

/// Integrations recorded during a forward pass, replayed by `backward()`
/// after the loss has been backpropagated.
#[derive(Default)]
pub struct AdjointTape {
	records: Vec<AdjointRecord>,
}

impl AdjointTape {
	pub fn new() -> Self {
		Self { records: Vec::new() }
	}

	pub fn record(&mut self, record: AdjointRecord) {
		self.records.push(record);
	}

	pub fn len(&self) -> usize {
		self.records.len()
	}

	pub fn is_empty(&self) -> bool {
		self.records.is_empty()
	}

	pub fn clear(&mut self) {
		self.records.clear();
	}

	/// Replays the recorded integrations, latest first, so that gradients
	/// flowing out of a later block reach the output of an earlier one before
	/// it is processed. The tape is empty afterwards.
	pub fn backward(&mut self) -> Result<(), ErrPack<TensorOpError>> {
		while let Some(record) = self.records.pop() {
			record.backward()?;
		}
		Ok(())
	}
}
