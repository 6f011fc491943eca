//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::cell::RefCell;
use std::rc::Rc;

use tch::Tensor;

use crate::ErrPack;
use crate::nn::eval_context::EvalContext;
use crate::nn::model_context::ModelContext;
use crate::nn::param::Param;
use crate::ode::adjoint::AdjointRecord;
use crate::ode::{Method, OutputMode, SolverOptions, TimeSchedule, odeint};
use crate::tensor::TensorOpError;
use crate::util::join_name;

use super::{Module, OdeFunc};

//--------------------------------------------------------------------------------------------------

/// Result of an ODE block.
#[derive(Debug)]
pub enum OdeOutput {
	/// The state at the end of the schedule, shaped like the input.
	Final(Tensor),

	/// The states at every scheduled time, stacked on a new leading dimension.
	/// Entry 0 is the input.
	Trajectory(Tensor),
}

impl OdeOutput {
	pub fn into_tensor(self) -> Tensor {
		match self {
			Self::Final(t) | Self::Trajectory(t) => t,
		}
	}

	/// The state at the end of the schedule.
	pub fn last(&self) -> Result<Tensor, ErrPack<TensorOpError>> {
		match self {
			Self::Final(t) => Ok(t.shallow_clone()),
			Self::Trajectory(t) => Ok(t.f_select(0, -1)?),
		}
	}
}

/// Integrates an `OdeFunc` over a time schedule.
///
/// With `adjoint` set, the forward integration keeps no graph. The returned
/// tensor is a fresh leaf; in training mode the integration is recorded on
/// the evaluation context and its gradients are computed by
/// `EvalContext::backward_adjoint()`.
pub struct OdeBlock {
	odefunc: Rc<OdeFunc>,
	schedule: TimeSchedule,
	options: SolverOptions,
	adjoint: bool,
	output: OutputMode,
}

impl OdeBlock {
	pub fn new(
		ctx: &mut ModelContext,
		dim: i64,
		schedule: TimeSchedule,
		method: Method,
		tol: f64,
		adjoint: bool,
	) -> Result<Self, ErrPack<TensorOpError>> {
		Ok(Self {
			odefunc: Rc::new(OdeFunc::new(ctx, dim)?),
			schedule,
			options: SolverOptions::new(method, tol),
			adjoint,
			output: OutputMode::Final,
		})
	}

	pub fn odefunc(&self) -> &OdeFunc {
		&self.odefunc
	}

	pub fn schedule(&self) -> &TimeSchedule {
		&self.schedule
	}

	pub fn set_schedule(&mut self, schedule: TimeSchedule) {
		self.schedule = schedule;
	}

	pub fn options(&self) -> &SolverOptions {
		&self.options
	}

	pub fn options_mut(&mut self) -> &mut SolverOptions {
		&mut self.options
	}

	pub fn is_adjoint(&self) -> bool {
		self.adjoint
	}

	pub fn output(&self) -> OutputMode {
		self.output
	}

	pub fn set_output(&mut self, output: OutputMode) {
		self.output = output;
	}

	/// Forward function evaluations since construction or the last reset.
	pub fn nfe(&self) -> usize {
		self.odefunc.nfe()
	}

	pub fn nfe_backward(&self) -> usize {
		self.odefunc.nfe_backward()
	}

	pub fn reset_nfe(&self) {
		self.odefunc.reset_nfe();
	}

	pub fn forward(&self, x: &Tensor, ctx: &mut EvalContext) -> Result<OdeOutput, ErrPack<TensorOpError>> {
		if self.adjoint {
			self.forward_adjoint(x, ctx)
		} else {
			let states = self.integrate(x)?;
			self.assemble(&states)
		}
	}

	fn forward_adjoint(
		&self,
		x: &Tensor,
		ctx: &mut EvalContext,
	) -> Result<OdeOutput, ErrPack<TensorOpError>> {
		let states = tch::no_grad(|| self.integrate(&x.detach()))?;
		let output = tch::no_grad(|| self.assemble(&states))?;
		if !ctx.is_training() {
			return Ok(output);
		}

		let leaf = |t: Tensor| t.detach().set_requires_grad(true);
		let output = match output {
			OdeOutput::Final(t) => OdeOutput::Final(leaf(t)),
			OdeOutput::Trajectory(t) => OdeOutput::Trajectory(leaf(t)),
		};
		let out_tensor = match &output {
			OdeOutput::Final(t) | OdeOutput::Trajectory(t) => t.shallow_clone(),
		};
		ctx.tape.record(AdjointRecord {
			func: self.odefunc.clone(),
			input: x.shallow_clone(),
			times: self.schedule.times().to_vec(),
			states,
			output: out_tensor,
			mode: self.output,
			options: self.options.clone(),
		});
		Ok(output)
	}

	/// The state at every scheduled time.
	fn integrate(&self, x: &Tensor) -> Result<Vec<Tensor>, ErrPack<TensorOpError>> {
		let solution = odeint(&*self.odefunc, &[x.shallow_clone()], self.schedule.times(), &self.options)?;
		solution
			.states
			.into_iter()
			.map(|state| {
				state.into_iter().next().ok_or_else(|| {
					ErrPack::with_message(TensorOpError::InvalidShape, "solver returned an empty state")
				})
			})
			.collect()
	}

	fn assemble(&self, states: &[Tensor]) -> Result<OdeOutput, ErrPack<TensorOpError>> {
		match self.output {
			OutputMode::Final => {
				let Some(last) = states.last() else {
					return Err(ErrPack::with_message(TensorOpError::InvalidShape, "no states"));
				};
				Ok(OdeOutput::Final(last.shallow_clone()))
			},
			OutputMode::Trajectory => Ok(OdeOutput::Trajectory(Tensor::f_stack(states, 0)?)),
		}
	}
}

impl Module for OdeBlock {
	fn collect_named_params(&self, prefix: &str, f: &mut dyn FnMut(String, Rc<RefCell<Param>>)) {
		self.odefunc.collect_named_params(&join_name(prefix, "odefunc"), f);
	}
}
