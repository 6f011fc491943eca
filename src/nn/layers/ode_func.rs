//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use smallvec::smallvec;
use tch::Tensor;

use crate::ErrPack;
use crate::nn::model_context::ModelContext;
use crate::nn::param::Param;
use crate::ode::{AdjointFunc, Dynamics, State};
use crate::tensor::TensorOpError;
use crate::util::join_name;

use super::{ConcatConv2d, GroupNorm, Module, norm};

//--------------------------------------------------------------------------------------------------

/// The learned right-hand side `f(t, x)` of an ODE block:
///
///     norm1 -> relu -> conv1(t) -> norm2 -> relu -> conv2(t) -> norm3
///
/// The output has the shape of the input.
pub struct OdeFunc {
	norm1: GroupNorm,
	conv1: ConcatConv2d,
	norm2: GroupNorm,
	conv2: ConcatConv2d,
	norm3: GroupNorm,

	nfe: Cell<usize>,
	nfe_backward: Cell<usize>,
}

impl OdeFunc {
	pub fn new(ctx: &mut ModelContext, dim: i64) -> Result<Self, ErrPack<TensorOpError>> {
		Ok(Self {
			norm1: norm(ctx, dim)?,
			conv1: ConcatConv2d::new(ctx, dim)?,
			norm2: norm(ctx, dim)?,
			conv2: ConcatConv2d::new(ctx, dim)?,
			norm3: norm(ctx, dim)?,
			nfe: Cell::new(0),
			nfe_backward: Cell::new(0),
		})
	}

	pub fn apply(&self, t: f64, x: &Tensor) -> Result<Tensor, ErrPack<TensorOpError>> {
		let out = self.norm1.apply(x)?.f_relu()?;
		let out = self.conv1.apply(t, &out)?;
		let out = self.norm2.apply(&out)?.f_relu()?;
		let out = self.conv2.apply(t, &out)?;
		self.norm3.apply(&out)
	}

	/// Evaluations made while integrating forward.
	pub fn nfe(&self) -> usize {
		self.nfe.get()
	}

	/// Evaluations made by adjoint backward passes.
	pub fn nfe_backward(&self) -> usize {
		self.nfe_backward.get()
	}

	pub fn reset_nfe(&self) {
		self.nfe.set(0);
		self.nfe_backward.set(0);
	}
}

impl Module for OdeFunc {
	fn collect_named_params(&self, prefix: &str, f: &mut dyn FnMut(String, Rc<RefCell<Param>>)) {
		self.norm1.collect_named_params(&join_name(prefix, "norm1"), f);
		self.conv1.collect_named_params(&join_name(prefix, "conv1"), f);
		self.norm2.collect_named_params(&join_name(prefix, "norm2"), f);
		self.conv2.collect_named_params(&join_name(prefix, "conv2"), f);
		self.norm3.collect_named_params(&join_name(prefix, "norm3"), f);
	}
}

impl Dynamics for OdeFunc {
	fn eval(&self, t: f64, y: &[Tensor]) -> Result<State, ErrPack<TensorOpError>> {
		let Some(x) = y.first() else {
			return Err(ErrPack::with_message(TensorOpError::InvalidShape, "empty ODE state"));
		};
		self.nfe.set(self.nfe.get() + 1);
		Ok(smallvec![self.apply(t, x)?])
	}
}

impl AdjointFunc for OdeFunc {
	fn parameters(&self) -> Vec<Tensor> {
		self.params().iter().map(|p| p.borrow().value().shallow_clone()).collect()
	}

	fn eval_backward(&self, t: f64, z: &Tensor) -> Result<Tensor, ErrPack<TensorOpError>> {
		self.nfe_backward.set(self.nfe_backward.get() + 1);
		self.apply(t, z)
	}
}
