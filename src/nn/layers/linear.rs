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
use crate::nn::param::{Init, Param};
use crate::tensor::TensorOpError;
use crate::util::join_name;

use super::{Layer, Module};

//--------------------------------------------------------------------------------------------------

/// Affine layer.
///
///     input: [..., inputs]
///     output: [..., outputs]
pub struct Linear {
	weight: Rc<RefCell<Param>>,
	bias: Rc<RefCell<Param>>,
}

impl Linear {
	pub fn new(
		ctx: &mut ModelContext,
		inputs: i64,
		outputs: i64,
	) -> Result<Self, ErrPack<TensorOpError>> {
		let init = Init::fan_in(inputs);
		Ok(Self {
			weight: ctx.new_param(&[outputs, inputs], init)?,
			bias: ctx.new_param(&[outputs], init)?,
		})
	}

	pub fn apply(&self, inp: &Tensor) -> Result<Tensor, ErrPack<TensorOpError>> {
		let weight = self.weight.borrow();
		let bias = self.bias.borrow();
		Ok(inp.f_linear(weight.value(), Some(bias.value()))?)
	}
}

impl Module for Linear {
	fn collect_named_params(&self, prefix: &str, f: &mut dyn FnMut(String, Rc<RefCell<Param>>)) {
		f(join_name(prefix, "weight"), self.weight.clone());
		f(join_name(prefix, "bias"), self.bias.clone());
	}
}

impl Layer for Linear {
	fn forward(&self, inp: &Tensor, _ctx: &mut EvalContext) -> Result<Tensor, ErrPack<TensorOpError>> {
		self.apply(inp)
	}
}
