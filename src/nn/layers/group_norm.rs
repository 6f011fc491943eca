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

pub struct GroupNorm {
	groups: i64,
	eps: f64,
	weight: Rc<RefCell<Param>>,
	bias: Rc<RefCell<Param>>,
}

impl GroupNorm {
	pub fn new(
		ctx: &mut ModelContext,
		groups: i64,
		channels: i64,
	) -> Result<Self, ErrPack<TensorOpError>> {
		if groups <= 0 || channels % groups != 0 {
			return Err(ErrPack::with_message(
				TensorOpError::InvalidShape,
				format!("{channels} channels cannot be split into {groups} groups"),
			));
		}
		Ok(Self {
			groups,
			eps: 1e-5,
			weight: ctx.new_param(&[channels], Init::Const(1.0))?,
			bias: ctx.new_param(&[channels], Init::Const(0.0))?,
		})
	}

	pub fn apply(&self, inp: &Tensor) -> Result<Tensor, ErrPack<TensorOpError>> {
		let weight = self.weight.borrow();
		let bias = self.bias.borrow();
		let out =
			inp.f_group_norm(self.groups, Some(weight.value()), Some(bias.value()), self.eps, false)?;
		Ok(out)
	}
}

impl Module for GroupNorm {
	fn collect_named_params(&self, prefix: &str, f: &mut dyn FnMut(String, Rc<RefCell<Param>>)) {
		f(join_name(prefix, "weight"), self.weight.clone());
		f(join_name(prefix, "bias"), self.bias.clone());
	}
}

impl Layer for GroupNorm {
	fn forward(&self, inp: &Tensor, _ctx: &mut EvalContext) -> Result<Tensor, ErrPack<TensorOpError>> {
		self.apply(inp)
	}
}

/// Group normalization with `min(32, dim)` groups.
pub fn norm(ctx: &mut ModelContext, dim: i64) -> Result<GroupNorm, ErrPack<TensorOpError>> {
	GroupNorm::new(ctx, dim.min(32), dim)
}
