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
use crate::tensor::TensorOpError;
use crate::util::join_name;

use super::{GroupNorm, Layer, Linear, Module, norm};

//--------------------------------------------------------------------------------------------------

/// norm -> relu -> global average pool -> [dropout] -> flatten -> [linear]
///
///     input: [batch, channels, height, width]
///     output: [batch, classes], or [batch, channels] without the linear layer
///
/// Parameters are named after their position in that sequence: the norm is
/// `module.0`, the linear layer `module.4` (`module.5` when dropout is present).
pub struct ClassifierHead {
	norm: GroupNorm,
	dropout: f64,
	linear: Option<Linear>,
}

impl ClassifierHead {
	pub fn new(
		ctx: &mut ModelContext,
		channels: i64,
		classes: i64,
		dropout: f64,
	) -> Result<Self, ErrPack<TensorOpError>> {
		Ok(Self {
			norm: norm(ctx, channels)?,
			dropout,
			linear: Some(Linear::new(ctx, channels, classes)?),
		})
	}

	/// Drops the linear layer, so that the head yields pooled features.
	pub fn remove_linear(&mut self) {
		self.linear = None;
	}

	pub fn has_linear(&self) -> bool {
		self.linear.is_some()
	}

	fn linear_index(&self) -> usize {
		if self.dropout > 0.0 { 5 } else { 4 }
	}
}

impl Module for ClassifierHead {
	fn collect_named_params(&self, prefix: &str, f: &mut dyn FnMut(String, Rc<RefCell<Param>>)) {
		self.norm.collect_named_params(&join_name(prefix, "module.0"), f);
		if let Some(linear) = &self.linear {
			let name = format!("module.{}", self.linear_index());
			linear.collect_named_params(&join_name(prefix, &name), f);
		}
	}
}

impl Layer for ClassifierHead {
	fn forward(&self, inp: &Tensor, ctx: &mut EvalContext) -> Result<Tensor, ErrPack<TensorOpError>> {
		let x = self.norm.apply(inp)?.f_relu()?;
		let mut x = x.f_adaptive_avg_pool2d([1, 1])?;
		if self.dropout > 0.0 {
			x = x.f_dropout(self.dropout, ctx.is_training())?;
		}
		let x = x.f_flatten(1, -1)?;
		match &self.linear {
			Some(linear) => linear.apply(&x),
			None => Ok(x),
		}
	}
}

/// `[batch, channels, height, width] -> [batch, channels]`
pub fn global_avg_pool(x: &Tensor) -> Result<Tensor, ErrPack<TensorOpError>> {
	Ok(x.f_mean_dim(&[-1_i64, -2][..], false, x.kind())?)
}
