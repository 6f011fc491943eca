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

/// 2-D convolution with square kernels.
///
///     input: [batch, inputs, height, width]
///     weight: [outputs, inputs, kernel, kernel]
///     output: [batch, outputs, height', width']
pub struct Conv2d {
	weight: Rc<RefCell<Param>>,
	bias: Option<Rc<RefCell<Param>>>,
	stride: i64,
	padding: i64,
}

impl Conv2d {
	pub fn new(
		ctx: &mut ModelContext,
		inputs: i64,
		outputs: i64,
		kernel: i64,
		stride: i64,
		padding: i64,
		bias: bool,
	) -> Result<Self, ErrPack<TensorOpError>> {
		let init = Init::fan_in(inputs * kernel * kernel);
		let weight = ctx.new_param(&[outputs, inputs, kernel, kernel], init)?;
		let bias = if bias { Some(ctx.new_param(&[outputs], init)?) } else { None };
		Ok(Self { weight, bias, stride, padding })
	}

	pub fn weight(&self) -> Rc<RefCell<Param>> {
		self.weight.clone()
	}

	pub fn apply(&self, inp: &Tensor) -> Result<Tensor, ErrPack<TensorOpError>> {
		let weight = self.weight.borrow();
		let bias = self.bias.as_ref().map(|b| b.borrow());
		let out = inp.f_conv2d(
			weight.value(),
			bias.as_ref().map(|b| b.value()),
			[self.stride, self.stride],
			[self.padding, self.padding],
			[1, 1],
			1,
		)?;
		Ok(out)
	}
}

impl Module for Conv2d {
	fn collect_named_params(&self, prefix: &str, f: &mut dyn FnMut(String, Rc<RefCell<Param>>)) {
		f(join_name(prefix, "weight"), self.weight.clone());
		if let Some(bias) = &self.bias {
			f(join_name(prefix, "bias"), bias.clone());
		}
	}
}

impl Layer for Conv2d {
	fn forward(&self, inp: &Tensor, _ctx: &mut EvalContext) -> Result<Tensor, ErrPack<TensorOpError>> {
		self.apply(inp)
	}
}

/// 3x3 convolution with padding, without bias.
pub fn conv3x3(
	ctx: &mut ModelContext,
	inputs: i64,
	outputs: i64,
	stride: i64,
) -> Result<Conv2d, ErrPack<TensorOpError>> {
	Conv2d::new(ctx, inputs, outputs, 3, stride, 1, false)
}

/// 1x1 convolution, without bias.
pub fn conv1x1(
	ctx: &mut ModelContext,
	inputs: i64,
	outputs: i64,
	stride: i64,
) -> Result<Conv2d, ErrPack<TensorOpError>> {
	Conv2d::new(ctx, inputs, outputs, 1, stride, 0, false)
}

//--------------------------------------------------------------------------------------------------

/// Convolution that sees the time as an extra, constant input channel.
///
///     input: [batch, dim, height, width]
///     conv input: [batch, 1 + dim, height, width]  (channel 0 filled with t)
///     output: [batch, dim, height, width]
pub struct ConcatConv2d {
	layer: Conv2d,
}

impl ConcatConv2d {
	pub fn new(ctx: &mut ModelContext, dim: i64) -> Result<Self, ErrPack<TensorOpError>> {
		Ok(Self { layer: Conv2d::new(ctx, dim + 1, dim, 3, 1, 1, true)? })
	}

	pub fn apply(&self, t: f64, x: &Tensor) -> Result<Tensor, ErrPack<TensorOpError>> {
		let tt = x.f_narrow(1, 0, 1)?.f_full_like(t)?;
		let ttx = Tensor::f_cat(&[&tt, x], 1)?;
		self.layer.apply(&ttx)
	}
}

impl Module for ConcatConv2d {
	fn collect_named_params(&self, prefix: &str, f: &mut dyn FnMut(String, Rc<RefCell<Param>>)) {
		self.layer.collect_named_params(&join_name(prefix, "_layer"), f);
	}
}
