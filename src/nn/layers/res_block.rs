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

use super::{Conv2d, GroupNorm, Layer, Module, conv1x1, conv3x3, norm};

//--------------------------------------------------------------------------------------------------

/// Pre-activation residual block.
///
/// ```
///           +-------+   +------+   +-------+   +-------+   +------+   +-------+   +-----+
/// x ------->| norm1 |-->| relu |-+>| conv1 |-->| norm2 |-->| relu |-->| conv2 |-->| add |--->
///    |      +-------+   +------+ | +-------+   +-------+   +------+   +-------+   +-----+
///    |                           |  +------------+                                   ^
///    |                           +->| downsample |-----------------------------------+
///    |                              +------------+                                   |
///    +--------------------------------------- (without downsample) ------------------+
/// ```
pub struct ResBlock {
	norm1: GroupNorm,
	conv1: Conv2d,
	norm2: GroupNorm,
	conv2: Conv2d,
	downsample: Option<Conv2d>,
}

impl ResBlock {
	pub fn new(
		ctx: &mut ModelContext,
		inplanes: i64,
		planes: i64,
		stride: i64,
	) -> Result<Self, ErrPack<TensorOpError>> {
		Ok(Self {
			norm1: norm(ctx, inplanes)?,
			conv1: conv3x3(ctx, inplanes, planes, stride)?,
			norm2: norm(ctx, planes)?,
			conv2: conv3x3(ctx, planes, planes, 1)?,
			downsample: None,
		})
	}

	/// A block that changes resolution and/or width, with a strided 1x1
	/// convolution on the shortcut.
	pub fn new_downsampling(
		ctx: &mut ModelContext,
		inplanes: i64,
		planes: i64,
		stride: i64,
	) -> Result<Self, ErrPack<TensorOpError>> {
		let mut block = Self::new(ctx, inplanes, planes, stride)?;
		block.downsample = Some(conv1x1(ctx, inplanes, planes, stride)?);
		Ok(block)
	}

	pub fn apply(&self, x: &Tensor) -> Result<Tensor, ErrPack<TensorOpError>> {
		let out = self.norm1.apply(x)?.f_relu()?;
		let shortcut = match &self.downsample {
			Some(downsample) => downsample.apply(&out)?,
			None => x.shallow_clone(),
		};
		let out = self.conv1.apply(&out)?;
		let out = self.norm2.apply(&out)?.f_relu()?;
		let out = self.conv2.apply(&out)?;
		Ok(out.f_add(&shortcut)?)
	}
}

impl Module for ResBlock {
	fn collect_named_params(&self, prefix: &str, f: &mut dyn FnMut(String, Rc<RefCell<Param>>)) {
		self.norm1.collect_named_params(&join_name(prefix, "norm1"), f);
		self.conv1.collect_named_params(&join_name(prefix, "conv1"), f);
		self.norm2.collect_named_params(&join_name(prefix, "norm2"), f);
		self.conv2.collect_named_params(&join_name(prefix, "conv2"), f);
		if let Some(downsample) = &self.downsample {
			downsample.collect_named_params(&join_name(prefix, "downsample"), f);
		}
	}
}

impl Layer for ResBlock {
	fn forward(&self, inp: &Tensor, _ctx: &mut EvalContext) -> Result<Tensor, ErrPack<TensorOpError>> {
		self.apply(inp)
	}
}
