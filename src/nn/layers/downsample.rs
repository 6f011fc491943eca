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
use crate::config::{DownsampleKind, NetworkConfig, Ode2Continuation};
use crate::nn::eval_context::EvalContext;
use crate::nn::model_context::ModelContext;
use crate::nn::param::Param;
use crate::tensor::TensorOpError;
use crate::util::join_name;

use super::{Conv2d, GroupNorm, Module, OdeBlock, OdeOutput, ResBlock, norm};

//--------------------------------------------------------------------------------------------------

/// What a downsample stage hands to the rest of the network.
#[derive(Debug)]
pub enum DownsampleOutput {
	Single(Tensor),

	/// An ODE stage in trajectory mode: the per-timestep states, and the tensor
	/// the network continues from.
	WithAuxiliary { trajectory: Tensor, continuation: Tensor },
}

impl DownsampleOutput {
	/// The tensor the network continues from.
	pub fn continuation(&self) -> &Tensor {
		match self {
			Self::Single(x) | Self::WithAuxiliary { continuation: x, .. } => x,
		}
	}
}

//--------------------------------------------------------------------------------------------------

/// conv 3x3 (no padding) followed by two strided residual blocks.
pub struct ResidualDownsample {
	conv: Conv2d,
	block1: ResBlock,
	block2: ResBlock,
}

impl ResidualDownsample {
	pub fn new(ctx: &mut ModelContext, in_ch: i64, out_ch: i64) -> Result<Self, ErrPack<TensorOpError>> {
		Ok(Self {
			conv: Conv2d::new(ctx, in_ch, 64, 3, 1, 0, true)?,
			block1: ResBlock::new_downsampling(ctx, 64, 64, 2)?,
			block2: ResBlock::new_downsampling(ctx, 64, out_ch, 2)?,
		})
	}

	pub fn apply(&self, x: &Tensor) -> Result<Tensor, ErrPack<TensorOpError>> {
		let x = self.conv.apply(x)?;
		let x = self.block1.apply(&x)?;
		self.block2.apply(&x)
	}
}

impl Module for ResidualDownsample {
	fn collect_named_params(&self, prefix: &str, f: &mut dyn FnMut(String, Rc<RefCell<Param>>)) {
		self.conv.collect_named_params(&join_name(prefix, "module.0"), f);
		self.block1.collect_named_params(&join_name(prefix, "module.1"), f);
		self.block2.collect_named_params(&join_name(prefix, "module.2"), f);
	}
}

/// conv(3) -> norm -> relu -> conv(4, /2) -> norm -> relu -> conv(4, /2)
pub struct ConvDownsample {
	conv1: Conv2d,
	norm1: GroupNorm,
	conv2: Conv2d,
	norm2: GroupNorm,
	conv3: Conv2d,
}

impl ConvDownsample {
	pub fn new(
		ctx: &mut ModelContext,
		in_ch: i64,
		width: i64,
		out_ch: i64,
	) -> Result<Self, ErrPack<TensorOpError>> {
		Ok(Self {
			conv1: Conv2d::new(ctx, in_ch, width, 3, 1, 0, true)?,
			norm1: norm(ctx, width)?,
			conv2: Conv2d::new(ctx, width, width, 4, 2, 1, true)?,
			norm2: norm(ctx, width)?,
			conv3: Conv2d::new(ctx, width, out_ch, 4, 2, 1, true)?,
		})
	}

	pub fn apply(&self, x: &Tensor) -> Result<Tensor, ErrPack<TensorOpError>> {
		let x = self.conv1.apply(x)?;
		let x = self.norm1.apply(&x)?.f_relu()?;
		let x = self.conv2.apply(&x)?;
		let x = self.norm2.apply(&x)?.f_relu()?;
		self.conv3.apply(&x)
	}
}

impl Module for ConvDownsample {
	fn collect_named_params(&self, prefix: &str, f: &mut dyn FnMut(String, Rc<RefCell<Param>>)) {
		self.conv1.collect_named_params(&join_name(prefix, "module.0"), f);
		self.norm1.collect_named_params(&join_name(prefix, "module.1"), f);
		self.conv2.collect_named_params(&join_name(prefix, "module.3"), f);
		self.norm2.collect_named_params(&join_name(prefix, "module.4"), f);
		self.conv3.collect_named_params(&join_name(prefix, "module.6"), f);
	}
}

//--------------------------------------------------------------------------------------------------

/// conv(4, /2) -> ODE block -> max pool(4, /2)
pub struct OdeDownsample {
	conv1: Conv2d,
	odeblock: OdeBlock,
}

impl OdeDownsample {
	pub fn new(ctx: &mut ModelContext, config: &NetworkConfig) -> Result<Self, ErrPack<TensorOpError>> {
		Ok(Self {
			conv1: Conv2d::new(ctx, config.in_ch, config.n_filters, 4, 2, 1, true)?,
			odeblock: new_odeblock(ctx, config)?,
		})
	}

	pub fn forward(
		&self,
		x: &Tensor,
		ctx: &mut EvalContext,
	) -> Result<DownsampleOutput, ErrPack<TensorOpError>> {
		let x = self.conv1.apply(x)?;
		match self.odeblock.forward(&x, ctx)? {
			OdeOutput::Final(x) => Ok(DownsampleOutput::Single(max_pool(&x)?)),
			OdeOutput::Trajectory(xs) => {
				let continuation = max_pool(&xs.f_select(0, -1)?)?;
				Ok(DownsampleOutput::WithAuxiliary { trajectory: xs, continuation })
			},
		}
	}
}

impl Module for OdeDownsample {
	fn collect_named_params(&self, prefix: &str, f: &mut dyn FnMut(String, Rc<RefCell<Param>>)) {
		self.conv1.collect_named_params(&join_name(prefix, "conv1"), f);
		self.odeblock.collect_named_params(&join_name(prefix, "odeblock"), f);
	}
}

/// conv(4, /2) -> ODE block -> norm -> relu -> conv(4, /2)
///
/// In trajectory mode every state gets norm and relu; `continuation` decides
/// whether the last conv is applied to every state or only to the last one.
pub struct OdeDownsample2 {
	conv1: Conv2d,
	odeblock: OdeBlock,
	norm: GroupNorm,
	conv2: Conv2d,
	continuation: Ode2Continuation,
}

impl OdeDownsample2 {
	pub fn new(ctx: &mut ModelContext, config: &NetworkConfig) -> Result<Self, ErrPack<TensorOpError>> {
		let filters = config.n_filters;
		Ok(Self {
			conv1: Conv2d::new(ctx, config.in_ch, filters, 4, 2, 1, true)?,
			odeblock: new_odeblock(ctx, config)?,
			norm: norm(ctx, filters)?,
			conv2: Conv2d::new(ctx, filters, filters, 4, 2, 1, true)?,
			continuation: config.ode2_continuation,
		})
	}

	pub fn continuation(&self) -> Ode2Continuation {
		self.continuation
	}

	pub fn set_continuation(&mut self, continuation: Ode2Continuation) {
		self.continuation = continuation;
	}

	pub fn forward(
		&self,
		x: &Tensor,
		ctx: &mut EvalContext,
	) -> Result<DownsampleOutput, ErrPack<TensorOpError>> {
		let x = self.conv1.apply(x)?;
		match self.odeblock.forward(&x, ctx)? {
			OdeOutput::Final(x) => Ok(DownsampleOutput::Single(self.tail(&x)?)),
			OdeOutput::Trajectory(xs) => {
				// The continuation shares no graph nodes with the trajectory: an
				// adjoint replay backpropagates through it after `loss.backward()`.
				let continuation = self.tail(&xs.f_select(0, -1)?)?;
				let trajectory = match self.continuation {
					Ode2Continuation::LastOnly => map_steps(&xs, |x| Ok(self.norm.apply(x)?.f_relu()?))?,
					Ode2Continuation::EveryStep => map_steps(&xs, |x| self.tail(x))?,
				};
				Ok(DownsampleOutput::WithAuxiliary { trajectory, continuation })
			},
		}
	}

	/// norm -> relu -> conv
	fn tail(&self, x: &Tensor) -> Result<Tensor, ErrPack<TensorOpError>> {
		let x = self.norm.apply(x)?.f_relu()?;
		self.conv2.apply(&x)
	}
}

impl Module for OdeDownsample2 {
	fn collect_named_params(&self, prefix: &str, f: &mut dyn FnMut(String, Rc<RefCell<Param>>)) {
		self.conv1.collect_named_params(&join_name(prefix, "conv1"), f);
		self.odeblock.collect_named_params(&join_name(prefix, "odeblock"), f);
		self.norm.collect_named_params(&join_name(prefix, "norm.0"), f);
		self.conv2.collect_named_params(&join_name(prefix, "conv2"), f);
	}
}

fn new_odeblock(ctx: &mut ModelContext, config: &NetworkConfig) -> Result<OdeBlock, ErrPack<TensorOpError>> {
	let mut block = OdeBlock::new(
		ctx,
		config.n_filters,
		config.t1.clone(),
		config.method,
		config.tol,
		config.adjoint,
	)?;
	block.set_output(config.output);
	Ok(block)
}

fn max_pool(x: &Tensor) -> Result<Tensor, ErrPack<TensorOpError>> {
	Ok(x.f_max_pool2d([4, 4], [2, 2], [1, 1], [1, 1], false)?)
}

/// Applies `f` to every entry along dimension 0 and stacks the results.
pub fn map_steps(
	xs: &Tensor,
	mut f: impl FnMut(&Tensor) -> Result<Tensor, ErrPack<TensorOpError>>,
) -> Result<Tensor, ErrPack<TensorOpError>> {
	let steps = xs.f_unbind(0)?.iter().map(&mut f).collect::<Result<Vec<_>, _>>()?;
	Ok(Tensor::f_stack(&steps, 0)?)
}

//--------------------------------------------------------------------------------------------------

/// The first stage of a network, chosen by `DownsampleKind`.
pub enum Downsample {
	Residual(ResidualDownsample),
	Convolution(ConvDownsample),
	Minimal(ConvDownsample),
	OneShot(Conv2d),
	Ode(OdeDownsample),
	Ode2(OdeDownsample2),
}

impl Downsample {
	pub fn new(ctx: &mut ModelContext, config: &NetworkConfig) -> Result<Self, ErrPack<TensorOpError>> {
		let (in_ch, out_ch) = (config.in_ch, config.n_filters);
		Ok(match config.downsample {
			DownsampleKind::Residual => Self::Residual(ResidualDownsample::new(ctx, in_ch, out_ch)?),
			DownsampleKind::Convolution => Self::Convolution(ConvDownsample::new(ctx, in_ch, 64, out_ch)?),
			DownsampleKind::Minimal => Self::Minimal(ConvDownsample::new(ctx, in_ch, 24, out_ch)?),
			DownsampleKind::OneShot => Self::OneShot(Conv2d::new(ctx, in_ch, out_ch, 4, 2, 1, true)?),
			DownsampleKind::Ode => Self::Ode(OdeDownsample::new(ctx, config)?),
			DownsampleKind::Ode2 => Self::Ode2(OdeDownsample2::new(ctx, config)?),
		})
	}

	pub fn kind(&self) -> DownsampleKind {
		match self {
			Self::Residual(_) => DownsampleKind::Residual,
			Self::Convolution(_) => DownsampleKind::Convolution,
			Self::Minimal(_) => DownsampleKind::Minimal,
			Self::OneShot(_) => DownsampleKind::OneShot,
			Self::Ode(_) => DownsampleKind::Ode,
			Self::Ode2(_) => DownsampleKind::Ode2,
		}
	}

	pub fn odeblock(&self) -> Option<&OdeBlock> {
		match self {
			Self::Ode(d) => Some(&d.odeblock),
			Self::Ode2(d) => Some(&d.odeblock),
			_ => None,
		}
	}

	pub fn odeblock_mut(&mut self) -> Option<&mut OdeBlock> {
		match self {
			Self::Ode(d) => Some(&mut d.odeblock),
			Self::Ode2(d) => Some(&mut d.odeblock),
			_ => None,
		}
	}

	pub fn forward(
		&self,
		x: &Tensor,
		ctx: &mut EvalContext,
	) -> Result<DownsampleOutput, ErrPack<TensorOpError>> {
		match self {
			Self::Residual(d) => Ok(DownsampleOutput::Single(d.apply(x)?)),
			Self::Convolution(d) | Self::Minimal(d) => Ok(DownsampleOutput::Single(d.apply(x)?)),
			Self::OneShot(conv) => Ok(DownsampleOutput::Single(conv.apply(x)?)),
			Self::Ode(d) => d.forward(x, ctx),
			Self::Ode2(d) => d.forward(x, ctx),
		}
	}
}

impl Module for Downsample {
	fn collect_named_params(&self, prefix: &str, f: &mut dyn FnMut(String, Rc<RefCell<Param>>)) {
		match self {
			Self::Residual(d) => d.collect_named_params(prefix, f),
			Self::Convolution(d) | Self::Minimal(d) => d.collect_named_params(prefix, f),
			Self::OneShot(conv) => conv.collect_named_params(&join_name(prefix, "module"), f),
			Self::Ode(d) => d.collect_named_params(prefix, f),
			Self::Ode2(d) => d.collect_named_params(prefix, f),
		}
	}
}
