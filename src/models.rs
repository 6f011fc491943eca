//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Top-level image classifiers.

use std::cell::RefCell;
use std::rc::Rc;

use tch::Tensor;

use crate::nn::layers::downsample::map_steps;
use crate::nn::layers::{
	ClassifierHead, Downsample, DownsampleOutput, Layer, Module, OdeBlock, OdeOutput, ResBlock,
	global_avg_pool,
};
use crate::nn::{EvalContext, ModelContext, Param};
use crate::ode::OutputMode;
use crate::tensor::TensorOpError;
use crate::util::join_name;
use crate::{ErrExtra, ErrPack};

pub use crate::config::{ConfigError, ModelKind, NetworkConfig};

#[cfg(test)]
mod tests;

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ModelError {
	/// The configuration was rejected. The nested error has the details.
	Config,

	/// Allocating or initializing parameters failed.
	Tensor,
}

impl From<ErrPack<ConfigError>> for ErrPack<ModelError> {
	#[cold]
	#[inline(never)]
	fn from(err: ErrPack<ConfigError>) -> Self {
		let message = format!("invalid configuration: {}", err.message());
		Self {
			code: ModelError::Config,
			extra: Some(Box::new(ErrExtra { message: message.into(), nested: Some(Box::new(err)) })),
		}
	}
}

impl From<ErrPack<TensorOpError>> for ErrPack<ModelError> {
	#[cold]
	#[inline(never)]
	fn from(err: ErrPack<TensorOpError>) -> Self {
		let message = format!("cannot build the network: {}", err.message());
		Self {
			code: ModelError::Tensor,
			extra: Some(Box::new(ErrExtra { message: message.into(), nested: Some(Box::new(err)) })),
		}
	}
}

//--------------------------------------------------------------------------------------------------

pub trait Model: Module {
	/// `x: [batch, channels, height, width]`
	///
	/// Returns `[batch, classes]` class scores. When ODE blocks report
	/// trajectories, the per-timestep results are stacked on a new leading
	/// dimension, auxiliary (downsample) results first.
	fn forward(&self, x: &Tensor, ctx: &mut EvalContext) -> Result<Tensor, ErrPack<TensorOpError>>;

	/// Forward function evaluations of the main ODE block.
	fn nfe(&self, reset: bool) -> usize;

	fn is_feature_extractor(&self) -> bool;

	/// Makes every ODE block report its trajectory and drops the final linear
	/// layer, so that the network yields pooled features at every timestep.
	fn into_feature_extractor(self) -> Self
	where
		Self: Sized;
}

//--------------------------------------------------------------------------------------------------

/// downsample -> ODE block -> classifier head
pub struct OdeNet {
	downsample: Downsample,
	odeblock: OdeBlock,
	classifier: ClassifierHead,
}

impl OdeNet {
	pub fn new(ctx: &mut ModelContext, config: &NetworkConfig) -> Result<Self, ErrPack<ModelError>> {
		config.validate()?;
		let downsample = Downsample::new(ctx, config)?;
		let mut odeblock = OdeBlock::new(
			ctx,
			config.n_filters,
			config.t1.clone(),
			config.method,
			config.tol,
			config.adjoint,
		)?;
		odeblock.set_output(config.output);
		let classifier = ClassifierHead::new(ctx, config.n_filters, config.out, config.dropout)?;

		log::info!(
			"OdeNet: downsample={} method={} tol={} adjoint={} t={} filters={} classes={}",
			config.downsample,
			config.method,
			config.tol,
			config.adjoint,
			config.t1,
			config.n_filters,
			config.out,
		);
		let net = Self { downsample, odeblock, classifier };
		Ok(if config.features_extractor { net.into_feature_extractor() } else { net })
	}

	pub fn downsample(&self) -> &Downsample {
		&self.downsample
	}

	pub fn downsample_mut(&mut self) -> &mut Downsample {
		&mut self.downsample
	}

	pub fn odeblock(&self) -> &OdeBlock {
		&self.odeblock
	}

	pub fn odeblock_mut(&mut self) -> &mut OdeBlock {
		&mut self.odeblock
	}
}

impl Module for OdeNet {
	fn collect_named_params(&self, prefix: &str, f: &mut dyn FnMut(String, Rc<RefCell<Param>>)) {
		self.downsample.collect_named_params(&join_name(prefix, "downsample"), f);
		self.odeblock.collect_named_params(&join_name(prefix, "odeblock"), f);
		self.classifier.collect_named_params(&join_name(prefix, "classifier"), f);
	}
}

impl Model for OdeNet {
	fn forward(&self, x: &Tensor, ctx: &mut EvalContext) -> Result<Tensor, ErrPack<TensorOpError>> {
		let mut out = Vec::with_capacity(2);

		let x = match self.downsample.forward(x, ctx)? {
			DownsampleOutput::Single(x) => x,
			DownsampleOutput::WithAuxiliary { trajectory, continuation } => {
				let aux = if self.classifier.has_linear() {
					map_steps(&trajectory, |fi| self.classifier.forward(fi, ctx))?
				} else {
					map_steps(&trajectory, global_avg_pool)?
				};
				out.push(aux);
				continuation
			},
		};

		let main = match self.odeblock.forward(&x, ctx)? {
			OdeOutput::Final(x) => self.classifier.forward(&x, ctx)?,
			OdeOutput::Trajectory(xs) => map_steps(&xs, |xi| self.classifier.forward(xi, ctx))?,
		};
		out.push(main);

		if out.len() == 1 && let Some(main) = out.pop() {
			return Ok(main);
		}
		Ok(Tensor::f_cat(&out, 0)?)
	}

	fn nfe(&self, reset: bool) -> usize {
		let nfe = self.odeblock.nfe();
		if reset {
			self.odeblock.reset_nfe();
		}
		nfe
	}

	fn is_feature_extractor(&self) -> bool {
		!self.classifier.has_linear()
	}

	fn into_feature_extractor(mut self) -> Self {
		if let Some(block) = self.downsample.odeblock_mut() {
			block.set_output(OutputMode::Trajectory);
		}
		self.odeblock.set_output(OutputMode::Trajectory);
		self.classifier.remove_linear();
		self
	}
}

//--------------------------------------------------------------------------------------------------

/// downsample -> 6 residual blocks -> classifier head
pub struct ResNet {
	downsample: Downsample,
	features: Vec<ResBlock>,
	classifier: ClassifierHead,
}

impl ResNet {
	pub const DEPTH: usize = 6;

	pub fn new(ctx: &mut ModelContext, config: &NetworkConfig) -> Result<Self, ErrPack<ModelError>> {
		config.validate()?;
		if config.downsample.uses_ode() {
			return Err(ErrPack::with_message(
				ConfigError::UnsupportedDownsample,
				format!("ResNet does not support the '{}' downsample", config.downsample),
			)
			.into());
		}
		let filters = config.n_filters;
		let downsample = Downsample::new(ctx, config)?;
		let features = (0..Self::DEPTH)
			.map(|_| ResBlock::new(ctx, filters, filters, 1))
			.collect::<Result<Vec<_>, _>>()?;
		let classifier = ClassifierHead::new(ctx, filters, config.out, config.dropout)?;

		log::info!(
			"ResNet: downsample={} depth={} filters={filters} classes={}",
			config.downsample,
			Self::DEPTH,
			config.out,
		);
		let net = Self { downsample, features, classifier };
		Ok(if config.features_extractor { net.into_feature_extractor() } else { net })
	}
}

impl Module for ResNet {
	fn collect_named_params(&self, prefix: &str, f: &mut dyn FnMut(String, Rc<RefCell<Param>>)) {
		self.downsample.collect_named_params(&join_name(prefix, "downsample"), f);
		for (i, block) in self.features.iter().enumerate() {
			block.collect_named_params(&join_name(prefix, &format!("features.{i}")), f);
		}
		self.classifier.collect_named_params(&join_name(prefix, "classifier"), f);
	}
}

impl Model for ResNet {
	fn forward(&self, x: &Tensor, ctx: &mut EvalContext) -> Result<Tensor, ErrPack<TensorOpError>> {
		let mut x = match self.downsample.forward(x, ctx)? {
			DownsampleOutput::Single(x) => x,
			DownsampleOutput::WithAuxiliary { continuation, .. } => continuation,
		};
		for block in &self.features {
			x = block.forward(&x, ctx)?;
		}
		self.classifier.forward(&x, ctx)
	}

	fn nfe(&self, _reset: bool) -> usize {
		0
	}

	fn is_feature_extractor(&self) -> bool {
		!self.classifier.has_linear()
	}

	fn into_feature_extractor(mut self) -> Self {
		self.classifier.remove_linear();
		self
	}
}

//--------------------------------------------------------------------------------------------------

/// Either network, as selected by `ModelKind`.
pub enum Network {
	OdeNet(OdeNet),
	ResNet(ResNet),
}

impl Network {
	pub fn new(
		ctx: &mut ModelContext,
		kind: ModelKind,
		config: &NetworkConfig,
	) -> Result<Self, ErrPack<ModelError>> {
		Ok(match kind {
			ModelKind::OdeNet => Self::OdeNet(OdeNet::new(ctx, config)?),
			ModelKind::ResNet => Self::ResNet(ResNet::new(ctx, config)?),
		})
	}

	pub fn kind(&self) -> ModelKind {
		match self {
			Self::OdeNet(_) => ModelKind::OdeNet,
			Self::ResNet(_) => ModelKind::ResNet,
		}
	}
}

impl Module for Network {
	fn collect_named_params(&self, prefix: &str, f: &mut dyn FnMut(String, Rc<RefCell<Param>>)) {
		match self {
			Self::OdeNet(net) => net.collect_named_params(prefix, f),
			Self::ResNet(net) => net.collect_named_params(prefix, f),
		}
	}
}

impl Model for Network {
	fn forward(&self, x: &Tensor, ctx: &mut EvalContext) -> Result<Tensor, ErrPack<TensorOpError>> {
		match self {
			Self::OdeNet(net) => net.forward(x, ctx),
			Self::ResNet(net) => net.forward(x, ctx),
		}
	}

	fn nfe(&self, reset: bool) -> usize {
		match self {
			Self::OdeNet(net) => net.nfe(reset),
			Self::ResNet(net) => net.nfe(reset),
		}
	}

	fn is_feature_extractor(&self) -> bool {
		match self {
			Self::OdeNet(net) => net.is_feature_extractor(),
			Self::ResNet(net) => net.is_feature_extractor(),
		}
	}

	fn into_feature_extractor(self) -> Self {
		match self {
			Self::OdeNet(net) => Self::OdeNet(net.into_feature_extractor()),
			Self::ResNet(net) => Self::ResNet(net.into_feature_extractor()),
		}
	}
}
