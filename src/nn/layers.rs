//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::cell::RefCell;
use std::rc::Rc;

use tch::Tensor;

pub mod classifier;
pub mod conv;
pub mod downsample;
pub mod group_norm;
pub mod linear;
pub mod ode_block;
pub mod ode_func;
pub mod res_block;

#[cfg(test)]
mod tests;

use crate::ErrPack;
use crate::tensor::TensorOpError;

use super::{EvalContext, Param};

pub use classifier::{ClassifierHead, global_avg_pool};
pub use conv::{ConcatConv2d, Conv2d, conv1x1, conv3x3};
pub use downsample::{Downsample, DownsampleOutput};
pub use group_norm::{GroupNorm, norm};
pub use linear::Linear;
pub use ode_block::{OdeBlock, OdeOutput};
pub use ode_func::OdeFunc;
pub use res_block::ResBlock;

//--------------------------------------------------------------------------------------------------

/// Anything that owns parameters.
///
/// Names are dotted paths, the same paths PyTorch uses in a `state_dict`, so
/// that checkpoints can be matched by name.
pub trait Module {
	fn collect_named_params(&self, prefix: &str, f: &mut dyn FnMut(String, Rc<RefCell<Param>>));

	fn collect_params(&self, f: &mut dyn FnMut(Rc<RefCell<Param>>)) {
		self.collect_named_params("", &mut |_, p| f(p));
	}

	fn params(&self) -> Vec<Rc<RefCell<Param>>> {
		let mut params = Vec::new();
		self.collect_params(&mut |p| params.push(p));
		params
	}

	fn named_params(&self, prefix: &str) -> Vec<(String, Rc<RefCell<Param>>)> {
		let mut params = Vec::new();
		self.collect_named_params(prefix, &mut |name, p| params.push((name, p)));
		params
	}

	fn randomize(&self) -> Result<(), ErrPack<TensorOpError>> {
		for param in self.params() {
			param.borrow_mut().randomize()?;
		}
		Ok(())
	}
}

/// A module mapping one tensor to one tensor.
pub trait Layer: Module {
	fn forward(&self, inp: &Tensor, ctx: &mut EvalContext) -> Result<Tensor, ErrPack<TensorOpError>>;
}
