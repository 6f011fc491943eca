//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use crate::ErrPack;
use crate::ode::AdjointTape;
use crate::tensor::TensorOpError;

/// State of one forward pass.
///
/// In training mode dropout is active, and ODE blocks in adjoint mode record
/// their integrations on `tape`. After `loss.backward()`, call
/// `backward_adjoint()` to finish the gradients of those blocks.
pub struct EvalContext {
	training: bool,
	pub tape: AdjointTape,
}

impl EvalContext {
	pub fn new(training: bool) -> Self {
		Self { training, tape: AdjointTape::new() }
	}

	pub fn is_training(&self) -> bool {
		self.training
	}

	pub fn backward_adjoint(&mut self) -> Result<(), ErrPack<TensorOpError>> {
		if !self.tape.is_empty() {
			log::debug!("replaying {} adjoint integration(s)", self.tape.len());
		}
		self.tape.backward()
	}
}
