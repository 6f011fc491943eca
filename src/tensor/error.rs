//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::borrow::Cow;

use crate::{ErrExtra, ErrPack};

//--------------------------------------------------------------------------------------------------

/// Failures on the forward (and adjoint backward) path.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TensorOpError {
	/// libtorch reported an error while running an operation.
	Torch,
	ShapeMismatch,
	InvalidShape,

	/// The adaptive step size fell below what the time representation can resolve.
	StepSizeUnderflow,
	TooManySteps,
	NonFiniteState,
	InvalidTimes,
}

impl From<tch::TchError> for ErrPack<TensorOpError> {
	#[cold]
	#[inline(never)]
	fn from(err: tch::TchError) -> Self {
		Self {
			code: TensorOpError::Torch,
			extra: Some(Box::new(ErrExtra {
				message: Cow::from(err.to_string()),
				nested: None,
			})),
		}
	}
}

//--------------------------------------------------------------------------------------------------
