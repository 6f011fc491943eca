//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use tch::{Kind, Tensor};

use crate::ErrPack;

pub mod error;

pub use error::TensorOpError;

//--------------------------------------------------------------------------------------------------

/// Root mean square over all elements.
pub fn rms(t: &Tensor) -> Result<f64, ErrPack<TensorOpError>> {
	let mean_square = t.f_square()?.f_mean(Kind::Double)?;
	Ok(mean_square.f_double_value(&[])?.sqrt())
}

/// Max-abs over all elements, as `f64`. Returns `0.0` for empty tensors.
pub fn max_abs(t: &Tensor) -> Result<f64, ErrPack<TensorOpError>> {
	if t.numel() == 0 {
		return Ok(0.0);
	}
	Ok(t.f_abs()?.f_max()?.f_double_value(&[])?)
}

pub fn is_finite(t: &Tensor) -> Result<bool, ErrPack<TensorOpError>> {
	if t.numel() == 0 {
		return Ok(true);
	}
	let all = t.f_isfinite()?.f_all()?;
	Ok(all.f_int64_value(&[])? != 0)
}

/// Fails with `ShapeMismatch` unless both tensors have the same shape.
pub fn ensure_same_shape(a: &Tensor, b: &Tensor) -> Result<(), ErrPack<TensorOpError>> {
	let a_shape = a.size();
	let b_shape = b.size();
	if a_shape == b_shape {
		Ok(())
	} else {
		Err(ErrPack::with_message(
			TensorOpError::ShapeMismatch,
			format!("shape {a_shape:?} does not match {b_shape:?}"),
		))
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use assert_approx_eq::assert_approx_eq;
	use tch::{Device, Kind, Tensor};

	use super::*;

	#[test]
	fn test_rms() {
		let t = Tensor::from_slice(&[3.0_f32, -4.0, 0.0, 0.0]);
		assert_approx_eq!(rms(&t).unwrap(), 2.5, 1e-6);
		assert_approx_eq!(max_abs(&t).unwrap(), 4.0, 1e-6);
	}

	#[test]
	fn test_is_finite() {
		let ok = Tensor::ones([2, 3], (Kind::Float, Device::Cpu));
		assert!(is_finite(&ok).unwrap());
		let bad = Tensor::from_slice(&[1.0_f32, f32::NAN]);
		assert!(!is_finite(&bad).unwrap());
	}

	#[test]
	fn test_ensure_same_shape() {
		let a = Tensor::zeros([2, 3], (Kind::Float, Device::Cpu));
		let b = Tensor::zeros([3, 2], (Kind::Float, Device::Cpu));
		assert!(ensure_same_shape(&a, &a).is_ok());
		let err = ensure_same_shape(&a, &b).unwrap_err();
		assert_eq!(err.code, TensorOpError::ShapeMismatch);
	}
}
