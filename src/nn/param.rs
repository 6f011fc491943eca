//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::cell::RefCell;
use std::rc::Rc;

use tch::{Device, Kind, Tensor};

use crate::ErrPack;
use crate::tensor::{self, TensorOpError};

//--------------------------------------------------------------------------------------------------

/// How a parameter is (re)initialized.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Init {
	/// Uniform in `[-bound, bound]`.
	Uniform(f64),
	Const(f64),
}

impl Init {
	/// The default for convolution and linear layers: uniform in `±1/sqrt(fan_in)`.
	pub fn fan_in(fan_in: i64) -> Self {
		let fan_in = fan_in.max(1) as f64;
		Self::Uniform(1.0 / fan_in.sqrt())
	}
}

pub struct Param {
	value: Tensor,
	init: Init,
}

impl Param {
	pub fn new(
		shape: &[i64],
		init: Init,
		kind: Kind,
		device: Device,
	) -> Result<Rc<RefCell<Self>>, ErrPack<TensorOpError>> {
		let value = Tensor::f_empty(shape, (kind, device))?;
		let mut param = Self { value, init };
		param.randomize()?;
		param.value = param.value.detach().set_requires_grad(true);
		Ok(Rc::new(RefCell::new(param)))
	}

	pub fn value(&self) -> &Tensor {
		&self.value
	}

	pub fn shape(&self) -> Vec<i64> {
		self.value.size()
	}

	pub fn kind(&self) -> Kind {
		self.value.kind()
	}

	/// The accumulated gradient, if a backward pass reached this parameter.
	pub fn grad(&self) -> Option<Tensor> {
		let grad = self.value.grad();
		if grad.defined() { Some(grad) } else { None }
	}

	pub fn randomize(&mut self) -> Result<(), ErrPack<TensorOpError>> {
		let init = self.init;
		let value = &mut self.value;
		tch::no_grad(|| -> Result<(), ErrPack<TensorOpError>> {
			match init {
				Init::Uniform(bound) => value.f_uniform_(-bound, bound)?,
				Init::Const(c) => value.f_fill_(c)?,
			};
			Ok(())
		})
	}

	pub fn zero_grad(&mut self) {
		self.value.zero_grad();
	}

	/// Copies `src` into the parameter, converting the dtype.
	pub fn assign(&mut self, src: &Tensor) -> Result<(), ErrPack<TensorOpError>> {
		tensor::ensure_same_shape(src, &self.value)?;
		let value = &mut self.value;
		tch::no_grad(|| -> Result<(), ErrPack<TensorOpError>> {
			value.f_copy_(src)?;
			Ok(())
		})
	}
}
