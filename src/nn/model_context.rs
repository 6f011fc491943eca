//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::cell::RefCell;
use std::rc::Rc;

use tch::{Device, Kind};

use crate::ErrPack;
use crate::tensor::TensorOpError;

use super::param::{Init, Param};

/// Creates parameters on one device with one dtype, and keeps track of them.
pub struct ModelContext {
	pub params: Vec<Rc<RefCell<Param>>>,
	pub kind: Kind,
	pub device: Device,
}

impl ModelContext {
	pub fn new(kind: Kind, device: Device) -> Self {
		Self { params: Vec::new(), kind, device }
	}

	pub fn new_param(
		&mut self,
		shape: &[i64],
		init: Init,
	) -> Result<Rc<RefCell<Param>>, ErrPack<TensorOpError>> {
		let param = Param::new(shape, init, self.kind, self.device)?;
		self.params.push(param.clone());
		Ok(param)
	}

	pub fn zero_grad(&self) {
		for param in &self.params {
			param.borrow_mut().zero_grad();
		}
	}

	/// Total number of scalar parameters.
	pub fn numel(&self) -> usize {
		self.params.iter().map(|p| p.borrow().value().numel()).sum()
	}
}

impl Default for ModelContext {
	fn default() -> Self {
		Self::new(Kind::Float, Device::Cpu)
	}
}
