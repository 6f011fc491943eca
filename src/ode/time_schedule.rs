//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::fmt;
use std::str::FromStr;

use tch::{Kind, Tensor};

use crate::ErrPack;
use crate::config::ConfigError;

//--------------------------------------------------------------------------------------------------

/// Integration horizon as given by the user: the end time, or the list of
/// times at which the state should be reported.
#[derive(Debug)]
pub enum Horizon {
	Scalar(f64),
	Sequence(Vec<f64>),
	Tensor(Tensor),
}

impl From<f64> for Horizon {
	fn from(value: f64) -> Self {
		Self::Scalar(value)
	}
}

impl From<Vec<f64>> for Horizon {
	fn from(value: Vec<f64>) -> Self {
		Self::Sequence(value)
	}
}

impl From<&[f64]> for Horizon {
	fn from(value: &[f64]) -> Self {
		Self::Sequence(value.to_vec())
	}
}

impl<const N: usize> From<[f64; N]> for Horizon {
	fn from(value: [f64; N]) -> Self {
		Self::Sequence(value.to_vec())
	}
}

impl From<Tensor> for Horizon {
	fn from(value: Tensor) -> Self {
		Self::Tensor(value)
	}
}

impl From<&Tensor> for Horizon {
	fn from(value: &Tensor) -> Self {
		Self::Tensor(value.shallow_clone())
	}
}

//--------------------------------------------------------------------------------------------------

/// Validated integration times.
///
/// The first element is always `0.0`, the remaining elements are the
/// horizon values in the order given. The sequence is non-decreasing.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSchedule {
	times: Vec<f64>,
}

impl TimeSchedule {
	pub fn new(horizon: impl Into<Horizon>) -> Result<Self, ErrPack<ConfigError>> {
		let values = match horizon.into() {
			Horizon::Scalar(v) => vec![v],
			Horizon::Sequence(values) => values,
			Horizon::Tensor(t) => tensor_values(&t)?,
		};
		if values.is_empty() {
			return Err(invalid("horizon must contain at least one time point".into()));
		}

		let mut times = Vec::with_capacity(values.len() + 1);
		times.push(0.0);
		for v in values {
			if !v.is_finite() {
				return Err(invalid(format!("horizon values must be finite, got {v}")));
			}
			let prev = times.last().copied().unwrap_or(0.0);
			if v < prev {
				return Err(invalid(format!(
					"horizon must be non-decreasing starting from 0, got {v} after {prev}"
				)));
			}
			times.push(v);
		}
		Ok(Self { times })
	}

	/// All time points, starting with `0.0`.
	pub fn times(&self) -> &[f64] {
		&self.times
	}

	/// Number of time points, including the initial one.
	pub fn len(&self) -> usize {
		self.times.len()
	}

	pub fn is_empty(&self) -> bool {
		self.times.is_empty()
	}

	/// The integration end point.
	pub fn t1(&self) -> f64 {
		self.times.last().copied().unwrap_or(0.0)
	}
}

impl Default for TimeSchedule {
	fn default() -> Self {
		Self { times: vec![0.0, 1.0] }
	}
}

/// Parses `"1"` or a comma separated list such as `"0.1,0.2,0.3,1"`.
impl FromStr for TimeSchedule {
	type Err = ErrPack<ConfigError>;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let values = s
			.split(',')
			.map(|item| {
				let item = item.trim();
				item.parse::<f64>()
					.map_err(|_| invalid(format!("cannot parse time value '{item}'")))
			})
			.collect::<Result<Vec<_>, _>>()?;
		match values.as_slice() {
			[v] => Self::new(*v),
			_ => Self::new(values),
		}
	}
}

impl fmt::Display for TimeSchedule {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{:?}", self.times)
	}
}

//--------------------------------------------------------------------------------------------------

#[cold]
#[inline(never)]
fn invalid(message: String) -> ErrPack<ConfigError> {
	ErrPack::with_message(ConfigError::InvalidTimeSchedule, message)
}

fn tensor_values(t: &Tensor) -> Result<Vec<f64>, ErrPack<ConfigError>> {
	match t.kind() {
		Kind::Float
		| Kind::Double
		| Kind::Half
		| Kind::BFloat16
		| Kind::Int
		| Kind::Int64
		| Kind::Int16
		| Kind::Int8
		| Kind::Uint8 => {},
		kind => {
			return Err(invalid(format!(
				"argument must be a scalar, a sequence, or a numeric tensor, got a {kind:?} tensor"
			)));
		},
	}
	if t.dim() > 1 {
		return Err(invalid(format!(
			"argument must be a scalar, a sequence, or a 0-d/1-d tensor, got shape {:?}",
			t.size()
		)));
	}
	let flat = t
		.f_to_kind(Kind::Double)
		.and_then(|t| t.f_reshape([-1]))
		.map_err(|e| invalid(format!("cannot read horizon tensor: {e}")))?;
	Vec::<f64>::try_from(&flat).map_err(|e| invalid(format!("cannot read horizon tensor: {e}")))
}
