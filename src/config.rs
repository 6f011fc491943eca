//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::fmt;
use std::str::FromStr;

use tch::{Device, Kind};

use crate::ErrPack;
use crate::ode::{Method, OutputMode, TimeSchedule};

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
	InvalidTimeSchedule,
	UnknownDownsample,
	UnknownMethod,
	UnknownModel,
	UnknownContinuation,
	InvalidTolerance,
	InvalidDropout,
	InvalidSize,
	UnsupportedDownsample,
}

//--------------------------------------------------------------------------------------------------

/// Strategy used to bring the input image down to a `n_filters` wide feature map.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DownsampleKind {
	Residual,
	Convolution,
	Minimal,
	OneShot,
	Ode,
	Ode2,
}

impl DownsampleKind {
	pub const ALL: [Self; 6] = [
		Self::Residual,
		Self::Convolution,
		Self::Minimal,
		Self::OneShot,
		Self::Ode,
		Self::Ode2,
	];

	pub fn name(self) -> &'static str {
		match self {
			Self::Residual => "residual",
			Self::Convolution => "convolution",
			Self::Minimal => "minimal",
			Self::OneShot => "one-shot",
			Self::Ode => "ode",
			Self::Ode2 => "ode2",
		}
	}

	pub fn uses_ode(self) -> bool {
		matches!(self, Self::Ode | Self::Ode2)
	}
}

impl FromStr for DownsampleKind {
	type Err = ErrPack<ConfigError>;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::ALL.into_iter().find(|kind| kind.name() == s).ok_or_else(|| {
			ErrPack::with_message(
				ConfigError::UnknownDownsample,
				format!("unknown downsample strategy '{s}'"),
			)
		})
	}
}

impl fmt::Display for DownsampleKind {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.name())
	}
}

//--------------------------------------------------------------------------------------------------

/// What the second ODE downsample hands to the next stage when it returns
/// the whole trajectory.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Ode2Continuation {
	/// Only the last trajectory entry is convolved; the trajectory keeps the
	/// resolution of the ODE block.
	#[default]
	LastOnly,

	/// Every trajectory entry is convolved; the continuation is the last one.
	EveryStep,
}

impl FromStr for Ode2Continuation {
	type Err = ErrPack<ConfigError>;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"last" => Ok(Self::LastOnly),
			"every" => Ok(Self::EveryStep),
			_ => Err(ErrPack::with_message(
				ConfigError::UnknownContinuation,
				format!("unknown continuation policy '{s}', expected 'last' or 'every'"),
			)),
		}
	}
}

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ModelKind {
	OdeNet,
	ResNet,
}

impl FromStr for ModelKind {
	type Err = ErrPack<ConfigError>;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"odenet" => Ok(Self::OdeNet),
			"resnet" => Ok(Self::ResNet),
			_ => Err(ErrPack::with_message(
				ConfigError::UnknownModel,
				format!("unknown model '{s}', expected 'odenet' or 'resnet'"),
			)),
		}
	}
}

//--------------------------------------------------------------------------------------------------

/// Construction parameters shared by `OdeNet` and `ResNet`.
///
/// `ResNet` ignores the ODE related fields.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
	pub in_ch: i64,
	pub out: i64,
	pub n_filters: i64,
	pub downsample: DownsampleKind,
	pub method: Method,

	/// Shared relative and absolute tolerance.
	pub tol: f64,
	pub adjoint: bool,
	pub t1: TimeSchedule,
	pub dropout: f64,
	pub ode2_continuation: Ode2Continuation,
	pub output: OutputMode,

	/// Build the network without the final linear layer.
	pub features_extractor: bool,

	pub kind: Kind,
	pub device: Device,
}

impl NetworkConfig {
	pub fn new(in_ch: i64) -> Self {
		Self {
			in_ch,
			out: 10,
			n_filters: 64,
			downsample: DownsampleKind::Residual,
			method: Method::Dopri5,
			tol: 1e-3,
			adjoint: false,
			t1: TimeSchedule::default(),
			dropout: 0.0,
			ode2_continuation: Ode2Continuation::LastOnly,
			output: OutputMode::Final,
			features_extractor: false,
			kind: Kind::Float,
			device: Device::Cpu,
		}
	}

	pub fn validate(&self) -> Result<(), ErrPack<ConfigError>> {
		if self.in_ch <= 0 || self.out <= 0 || self.n_filters <= 0 {
			return Err(ErrPack::with_message(
				ConfigError::InvalidSize,
				format!(
					"channel and class counts must be positive (in_ch={}, out={}, n_filters={})",
					self.in_ch, self.out, self.n_filters
				),
			));
		}
		if !(self.tol.is_finite() && self.tol > 0.0) {
			return Err(ErrPack::with_message(
				ConfigError::InvalidTolerance,
				format!("tolerance must be positive and finite, got {}", self.tol),
			));
		}
		if !(0.0..1.0).contains(&self.dropout) {
			return Err(ErrPack::with_message(
				ConfigError::InvalidDropout,
				format!("dropout must be in [0, 1), got {}", self.dropout),
			));
		}
		Ok(())
	}
}

//--------------------------------------------------------------------------------------------------
