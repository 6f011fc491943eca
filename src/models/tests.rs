//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use tch::{Device, Kind, Tensor};

use super::*;
use crate::config::{DownsampleKind, Ode2Continuation};
use crate::nn::{EvalContext, ModelContext};
use crate::ode::TimeSchedule;

//--------------------------------------------------------------------------------------------------

fn input(batch: i64, size: i64) -> Tensor {
	Tensor::rand([batch, 3, size, size], (Kind::Float, Device::Cpu))
}

fn ode_config() -> NetworkConfig {
	let mut config = NetworkConfig::new(3);
	config.downsample = DownsampleKind::Ode;
	config.t1 = TimeSchedule::new([0.1, 0.2, 0.3, 1.0]).unwrap();
	config
}

#[test]
fn test_odenet_classifier() {
	tch::manual_seed(10);
	let mut ctx = ModelContext::default();
	let net = OdeNet::new(&mut ctx, &ode_config()).unwrap();
	assert_eq!(net.nfe(false), 0);

	let y = net.forward(&input(7, 32), &mut EvalContext::new(false)).unwrap();
	assert_eq!(y.size(), [7, 10]);

	let nfe = net.nfe(true);
	assert!(nfe > 0);
	assert_eq!(net.nfe(false), 0);
	net.forward(&input(7, 32), &mut EvalContext::new(false)).unwrap();
	assert!(net.nfe(false) > 0);
}

#[test]
fn test_odenet_feature_extractor() {
	tch::manual_seed(11);
	let mut ctx = ModelContext::default();
	let net = OdeNet::new(&mut ctx, &ode_config()).unwrap().into_feature_extractor();
	assert!(net.is_feature_extractor());
	assert!(!net.named_params("").iter().any(|(name, _)| name.starts_with("classifier.module.4")));

	let y = net.forward(&input(7, 32), &mut EvalContext::new(false)).unwrap();
	assert_eq!(y.size(), [5 + 5, 7, 64]);

	// the construction flag does the same
	let mut config = ode_config();
	config.features_extractor = true;
	let net = OdeNet::new(&mut ctx, &config).unwrap();
	assert!(net.is_feature_extractor());
	let y = net.forward(&input(7, 32), &mut EvalContext::new(false)).unwrap();
	assert_eq!(y.size(), [10, 7, 64]);
}

#[test]
fn test_odenet_feature_extractor_without_ode_downsample() {
	tch::manual_seed(12);
	let mut config = NetworkConfig::new(3);
	config.downsample = DownsampleKind::OneShot;
	config.n_filters = 32;
	config.t1 = TimeSchedule::new([0.5, 1.0]).unwrap();
	config.features_extractor = true;
	let net = OdeNet::new(&mut ModelContext::default(), &config).unwrap();
	let y = net.forward(&input(2, 16), &mut EvalContext::new(false)).unwrap();
	assert_eq!(y.size(), [3, 2, 32]);
}

#[test]
fn test_odenet_ode2_trajectory_classification() {
	tch::manual_seed(13);
	let mut config = NetworkConfig::new(3);
	config.downsample = DownsampleKind::Ode2;
	config.n_filters = 32;
	config.out = 5;
	config.t1 = TimeSchedule::new([0.5, 1.0]).unwrap();
	config.output = OutputMode::Trajectory;
	for continuation in [Ode2Continuation::LastOnly, Ode2Continuation::EveryStep] {
		config.ode2_continuation = continuation;
		let net = OdeNet::new(&mut ModelContext::default(), &config).unwrap();
		let y = net.forward(&input(2, 16), &mut EvalContext::new(false)).unwrap();
		assert_eq!(y.size(), [3 + 3, 2, 5]);
	}
}

#[test]
fn test_odenet_param_names() {
	let mut config = ode_config();
	config.dropout = 0.25;
	let net = OdeNet::new(&mut ModelContext::default(), &config).unwrap();
	let names: Vec<String> = net.named_params("").into_iter().map(|(name, _)| name).collect();
	for expected in [
		"downsample.conv1.weight",
		"downsample.odeblock.odefunc.norm1.weight",
		"odeblock.odefunc.conv2._layer.bias",
		"classifier.module.0.weight",
		"classifier.module.5.weight",
	] {
		assert!(names.iter().any(|n| n == expected), "missing {expected}");
	}
}

#[test]
fn test_odenet_invalid_config() {
	let mut config = ode_config();
	config.tol = -1.0;
	let err = OdeNet::new(&mut ModelContext::default(), &config).err().unwrap();
	assert_eq!(err.code, ModelError::Config);
}

#[test]
fn test_odenet_adjoint_training_step() {
	tch::manual_seed(14);
	let mut config = NetworkConfig::new(3);
	config.downsample = DownsampleKind::OneShot;
	config.n_filters = 32;
	config.adjoint = true;
	let mut ctx = ModelContext::default();
	let net = OdeNet::new(&mut ctx, &config).unwrap();

	let mut eval = EvalContext::new(true);
	let y = net.forward(&input(2, 16), &mut eval).unwrap();
	assert_eq!(eval.tape.len(), 1);
	y.sum(Kind::Float).backward();
	eval.backward_adjoint().unwrap();
	for (name, param) in net.named_params("") {
		assert!(param.borrow().grad().is_some(), "{name} has no gradient");
	}
	assert!(net.odeblock().nfe_backward() > 0);
}

fn adjoint_trajectory_step(downsample: DownsampleKind, continuation: Ode2Continuation) {
	let mut config = NetworkConfig::new(3);
	config.downsample = downsample;
	config.ode2_continuation = continuation;
	config.n_filters = 32;
	config.adjoint = true;
	config.output = OutputMode::Trajectory;
	config.t1 = TimeSchedule::new([0.5, 1.0]).unwrap();
	let mut ctx = ModelContext::default();
	let net = OdeNet::new(&mut ctx, &config).unwrap();

	let mut eval = EvalContext::new(true);
	let y = net.forward(&input(2, 16), &mut eval).unwrap();
	assert_eq!(y.size(), [6, 2, 10]);
	assert_eq!(eval.tape.len(), 2);
	y.sum(Kind::Float).backward();
	eval.backward_adjoint().unwrap();
	assert!(eval.tape.is_empty());

	for (name, param) in net.named_params("") {
		assert!(param.borrow().grad().is_some(), "{downsample} {name} has no gradient");
	}
	let block = net.downsample().odeblock().unwrap();
	assert!(block.nfe_backward() > 0);
	assert!(net.odeblock().nfe_backward() > 0);
}

#[test]
fn test_adjoint_training_through_ode_downsample() {
	tch::manual_seed(16);
	adjoint_trajectory_step(DownsampleKind::Ode, Ode2Continuation::LastOnly);
}

#[test]
fn test_adjoint_training_through_ode2_downsample() {
	tch::manual_seed(17);
	adjoint_trajectory_step(DownsampleKind::Ode2, Ode2Continuation::LastOnly);
	adjoint_trajectory_step(DownsampleKind::Ode2, Ode2Continuation::EveryStep);
}

//--------------------------------------------------------------------------------------------------

#[test]
fn test_resnet() {
	tch::manual_seed(15);
	let mut config = NetworkConfig::new(3);
	config.n_filters = 32;
	let mut ctx = ModelContext::default();
	let net = ResNet::new(&mut ctx, &config).unwrap();
	let names: Vec<String> = net.named_params("").into_iter().map(|(name, _)| name).collect();
	assert!(names.iter().any(|n| n == "features.5.conv2.weight"));
	assert!(names.iter().any(|n| n == "downsample.module.2.downsample.weight"));

	let y = net.forward(&input(2, 28), &mut EvalContext::new(false)).unwrap();
	assert_eq!(y.size(), [2, 10]);
	assert_eq!(net.nfe(true), 0);

	let net = net.into_feature_extractor();
	let y = net.forward(&input(2, 28), &mut EvalContext::new(false)).unwrap();
	assert_eq!(y.size(), [2, 32]);
}

#[test]
fn test_resnet_rejects_ode_downsample() {
	for downsample in [DownsampleKind::Ode, DownsampleKind::Ode2] {
		let mut config = NetworkConfig::new(3);
		config.downsample = downsample;
		let err = ResNet::new(&mut ModelContext::default(), &config).err().unwrap();
		assert_eq!(err.code, ModelError::Config);
		assert!(err.message().contains(downsample.name()));
	}
}

#[test]
fn test_network_dispatch() {
	let mut config = NetworkConfig::new(1);
	config.downsample = DownsampleKind::Minimal;
	config.n_filters = 32;
	let mut ctx = ModelContext::default();
	for kind in [ModelKind::OdeNet, ModelKind::ResNet] {
		let net = Network::new(&mut ctx, kind, &config).unwrap();
		assert_eq!(net.kind(), kind);
		let x = Tensor::rand([2, 1, 28, 28], (Kind::Float, Device::Cpu));
		let y = net.forward(&x, &mut EvalContext::new(false)).unwrap();
		assert_eq!(y.size(), [2, 10]);
	}
}
