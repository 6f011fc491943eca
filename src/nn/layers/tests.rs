//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use tch::{Device, Kind, Tensor};

use super::*;
use crate::config::{DownsampleKind, NetworkConfig, Ode2Continuation};
use crate::nn::{EvalContext, Init, ModelContext};
use crate::ode::{Method, OutputMode, TimeSchedule};
use crate::tensor::{self, TensorOpError};

//--------------------------------------------------------------------------------------------------

fn names(module: &dyn Module, prefix: &str) -> Vec<String> {
	module.named_params(prefix).into_iter().map(|(name, _)| name).collect()
}

fn small_config(downsample: DownsampleKind) -> NetworkConfig {
	let mut config = NetworkConfig::new(3);
	config.n_filters = 32;
	config.downsample = downsample;
	config
}

#[test]
fn test_downsample_channels() {
	tch::manual_seed(1);
	let x = Tensor::rand([2, 3, 28, 28], (Kind::Float, Device::Cpu));
	for kind in DownsampleKind::ALL {
		let mut ctx = ModelContext::default();
		let downsample = Downsample::new(&mut ctx, &small_config(kind)).unwrap();
		assert_eq!(downsample.kind(), kind);
		let out = downsample.forward(&x, &mut EvalContext::new(false)).unwrap();
		let DownsampleOutput::Single(y) = out else {
			panic!("{kind} returned a trajectory in final-state mode");
		};
		assert_eq!(y.size()[..2], [2, 32], "{kind}");
		assert_eq!(downsample.odeblock().is_some(), kind.uses_ode());
	}
}

#[test]
fn test_downsample_param_names() {
	let mut ctx = ModelContext::default();
	let residual = Downsample::new(&mut ctx, &small_config(DownsampleKind::Residual)).unwrap();
	let n = names(&residual, "downsample");
	assert!(n.contains(&"downsample.module.0.bias".to_string()));
	assert!(n.contains(&"downsample.module.1.downsample.weight".to_string()));
	assert!(n.contains(&"downsample.module.2.conv2.weight".to_string()));

	let conv = Downsample::new(&mut ctx, &small_config(DownsampleKind::Minimal)).unwrap();
	assert_eq!(
		names(&conv, ""),
		[
			"module.0.weight",
			"module.0.bias",
			"module.1.weight",
			"module.1.bias",
			"module.3.weight",
			"module.3.bias",
			"module.4.weight",
			"module.4.bias",
			"module.6.weight",
			"module.6.bias",
		]
	);

	let one_shot = Downsample::new(&mut ctx, &small_config(DownsampleKind::OneShot)).unwrap();
	assert_eq!(names(&one_shot, ""), ["module.weight", "module.bias"]);

	let ode2 = Downsample::new(&mut ctx, &small_config(DownsampleKind::Ode2)).unwrap();
	let n = names(&ode2, "");
	assert!(n.contains(&"conv1.weight".to_string()));
	assert!(n.contains(&"odeblock.odefunc.conv1._layer.weight".to_string()));
	assert!(n.contains(&"odeblock.odefunc.norm3.bias".to_string()));
	assert!(n.contains(&"norm.0.weight".to_string()));
	assert!(n.contains(&"conv2.bias".to_string()));
}

#[test]
fn test_ode2_continuation() {
	tch::manual_seed(2);
	let x = Tensor::rand([2, 3, 16, 16], (Kind::Float, Device::Cpu));
	let mut config = small_config(DownsampleKind::Ode2);
	config.t1 = TimeSchedule::new([0.5, 1.0]).unwrap();
	config.output = OutputMode::Trajectory;

	for (continuation, traj_hw) in [(Ode2Continuation::LastOnly, 8), (Ode2Continuation::EveryStep, 4)] {
		config.ode2_continuation = continuation;
		let mut ctx = ModelContext::default();
		let downsample = Downsample::new(&mut ctx, &config).unwrap();
		let out = downsample.forward(&x, &mut EvalContext::new(false)).unwrap();
		let DownsampleOutput::WithAuxiliary { trajectory, continuation } = out else {
			panic!("expected a trajectory");
		};
		assert_eq!(trajectory.size(), [3, 2, 32, traj_hw, traj_hw]);
		assert_eq!(continuation.size(), [2, 32, 4, 4]);
	}
}

#[test]
fn test_ode_downsample_trajectory() {
	tch::manual_seed(3);
	let x = Tensor::rand([2, 3, 16, 16], (Kind::Float, Device::Cpu));
	let mut config = small_config(DownsampleKind::Ode);
	config.t1 = TimeSchedule::new([0.1, 0.2, 1.0]).unwrap();
	config.output = OutputMode::Trajectory;
	let mut ctx = ModelContext::default();
	let downsample = Downsample::new(&mut ctx, &config).unwrap();
	let out = downsample.forward(&x, &mut EvalContext::new(false)).unwrap();
	let DownsampleOutput::WithAuxiliary { trajectory, continuation } = out else {
		panic!("expected a trajectory");
	};
	assert_eq!(trajectory.size(), [4, 2, 32, 8, 8]);
	assert_eq!(continuation.size(), [2, 32, 4, 4]);
}

//--------------------------------------------------------------------------------------------------

#[test]
fn test_classifier_head() {
	tch::manual_seed(4);
	let x = Tensor::rand([5, 32, 4, 4], (Kind::Float, Device::Cpu));
	let mut ctx = ModelContext::default();

	let mut head = ClassifierHead::new(&mut ctx, 32, 10, 0.0).unwrap();
	assert_eq!(
		names(&head, "classifier"),
		[
			"classifier.module.0.weight",
			"classifier.module.0.bias",
			"classifier.module.4.weight",
			"classifier.module.4.bias",
		]
	);
	let y = head.forward(&x, &mut EvalContext::new(false)).unwrap();
	assert_eq!(y.size(), [5, 10]);

	head.remove_linear();
	assert!(!head.has_linear());
	assert_eq!(names(&head, ""), ["module.0.weight", "module.0.bias"]);
	let y = head.forward(&x, &mut EvalContext::new(false)).unwrap();
	assert_eq!(y.size(), [5, 32]);

	let head = ClassifierHead::new(&mut ctx, 32, 10, 0.5).unwrap();
	assert!(names(&head, "").contains(&"module.5.weight".to_string()));
	let eval = head.forward(&x, &mut EvalContext::new(false)).unwrap();
	let eval_again = head.forward(&x, &mut EvalContext::new(false)).unwrap();
	assert!(eval.allclose(&eval_again, 1e-6, 1e-6, false));
}

#[test]
fn test_global_avg_pool() {
	let x = Tensor::arange(8, (Kind::Float, Device::Cpu)).reshape([1, 2, 2, 2]);
	let y = global_avg_pool(&x).unwrap();
	assert_eq!(y.size(), [1, 2]);
	assert_eq!(Vec::<f32>::try_from(&y.reshape([-1])).unwrap(), [1.5, 5.5]);
}

#[test]
fn test_res_block() {
	let mut ctx = ModelContext::default();
	let x = Tensor::rand([2, 16, 8, 8], (Kind::Float, Device::Cpu));

	let block = ResBlock::new(&mut ctx, 16, 16, 1).unwrap();
	assert_eq!(block.forward(&x, &mut EvalContext::new(false)).unwrap().size(), [2, 16, 8, 8]);
	assert!(!names(&block, "").iter().any(|n| n.starts_with("downsample")));

	let block = ResBlock::new_downsampling(&mut ctx, 16, 32, 2).unwrap();
	assert_eq!(block.forward(&x, &mut EvalContext::new(false)).unwrap().size(), [2, 32, 4, 4]);
	assert!(names(&block, "").contains(&"downsample.weight".to_string()));
}

#[test]
fn test_concat_conv() {
	let mut ctx = ModelContext::default();
	let conv = ConcatConv2d::new(&mut ctx, 4).unwrap();
	let params = conv.named_params("conv1");
	assert_eq!(params[0].0, "conv1._layer.weight");
	assert_eq!(params[0].1.borrow().shape(), [4, 5, 3, 3]);
	assert_eq!(params[1].0, "conv1._layer.bias");

	let x = Tensor::rand([3, 4, 5, 5], (Kind::Float, Device::Cpu));
	let y0 = conv.apply(0.0, &x).unwrap();
	let y1 = conv.apply(1.0, &x).unwrap();
	assert_eq!(y0.size(), [3, 4, 5, 5]);
	assert!(!y0.allclose(&y1, 1e-6, 1e-6, false));
}

#[test]
fn test_group_norm_groups() {
	let mut ctx = ModelContext::default();
	assert!(norm(&mut ctx, 24).is_ok());
	assert!(norm(&mut ctx, 64).is_ok());
	let err = norm(&mut ctx, 48).err().unwrap();
	assert_eq!(err.code, TensorOpError::InvalidShape);
}

#[test]
fn test_param_assign_and_randomize() {
	let mut ctx = ModelContext::default();
	let p = ctx.new_param(&[2, 3], Init::Const(1.0)).unwrap();
	assert!(p.borrow().value().requires_grad());
	assert_eq!(ctx.numel(), 6);

	let src = Tensor::zeros([2, 3], (Kind::Double, Device::Cpu));
	p.borrow_mut().assign(&src).unwrap();
	assert_eq!(p.borrow().kind(), Kind::Float);
	assert_eq!(tensor::max_abs(p.borrow().value()).unwrap(), 0.0);

	let err = p.borrow_mut().assign(&Tensor::zeros([3, 2], (Kind::Float, Device::Cpu))).unwrap_err();
	assert_eq!(err.code, TensorOpError::ShapeMismatch);

	p.borrow_mut().randomize().unwrap();
	assert_eq!(tensor::max_abs(&(p.borrow().value() - 1.0)).unwrap(), 0.0);
}

//--------------------------------------------------------------------------------------------------

fn ode_block(ctx: &mut ModelContext, schedule: TimeSchedule, adjoint: bool) -> OdeBlock {
	OdeBlock::new(ctx, 4, schedule, Method::Dopri5, 1e-9, adjoint).unwrap()
}

#[test]
fn test_ode_block_shapes_and_nfe() {
	tch::manual_seed(5);
	let mut ctx = ModelContext::default();
	let schedule = TimeSchedule::new([0.5, 1.0]).unwrap();
	let mut block = OdeBlock::new(&mut ctx, 4, schedule, Method::Dopri5, 1e-3, false).unwrap();
	assert_eq!(block.nfe(), 0);

	let x = Tensor::rand([2, 4, 6, 6], (Kind::Float, Device::Cpu));
	let out = block.forward(&x, &mut EvalContext::new(false)).unwrap();
	let OdeOutput::Final(y) = out else {
		panic!("expected the final state");
	};
	assert_eq!(y.size(), x.size());
	let nfe = block.nfe();
	assert!(nfe > 0);

	block.reset_nfe();
	assert_eq!(block.nfe(), 0);

	block.set_output(OutputMode::Trajectory);
	let out = block.forward(&x, &mut EvalContext::new(false)).unwrap();
	let last = out.last().unwrap();
	let OdeOutput::Trajectory(ys) = out else {
		panic!("expected a trajectory");
	};
	assert_eq!(ys.size(), [3, 2, 4, 6, 6]);
	assert!(ys.get(0).allclose(&x, 1e-6, 1e-6, false));
	assert!(last.allclose(&y, 1e-5, 1e-5, false));
	assert_eq!(block.nfe(), nfe);
}

#[test]
fn test_adjoint_eval_mode_records_nothing() {
	let mut ctx = ModelContext::default();
	let block = ode_block(&mut ctx, TimeSchedule::default(), true);
	let x = Tensor::rand([1, 4, 4, 4], (Kind::Float, Device::Cpu));
	let mut eval = EvalContext::new(false);
	let y = block.forward(&x, &mut eval).unwrap().into_tensor();
	assert!(!y.requires_grad());
	assert!(eval.tape.is_empty());

	let mut train = EvalContext::new(true);
	let y = block.forward(&x, &mut train).unwrap().into_tensor();
	assert!(y.requires_grad());
	assert_eq!(train.tape.len(), 1);
}

/// Gradients of `sum(w * block(x))` with respect to `x` and every parameter.
fn gradients(block: &OdeBlock, x: &Tensor, w: &Tensor, ctx: &ModelContext) -> Vec<Tensor> {
	ctx.zero_grad();
	let x = x.detach().set_requires_grad(true);
	let mut eval = EvalContext::new(true);
	let y = block.forward(&x, &mut eval).unwrap().into_tensor();
	let loss = (y * w).sum(Kind::Double);
	loss.backward();
	eval.backward_adjoint().unwrap();
	assert!(eval.tape.is_empty());

	let mut grads = vec![x.grad()];
	grads.extend(block.params().iter().map(|p| p.borrow().grad().unwrap()));
	grads
}

fn check_adjoint_matches_direct(schedule: TimeSchedule, output: OutputMode) {
	tch::manual_seed(6);
	let mut ctx = ModelContext::new(Kind::Double, Device::Cpu);
	let mut direct = ode_block(&mut ctx, schedule.clone(), false);
	let mut adjoint = ode_block(&mut ctx, schedule, true);
	direct.set_output(output);
	adjoint.set_output(output);
	for (src, dst) in direct.params().iter().zip(adjoint.params()) {
		dst.borrow_mut().assign(src.borrow().value()).unwrap();
	}

	let x = Tensor::rand([2, 4, 5, 5], (Kind::Double, Device::Cpu));
	let shape = direct.forward(&x, &mut EvalContext::new(false)).unwrap().into_tensor().size();
	let w = Tensor::rand(shape.as_slice(), (Kind::Double, Device::Cpu));

	let expected = gradients(&direct, &x, &w, &ctx);
	let actual = gradients(&adjoint, &x, &w, &ctx);
	assert_eq!(expected.len(), actual.len());
	for (e, a) in expected.iter().zip(&actual) {
		let scale = 1.0 + tensor::max_abs(e).unwrap();
		let diff = tensor::max_abs(&(e - a)).unwrap();
		assert!(diff < 1e-5 * scale, "adjoint gradient differs by {diff} (scale {scale})");
	}
	assert!(adjoint.nfe_backward() > 0);
	assert_eq!(direct.nfe_backward(), 0);
}

#[test]
fn test_adjoint_matches_direct_final() {
	check_adjoint_matches_direct(TimeSchedule::default(), OutputMode::Final);
}

#[test]
fn test_adjoint_matches_direct_trajectory() {
	let schedule = TimeSchedule::new([0.3, 0.6, 1.0]).unwrap();
	check_adjoint_matches_direct(schedule, OutputMode::Trajectory);
}
