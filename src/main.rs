//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tch::{Device, Kind, Tensor};

use odenet::checkpoint;
use odenet::config::{DownsampleKind, ModelKind, NetworkConfig, Ode2Continuation};
use odenet::data::{self, Augmentation, DatasetId};
use odenet::models::{Model, Network};
use odenet::nn::{EvalContext, ModelContext};
use odenet::nn::layers::Module;
use odenet::ode::{Method, OutputMode, TimeSchedule};

/// Builds an ODE network or ResNet, optionally loads weights, and runs it on
/// random input or on a dataset's test split.
#[derive(Parser, Debug)]
#[command(name = "odenet", version, about)]
struct Cli {
	/// odenet | resnet
	#[arg(long, default_value = "odenet")]
	model: ModelKind,

	/// Evaluate on this dataset (mnist | cifar10) instead of random input
	#[arg(long)]
	dataset: Option<DatasetId>,

	/// Directory holding `mnist/` and `cifar10/`
	#[arg(long, default_value = "data")]
	data_root: PathBuf,

	/// none | crop | crop+flip+norm | crop+jitter+flip+norm
	#[arg(long, default_value = "none")]
	augmentation: Augmentation,

	/// Input channels, when no dataset is given
	#[arg(long, default_value_t = 3)]
	in_ch: i64,

	#[arg(long, default_value_t = 10)]
	classes: i64,

	#[arg(long, default_value_t = 64)]
	filters: i64,

	/// residual | convolution | minimal | one-shot | ode | ode2
	#[arg(long, default_value = "residual")]
	downsample: DownsampleKind,

	/// dopri5 | bosh3 | adaptive_heun | euler | midpoint | rk4
	#[arg(long, default_value = "dopri5")]
	method: Method,

	#[arg(long, default_value_t = 1e-3)]
	tol: f64,

	#[arg(long)]
	adjoint: bool,

	/// Final time, or a comma separated list of output times
	#[arg(long, default_value = "1")]
	t1: TimeSchedule,

	#[arg(long, default_value_t = 0.0)]
	dropout: f64,

	/// last | every
	#[arg(long, default_value = "last")]
	ode2_continuation: Ode2Continuation,

	/// Report every output time instead of the final state
	#[arg(long)]
	trajectory: bool,

	/// Drop the final linear layer and return pooled features
	#[arg(long)]
	features: bool,

	/// Load weights from this safetensors file
	#[arg(long)]
	checkpoint: Option<PathBuf>,

	/// Save weights to this safetensors file
	#[arg(long)]
	save: Option<PathBuf>,

	#[arg(long, default_value_t = 8)]
	batch: i64,

	/// Spatial size of random input
	#[arg(long, default_value_t = 32)]
	size: i64,

	/// Stop dataset evaluation after this many batches
	#[arg(long)]
	batches: Option<usize>,

	#[arg(long, default_value_t = 0)]
	seed: i64,

	/// Log more (-v, -vv, ...)
	#[arg(short, long, action = clap::ArgAction::Count)]
	verbose: u8,
}

impl Cli {
	fn network_config(&self) -> NetworkConfig {
		let in_ch = self.dataset.map_or(self.in_ch, DatasetId::in_channels);
		NetworkConfig {
			out: self.classes,
			n_filters: self.filters,
			downsample: self.downsample,
			method: self.method,
			tol: self.tol,
			adjoint: self.adjoint,
			t1: self.t1.clone(),
			dropout: self.dropout,
			ode2_continuation: self.ode2_continuation,
			output: if self.trajectory { OutputMode::Trajectory } else { OutputMode::Final },
			features_extractor: self.features,
			..NetworkConfig::new(in_ch)
		}
	}
}

fn build(cli: &Cli, config: &NetworkConfig) -> Result<Network> {
	if let Some(path) = &cli.checkpoint {
		let net = checkpoint::load_model(cli.model, config, path)
			.with_context(|| format!("loading {}", path.display()))?;
		return Ok(net);
	}
	let mut ctx = ModelContext::new(config.kind, config.device);
	let net = Network::new(&mut ctx, cli.model, config)?;
	log::info!("{} parameters", ctx.numel());
	Ok(net)
}

/// Class predictions of the last reported timestep.
fn predictions(out: &Tensor) -> Result<Tensor> {
	let last = if out.dim() == 3 { out.f_select(0, -1)? } else { out.shallow_clone() };
	Ok(last.f_argmax(-1, false)?)
}

fn count_correct(out: &Tensor, labels: &Tensor) -> Result<i64> {
	let hits = predictions(out)?.f_eq_tensor(labels)?.f_sum(Kind::Int64)?;
	Ok(hits.f_int64_value(&[])?)
}

fn evaluate(cli: &Cli, net: &Network, dataset: DatasetId) -> Result<()> {
	let split = data::load_test_split(&cli.data_root, dataset, cli.augmentation)?;
	let limit = cli.batches.unwrap_or(usize::MAX);
	let mut ctx = EvalContext::new(false);
	let (mut correct, mut total, mut nfe, mut steps) = (0_i64, 0_i64, 0_usize, 0_usize);
	for batch in split.batches(cli.batch, false).take(limit) {
		let (images, labels) = batch?;
		let out = tch::no_grad(|| net.forward(&images, &mut ctx))?;
		nfe += net.nfe(true);
		steps += 1;
		if !net.is_feature_extractor() {
			correct += count_correct(&out, &labels)?;
		}
		total += labels.size().first().copied().unwrap_or(0);
	}
	if net.is_feature_extractor() {
		println!("extracted features for {total} images");
	} else {
		let accuracy = if total > 0 { correct as f64 / total as f64 } else { 0.0 };
		println!("accuracy {accuracy:.4} ({correct}/{total})");
	}
	if steps > 0 {
		println!("mean nfe per batch {:.1}", nfe as f64 / steps as f64);
	}
	Ok(())
}

fn main() -> Result<()> {
	let cli = Cli::parse();
	stderrlog::new()
		.module("odenet")
		.verbosity(usize::from(cli.verbose) + 2)
		.init()?;
	tch::manual_seed(cli.seed);

	let config = cli.network_config();
	let net = build(&cli, &config)?;

	if let Some(dataset) = cli.dataset {
		evaluate(&cli, &net, dataset)?;
	} else {
		let x = Tensor::f_randn([cli.batch, config.in_ch, cli.size, cli.size], (Kind::Float, Device::Cpu))?;
		let mut ctx = EvalContext::new(false);
		let out = tch::no_grad(|| net.forward(&x, &mut ctx))?;
		println!("output {:?}, nfe {}", out.size(), net.nfe(true));
	}

	if let Some(path) = &cli.save {
		checkpoint::save(&net, path).with_context(|| format!("saving {}", path.display()))?;
		println!("saved {} tensors to {}", net.named_params("").len(), path.display());
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_count_correct() {
		let labels = Tensor::from_slice(&[0_i64, 2, 1]);
		let logits = Tensor::from_slice(&[5.0_f32, 1.0, 0.0, 0.0, 1.0, 3.0, 2.0, 1.0, 0.0]).view([3, 3]);
		assert_eq!(count_correct(&logits, &labels).unwrap(), 2);

		// a trajectory is judged by its last timestep
		let trajectory = Tensor::stack(&[logits.zeros_like(), logits.shallow_clone()], 0);
		assert_eq!(count_correct(&trajectory, &labels).unwrap(), 2);

		let mismatched = Tensor::from_slice(&[0_i64, 1]);
		assert!(count_correct(&logits, &mismatched).is_err());
	}
}
