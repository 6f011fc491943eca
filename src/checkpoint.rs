//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Named-parameter checkpoints stored as safetensors.
//!
//! Loading is strict: every parameter of the model must be present with the
//! right shape, and the file must not contain anything else. Nothing is
//! overwritten unless the whole checkpoint matches.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use tch::{Kind, Tensor};

use crate::models::{ModelError, ModelKind, NetworkConfig, Network};
use crate::nn::ModelContext;
use crate::nn::layers::Module;
use crate::tensor::TensorOpError;
use crate::{ErrExtra, ErrPack};

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CheckpointError {
	Io,

	/// The file is not a valid safetensors file.
	Format,

	MissingParam,
	UnexpectedParam,
	ShapeMismatch,
	UnsupportedDType,

	/// A tensor operation failed while reading or writing values.
	Torch,

	/// The network to load into could not be built.
	Model,
}

impl From<ErrPack<TensorOpError>> for ErrPack<CheckpointError> {
	#[cold]
	#[inline(never)]
	fn from(err: ErrPack<TensorOpError>) -> Self {
		nested(CheckpointError::Torch, err)
	}
}

impl From<tch::TchError> for ErrPack<CheckpointError> {
	#[cold]
	#[inline(never)]
	fn from(err: tch::TchError) -> Self {
		nested(CheckpointError::Torch, err)
	}
}

impl From<ErrPack<ModelError>> for ErrPack<CheckpointError> {
	#[cold]
	#[inline(never)]
	fn from(err: ErrPack<ModelError>) -> Self {
		nested(CheckpointError::Model, err)
	}
}

impl From<safetensors::SafeTensorError> for ErrPack<CheckpointError> {
	#[cold]
	#[inline(never)]
	fn from(err: safetensors::SafeTensorError) -> Self {
		nested(CheckpointError::Format, err)
	}
}

fn nested(
	code: CheckpointError,
	err: impl std::error::Error + Send + Sync + 'static,
) -> ErrPack<CheckpointError> {
	ErrPack {
		code,
		extra: Some(Box::new(ErrExtra { message: err.to_string().into(), nested: Some(Box::new(err)) })),
	}
}

//--------------------------------------------------------------------------------------------------

/// Writes every parameter of `model` to `path`.
///
/// `Double` parameters are stored as F64, everything else as F32.
pub fn save(model: &dyn Module, path: impl AsRef<Path>) -> Result<(), ErrPack<CheckpointError>> {
	let path = path.as_ref();
	let mut entries: BTreeMap<String, (Dtype, Vec<usize>, Vec<u8>)> = BTreeMap::new();
	for (name, param) in model.named_params("") {
		let param = param.borrow();
		let value = param.value().f_detach()?.f_to_device(tch::Device::Cpu)?.f_contiguous()?;
		let shape = value.size().into_iter().map(|d| d as usize).collect();
		let flat = value.f_reshape([-1])?;
		let (dtype, bytes) = if value.kind() == Kind::Double {
			let values = Vec::<f64>::try_from(&flat)?;
			(Dtype::F64, values.iter().flat_map(|v| v.to_le_bytes()).collect())
		} else {
			let values = Vec::<f32>::try_from(&flat.f_to_kind(Kind::Float)?)?;
			(Dtype::F32, values.iter().flat_map(|v| v.to_le_bytes()).collect())
		};
		entries.insert(name, (dtype, shape, bytes));
	}

	let mut views = Vec::with_capacity(entries.len());
	for (name, (dtype, shape, bytes)) in &entries {
		views.push((name.as_str(), TensorView::new(*dtype, shape.clone(), bytes)?));
	}
	let metadata = Some(HashMap::from([("format".to_string(), "pt".to_string())]));
	let buffer = safetensors::serialize(views, &metadata)?;
	std::fs::write(path, buffer).map_err(|e| {
		ErrPack::with_nested(CheckpointError::Io, format!("cannot write {}", path.display()), Box::new(e))
	})?;

	log::info!("saved {} parameters to {}", entries.len(), path.display());
	Ok(())
}

/// Reads a checkpoint into a name -> tensor map.
pub fn read_state(path: impl AsRef<Path>) -> Result<HashMap<String, Tensor>, ErrPack<CheckpointError>> {
	let path = path.as_ref();
	let buffer = std::fs::read(path).map_err(|e| {
		ErrPack::with_nested(CheckpointError::Io, format!("cannot read {}", path.display()), Box::new(e))
	})?;
	let file = SafeTensors::deserialize(&buffer)?;
	let mut state = HashMap::new();
	for (name, view) in file.tensors() {
		let kind = match view.dtype() {
			Dtype::F64 => Kind::Double,
			Dtype::F32 => Kind::Float,
			Dtype::F16 => Kind::Half,
			Dtype::BF16 => Kind::BFloat16,
			dtype => {
				return Err(ErrPack::with_message(
					CheckpointError::UnsupportedDType,
					format!("parameter '{name}' has unsupported dtype {dtype:?}"),
				));
			},
		};
		let shape: Vec<i64> = view.shape().iter().map(|&d| d as i64).collect();
		let tensor = Tensor::f_from_data_size(view.data(), &shape, kind)?;
		state.insert(name, tensor);
	}
	Ok(state)
}

/// Loads the checkpoint at `path` into `model`.
pub fn load(model: &dyn Module, path: impl AsRef<Path>) -> Result<(), ErrPack<CheckpointError>> {
	let path = path.as_ref();
	let state = read_state(path)?;
	load_state(model, &state)?;
	log::info!("loaded {} parameters from {}", state.len(), path.display());
	Ok(())
}

/// Copies `state` into the parameters of `model`, converting dtypes.
pub fn load_state(
	model: &dyn Module,
	state: &HashMap<String, Tensor>,
) -> Result<(), ErrPack<CheckpointError>> {
	let params = model.named_params("");

	let mut missing = Vec::new();
	for (name, param) in &params {
		match state.get(name) {
			None => missing.push(name.as_str()),
			Some(value) => {
				let expected = param.borrow().shape();
				if value.size() != expected {
					return Err(ErrPack::with_message(
						CheckpointError::ShapeMismatch,
						format!(
							"parameter '{name}' has shape {:?} in the checkpoint, the model expects {expected:?}",
							value.size()
						),
					));
				}
			},
		}
	}
	if !missing.is_empty() {
		missing.sort_unstable();
		return Err(ErrPack::with_message(
			CheckpointError::MissingParam,
			format!("checkpoint is missing parameters: {}", missing.join(", ")),
		));
	}
	if state.len() != params.len() {
		let mut unexpected: Vec<&str> = state
			.keys()
			.filter(|key| !params.iter().any(|(name, _)| name == *key))
			.map(String::as_str)
			.collect();
		unexpected.sort_unstable();
		return Err(ErrPack::with_message(
			CheckpointError::UnexpectedParam,
			format!("checkpoint has unexpected parameters: {}", unexpected.join(", ")),
		));
	}

	for (name, param) in &params {
		if let Some(value) = state.get(name) {
			param.borrow_mut().assign(value)?;
		}
	}
	Ok(())
}

/// Builds a network from `config` and loads its weights from `path`.
pub fn load_model(
	kind: ModelKind,
	config: &NetworkConfig,
	path: impl AsRef<Path>,
) -> Result<Network, ErrPack<CheckpointError>> {
	let mut ctx = ModelContext::new(config.kind, config.device);
	let net = Network::new(&mut ctx, kind, config)?;
	load(&net, path)?;
	Ok(net)
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use std::path::PathBuf;

	use tch::Device;

	use super::*;
	use crate::config::DownsampleKind;
	use crate::models::{Model, OdeNet};
	use crate::nn::EvalContext;
	use crate::tensor;

	fn temp_path(name: &str) -> PathBuf {
		std::env::temp_dir().join(format!("odenet-{}-{name}.safetensors", std::process::id()))
	}

	fn small_config() -> NetworkConfig {
		let mut config = NetworkConfig::new(1);
		config.downsample = DownsampleKind::OneShot;
		config.n_filters = 8;
		config.out = 3;
		config
	}

	fn build(config: &NetworkConfig) -> OdeNet {
		OdeNet::new(&mut ModelContext::new(config.kind, config.device), config).unwrap()
	}

	#[test]
	fn test_round_trip() {
		tch::manual_seed(20);
		let config = small_config();
		let a = build(&config);
		let path = temp_path("round-trip");
		save(&a, &path).unwrap();

		let b = load_model(ModelKind::OdeNet, &config, &path).unwrap();
		std::fs::remove_file(&path).unwrap();
		for ((name_a, pa), (name_b, pb)) in a.named_params("").iter().zip(b.named_params("")) {
			assert_eq!(name_a, &name_b);
			let diff = tensor::max_abs(&(pa.borrow().value() - pb.borrow().value())).unwrap();
			assert_eq!(diff, 0.0, "{name_a}");
		}

		let x = Tensor::rand([2, 1, 8, 8], (Kind::Float, Device::Cpu));
		let ya = a.forward(&x, &mut EvalContext::new(false)).unwrap();
		let yb = b.forward(&x, &mut EvalContext::new(false)).unwrap();
		assert!(ya.allclose(&yb, 1e-6, 1e-6, false));
	}

	#[test]
	fn test_load_state_converts_dtype() {
		let net = build(&small_config());
		let state: HashMap<String, Tensor> = net
			.named_params("")
			.into_iter()
			.map(|(name, p)| (name, p.borrow().value().ones_like().to_kind(Kind::Double)))
			.collect();
		load_state(&net, &state).unwrap();
		for (_, p) in net.named_params("") {
			assert_eq!(p.borrow().kind(), Kind::Float);
			assert_eq!(tensor::max_abs(&(p.borrow().value() - 1.0)).unwrap(), 0.0);
		}
	}

	fn copy(state: &HashMap<String, Tensor>) -> HashMap<String, Tensor> {
		state.iter().map(|(k, v)| (k.clone(), v.shallow_clone())).collect()
	}

	fn scalar() -> Tensor {
		Tensor::zeros([1], (Kind::Float, Device::Cpu))
	}

	#[test]
	fn test_strict_loading() {
		let net = build(&small_config());
		let full: HashMap<String, Tensor> = net
			.named_params("")
			.into_iter()
			.map(|(name, p)| (name, p.borrow().value().zeros_like()))
			.collect();

		let mut missing = copy(&full);
		missing.remove("classifier.module.4.bias");
		let err = load_state(&net, &missing).unwrap_err();
		assert_eq!(err.code, CheckpointError::MissingParam);
		assert!(err.message().contains("classifier.module.4.bias"));

		let mut unexpected = copy(&full);
		unexpected.insert("classifier.module.9.weight".to_string(), scalar());
		let err = load_state(&net, &unexpected).unwrap_err();
		assert_eq!(err.code, CheckpointError::UnexpectedParam);

		let mut bad_shape = copy(&full);
		bad_shape.insert("downsample.module.weight".to_string(), scalar());
		let err = load_state(&net, &bad_shape).unwrap_err();
		assert_eq!(err.code, CheckpointError::ShapeMismatch);

		// nothing was overwritten by the failed loads
		for (_, p) in net.named_params("") {
			let v = p.borrow();
			if v.shape().len() > 1 {
				assert!(tensor::max_abs(v.value()).unwrap() > 0.0);
			}
		}
	}

	#[test]
	fn test_missing_file() {
		let net = build(&small_config());
		let err = load(&net, temp_path("does-not-exist")).unwrap_err();
		assert_eq!(err.code, CheckpointError::Io);
	}

	#[test]
	fn test_garbage_file() {
		let path = temp_path("garbage");
		std::fs::write(&path, b"definitely not safetensors").unwrap();
		let err = read_state(&path).unwrap_err();
		std::fs::remove_file(&path).unwrap();
		assert_eq!(err.code, CheckpointError::Format);
	}
}
