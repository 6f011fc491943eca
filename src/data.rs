//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! MNIST and CIFAR-10 from local files, with per-batch augmentation.
//!
//! Datasets are expected under `<root>/mnist` (the four idx files) and
//! `<root>/cifar10` (the binary batches). Nothing is downloaded.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use tch::data::Iter2;
use tch::{Kind, Tensor};

use crate::tensor::TensorOpError;
use crate::{ErrExtra, ErrPack};

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DatasetError {
	UnknownDataset,
	UnknownAugmentation,

	/// The augmentation exists, but not for this dataset.
	UnsupportedAugmentation,

	MissingFiles,

	/// The files exist but could not be parsed.
	Corrupted,

	Torch,
}

impl From<ErrPack<TensorOpError>> for ErrPack<DatasetError> {
	#[cold]
	#[inline(never)]
	fn from(err: ErrPack<TensorOpError>) -> Self {
		Self {
			code: DatasetError::Torch,
			extra: Some(Box::new(ErrExtra {
				message: err.message().to_string().into(),
				nested: Some(Box::new(err)),
			})),
		}
	}
}

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DatasetId {
	Mnist,
	Cifar10,
}

impl DatasetId {
	pub fn name(self) -> &'static str {
		match self {
			Self::Mnist => "mnist",
			Self::Cifar10 => "cifar10",
		}
	}

	pub fn in_channels(self) -> i64 {
		match self {
			Self::Mnist => 1,
			Self::Cifar10 => 3,
		}
	}

	pub fn image_size(self) -> i64 {
		match self {
			Self::Mnist => 28,
			Self::Cifar10 => 32,
		}
	}
}

impl FromStr for DatasetId {
	type Err = ErrPack<DatasetError>;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"mnist" => Ok(Self::Mnist),
			"cifar10" => Ok(Self::Cifar10),
			_ => Err(ErrPack::with_message(
				DatasetError::UnknownDataset,
				format!("unknown dataset '{s}', expected 'mnist' or 'cifar10'"),
			)),
		}
	}
}

impl fmt::Display for DatasetId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.name())
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Augmentation {
	#[default]
	None,
	Crop,
	CropFlipNorm,
	CropJitterFlipNorm,
}

impl Augmentation {
	pub const ALL: [Self; 4] = [Self::None, Self::Crop, Self::CropFlipNorm, Self::CropJitterFlipNorm];

	pub fn name(self) -> &'static str {
		match self {
			Self::None => "none",
			Self::Crop => "crop",
			Self::CropFlipNorm => "crop+flip+norm",
			Self::CropJitterFlipNorm => "crop+jitter+flip+norm",
		}
	}
}

impl FromStr for Augmentation {
	type Err = ErrPack<DatasetError>;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::ALL.into_iter().find(|a| a.name() == s).ok_or_else(|| {
			ErrPack::with_message(DatasetError::UnknownAugmentation, format!("unknown augmentation '{s}'"))
		})
	}
}

impl fmt::Display for Augmentation {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.name())
	}
}

//--------------------------------------------------------------------------------------------------

pub const CIFAR10_MEAN: [f64; 3] = [0.4914, 0.4822, 0.4465];
pub const CIFAR10_STD: [f64; 3] = [0.2023, 0.1994, 0.2010];

/// RGB -> YIQ
const YIQ: [f64; 9] = [0.299, 0.587, 0.114, 0.596, -0.274, -0.322, 0.211, -0.523, 0.312];

/// YIQ -> RGB
const YIQ_INV: [f64; 9] = [1.0, 0.956, 0.621, 1.0, -0.272, -0.647, 1.0, -1.106, 1.703];

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ColorJitter {
	/// Saturation factor drawn from `[1 - saturation, 1 + saturation]`.
	pub saturation: f64,

	/// Hue shift drawn from `[-hue, hue]`, as a fraction of a full turn.
	pub hue: f64,
}

/// Per-batch image transform. Input images are `[batch, channels, h, w]`
/// with values in `[0, 1]`. Every random choice is made per image.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transform {
	/// Zero padding added on each side before cropping back to the original size.
	pub crop_padding: Option<i64>,
	pub jitter: Option<ColorJitter>,
	pub flip: bool,
	pub normalize: Option<([f64; 3], [f64; 3])>,
}

impl Transform {
	pub fn identity() -> Self {
		Self::default()
	}

	pub fn is_identity(&self) -> bool {
		*self == Self::identity()
	}

	pub fn apply(&self, images: &Tensor) -> Result<Tensor, ErrPack<TensorOpError>> {
		let mut x = images.shallow_clone();
		if let Some(padding) = self.crop_padding {
			x = random_crop(&x, padding)?;
		}
		if let Some(jitter) = self.jitter {
			x = color_jitter(&x, jitter)?;
		}
		if self.flip {
			x = random_flip(&x)?;
		}
		if let Some((mean, std)) = self.normalize {
			x = normalize(&x, &mean, &std)?;
		}
		Ok(x)
	}
}

/// Train and test transforms for a dataset/augmentation pair.
pub fn transforms(
	dataset: DatasetId,
	augmentation: Augmentation,
) -> Result<(Transform, Transform), ErrPack<DatasetError>> {
	let normalized = Transform {
		normalize: Some((CIFAR10_MEAN, CIFAR10_STD)),
		..Transform::identity()
	};
	match (dataset, augmentation) {
		(_, Augmentation::None) => Ok((Transform::identity(), Transform::identity())),
		(DatasetId::Mnist, Augmentation::Crop) => Ok((
			Transform { crop_padding: Some(4), ..Transform::identity() },
			Transform::identity(),
		)),
		(DatasetId::Cifar10, Augmentation::CropFlipNorm) => Ok((
			Transform { crop_padding: Some(4), flip: true, ..normalized.clone() },
			normalized,
		)),
		(DatasetId::Cifar10, Augmentation::CropJitterFlipNorm) => Ok((
			Transform {
				crop_padding: Some(4),
				jitter: Some(ColorJitter { saturation: 0.05, hue: 0.05 }),
				flip: true,
				..normalized.clone()
			},
			normalized,
		)),
		(dataset, augmentation) => Err(ErrPack::with_message(
			DatasetError::UnsupportedAugmentation,
			format!("augmentation '{augmentation}' is not available for {dataset}"),
		)),
	}
}

fn random_crop(x: &Tensor, padding: i64) -> Result<Tensor, ErrPack<TensorOpError>> {
	let size = x.size();
	let &[batch, _, h, w] = size.as_slice() else {
		return Err(ErrPack::with_message(
			TensorOpError::InvalidShape,
			format!("random crop expects [batch, channels, h, w], got {size:?}"),
		));
	};
	if padding <= 0 || batch == 0 {
		return Ok(x.shallow_clone());
	}
	let padded = x.f_constant_pad_nd([padding, padding, padding, padding])?;
	let offsets = Tensor::f_randint(2 * padding + 1, [batch, 2], (Kind::Int64, x.device()))?;
	let offsets = Vec::<i64>::try_from(&offsets.f_reshape([-1])?)?;
	let crops = offsets
		.chunks_exact(2)
		.zip(padded.f_unbind(0)?)
		.map(|(offset, image)| match offset {
			&[dy, dx] => Ok(image.f_narrow(1, dy, h)?.f_narrow(2, dx, w)?),
			_ => Err(ErrPack::with_message(TensorOpError::InvalidShape, "bad crop offset")),
		})
		.collect::<Result<Vec<_>, ErrPack<TensorOpError>>>()?;
	Ok(Tensor::f_stack(&crops, 0)?)
}

fn random_flip(x: &Tensor) -> Result<Tensor, ErrPack<TensorOpError>> {
	let batch = x.size().first().copied().unwrap_or(0);
	let mask = Tensor::f_rand([batch], (Kind::Float, x.device()))?.f_lt(0.5)?.f_view([-1, 1, 1, 1])?;
	Ok(x.f_flip([3])?.f_where_self(&mask, x)?)
}

fn color_jitter(x: &Tensor, jitter: ColorJitter) -> Result<Tensor, ErrPack<TensorOpError>> {
	let size = x.size();
	let &[batch, 3, _, _] = size.as_slice() else {
		return Err(ErrPack::with_message(
			TensorOpError::InvalidShape,
			format!("color jitter expects RGB images, got {size:?}"),
		));
	};
	let options = (x.kind(), x.device());
	let uniform = |shape: &[i64], range: f64| -> Result<Tensor, ErrPack<TensorOpError>> {
		Ok(Tensor::f_rand(shape, options)?.f_mul_scalar(2.0 * range)?.f_sub_scalar(range)?)
	};

	// saturation: blend with the grayscale image
	let to_yiq = Tensor::f_from_slice(&YIQ)?.f_view([3, 3])?.f_to_kind(options.0)?.f_to_device(options.1)?;
	let luma = to_yiq.f_narrow(0, 0, 1)?.f_view([1, 3, 1, 1])?;
	let gray = x.f_mul(&luma)?.f_sum_dim_intlist(&[1_i64][..], true, options.0)?;
	let factor = uniform(&[batch, 1, 1, 1], jitter.saturation)?.f_add_scalar(1.0)?;
	let x = gray.f_add(&x.f_sub(&gray)?.f_mul(&factor)?)?.f_clamp(0.0, 1.0)?;

	// hue: rotate the chroma plane
	let from_yiq =
		Tensor::f_from_slice(&YIQ_INV)?.f_view([3, 3])?.f_to_kind(options.0)?.f_to_device(options.1)?;
	let yiq = to_yiq.f_matmul(&x.f_reshape([batch, 3, -1])?)?;
	let theta = uniform(&[batch, 1], jitter.hue)?.f_mul_scalar(2.0 * std::f64::consts::PI)?;
	let (cos, sin) = (theta.f_cos()?, theta.f_sin()?);
	let (y, i, q) = (yiq.f_select(1, 0)?, yiq.f_select(1, 1)?, yiq.f_select(1, 2)?);
	let i2 = i.f_mul(&cos)?.f_sub(&q.f_mul(&sin)?)?;
	let q2 = i.f_mul(&sin)?.f_add(&q.f_mul(&cos)?)?;
	let yiq = Tensor::f_stack(&[y, i2, q2], 1)?;
	let rgb = from_yiq.f_matmul(&yiq)?.f_reshape(size.as_slice())?;
	Ok(rgb.f_clamp(0.0, 1.0)?)
}

fn normalize(x: &Tensor, mean: &[f64; 3], std: &[f64; 3]) -> Result<Tensor, ErrPack<TensorOpError>> {
	let channels = x.size().get(1).copied().unwrap_or(0);
	if channels != 3 {
		return Err(ErrPack::with_message(
			TensorOpError::InvalidShape,
			format!("normalization expects 3 channels, got {channels}"),
		));
	}
	let stats = |v: &[f64; 3]| -> Result<Tensor, ErrPack<TensorOpError>> {
		Ok(Tensor::f_from_slice(v)?.f_view([1, 3, 1, 1])?.f_to_kind(x.kind())?.f_to_device(x.device())?)
	};
	Ok(x.f_sub(&stats(mean)?)?.f_div(&stats(std)?)?)
}

//--------------------------------------------------------------------------------------------------

/// Images, labels and the transform applied to every batch drawn from them.
pub struct DataSplit {
	/// `[n, channels, h, w]`, values in `[0, 1]`
	pub images: Tensor,

	/// `[n]`, Int64
	pub labels: Tensor,

	pub transform: Transform,
}

impl DataSplit {
	pub fn len(&self) -> usize {
		self.labels.size().first().map_or(0, |&n| n as usize)
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Iterates over transformed `(images, labels)` batches. The last batch may
	/// be smaller.
	pub fn batches(&self, batch_size: i64, shuffle: bool) -> Batches<'_> {
		let mut iter = Iter2::new(&self.images, &self.labels, batch_size);
		iter.return_smaller_last_batch();
		if shuffle {
			iter.shuffle();
		}
		Batches { iter, transform: &self.transform }
	}
}

pub struct Batches<'a> {
	iter: Iter2,
	transform: &'a Transform,
}

impl Iterator for Batches<'_> {
	type Item = Result<(Tensor, Tensor), ErrPack<TensorOpError>>;

	fn next(&mut self) -> Option<Self::Item> {
		let (images, labels) = self.iter.next()?;
		Some(self.transform.apply(&images).map(|images| (images, labels)))
	}
}

//--------------------------------------------------------------------------------------------------

struct RawDataset {
	train_images: Tensor,
	train_labels: Tensor,
	test_images: Tensor,
	test_labels: Tensor,
}

fn read(root: &Path, dataset: DatasetId) -> Result<RawDataset, ErrPack<DatasetError>> {
	let dir = root.join(dataset.name());
	if !dir.is_dir() {
		return Err(ErrPack::with_message(
			DatasetError::MissingFiles,
			format!("{dataset} not found in {}, download it manually", dir.display()),
		));
	}
	let corrupted = |e: &dyn fmt::Display| {
		ErrPack::with_message(
			DatasetError::Corrupted,
			format!("cannot read {dataset} from {}: {e}", dir.display()),
		)
	};
	let raw = match dataset {
		DatasetId::Mnist => tch::vision::mnist::load_dir(&dir).map_err(|e| corrupted(&e))?,
		DatasetId::Cifar10 => tch::vision::cifar::load_dir(&dir).map_err(|e| corrupted(&e))?,
	};

	let size = dataset.image_size();
	let shape = [-1, dataset.in_channels(), size, size];
	let images = |t: &Tensor| -> Result<Tensor, ErrPack<DatasetError>> {
		let t = t.f_view(shape).map_err(ErrPack::<TensorOpError>::from)?;
		Ok(t)
	};
	let data = RawDataset {
		train_images: images(&raw.train_images)?,
		train_labels: raw.train_labels,
		test_images: images(&raw.test_images)?,
		test_labels: raw.test_labels,
	};
	log::info!(
		"loaded {dataset}: {} train and {} test images",
		data.train_labels.size().first().copied().unwrap_or(0),
		data.test_labels.size().first().copied().unwrap_or(0),
	);
	Ok(data)
}

/// Returns `(train, test, in_channels)`.
pub fn load_dataset(
	root: impl AsRef<Path>,
	dataset: DatasetId,
	augmentation: Augmentation,
) -> Result<(DataSplit, DataSplit, i64), ErrPack<DatasetError>> {
	let (train_transform, test_transform) = transforms(dataset, augmentation)?;
	let raw = read(root.as_ref(), dataset)?;
	let train = DataSplit {
		images: raw.train_images,
		labels: raw.train_labels,
		transform: train_transform,
	};
	let test = DataSplit {
		images: raw.test_images,
		labels: raw.test_labels,
		transform: test_transform,
	};
	Ok((train, test, dataset.in_channels()))
}

/// The test split only, transformed the way models trained with
/// `augmentation` expect.
pub fn load_test_split(
	root: impl AsRef<Path>,
	dataset: DatasetId,
	augmentation: Augmentation,
) -> Result<DataSplit, ErrPack<DatasetError>> {
	let (_, test_transform) = transforms(dataset, augmentation)?;
	let raw = read(root.as_ref(), dataset)?;
	Ok(DataSplit {
		images: raw.test_images,
		labels: raw.test_labels,
		transform: test_transform,
	})
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use assert_approx_eq::assert_approx_eq;
	use tch::Device;

	use super::*;
	use crate::tensor;

	fn images(batch: i64, channels: i64, size: i64) -> Tensor {
		Tensor::rand([batch, channels, size, size], (Kind::Float, Device::Cpu))
	}

	#[test]
	fn test_names() {
		assert_eq!("mnist".parse::<DatasetId>().unwrap(), DatasetId::Mnist);
		assert_eq!("cifar10".parse::<DatasetId>().unwrap().in_channels(), 3);
		assert_eq!("imagenet".parse::<DatasetId>().unwrap_err().code, DatasetError::UnknownDataset);
		assert_eq!("tinyimagenet".parse::<DatasetId>().unwrap_err().code, DatasetError::UnknownDataset);
		for a in Augmentation::ALL {
			assert_eq!(a.name().parse::<Augmentation>().unwrap(), a);
		}
		assert_eq!("crop+flip".parse::<Augmentation>().unwrap_err().code, DatasetError::UnknownAugmentation);
	}

	#[test]
	fn test_supported_combinations() {
		let supported = [
			(DatasetId::Mnist, Augmentation::None),
			(DatasetId::Mnist, Augmentation::Crop),
			(DatasetId::Cifar10, Augmentation::None),
			(DatasetId::Cifar10, Augmentation::CropFlipNorm),
			(DatasetId::Cifar10, Augmentation::CropJitterFlipNorm),
		];
		for dataset in [DatasetId::Mnist, DatasetId::Cifar10] {
			for augmentation in Augmentation::ALL {
				let result = transforms(dataset, augmentation);
				if supported.contains(&(dataset, augmentation)) {
					assert!(result.is_ok(), "{dataset} {augmentation}");
				} else {
					assert_eq!(result.unwrap_err().code, DatasetError::UnsupportedAugmentation);
				}
			}
		}
	}

	#[test]
	fn test_test_transforms() {
		let (_, test) = transforms(DatasetId::Mnist, Augmentation::Crop).unwrap();
		assert!(test.is_identity());
		let (train, test) = transforms(DatasetId::Cifar10, Augmentation::CropFlipNorm).unwrap();
		assert!(train.flip && train.jitter.is_none());
		assert_eq!(test.normalize, Some((CIFAR10_MEAN, CIFAR10_STD)));
		assert!(test.crop_padding.is_none() && !test.flip);
	}

	#[test]
	fn test_random_crop() {
		tch::manual_seed(30);
		let x = Tensor::ones([6, 1, 28, 28], (Kind::Float, Device::Cpu));
		let y = random_crop(&x, 4).unwrap();
		assert_eq!(y.size(), x.size());
		// shifts are at most 4 pixels, so the 20x20 center always survives
		let center = y.narrow(2, 4, 20).narrow(3, 4, 20);
		assert_eq!(center.sum(Kind::Double).double_value(&[]), 6.0 * 400.0);
		let total = y.sum(Kind::Double).double_value(&[]);
		assert!(total <= 6.0 * 784.0 && total >= 6.0 * 576.0);
		assert!(tensor::is_finite(&y).unwrap());
		assert!(random_crop(&Tensor::ones([4, 4], (Kind::Float, Device::Cpu)), 4).is_err());
	}

	#[test]
	fn test_random_flip() {
		tch::manual_seed(31);
		let x = images(16, 3, 8);
		let y = random_flip(&x).unwrap();
		let flipped = x.flip([3]);
		for i in 0..16 {
			let (xi, yi, fi) = (x.get(i), y.get(i), flipped.get(i));
			assert!(yi.allclose(&xi, 0.0, 0.0, false) || yi.allclose(&fi, 0.0, 0.0, false));
		}
	}

	#[test]
	fn test_normalize() {
		let x = Tensor::ones([2, 3, 4, 4], (Kind::Float, Device::Cpu));
		let y = normalize(&x, &CIFAR10_MEAN, &CIFAR10_STD).unwrap();
		let expected = (1.0 - CIFAR10_MEAN[1]) / CIFAR10_STD[1];
		assert_approx_eq!(y.double_value(&[1, 1, 2, 3]), expected, 1e-5);
		assert!(normalize(&images(2, 1, 4), &CIFAR10_MEAN, &CIFAR10_STD).is_err());
	}

	#[test]
	fn test_color_jitter_keeps_gray() {
		tch::manual_seed(32);
		// gray pixels have no chroma, so neither saturation nor hue changes them
		let x = Tensor::full([3, 3, 4, 4], 0.5, (Kind::Float, Device::Cpu));
		let jitter = ColorJitter { saturation: 0.05, hue: 0.05 };
		let y = color_jitter(&x, jitter).unwrap();
		assert_eq!(y.size(), x.size());
		assert!(tensor::max_abs(&(y - 0.5)).unwrap() < 1e-2);

		let colored = images(3, 3, 4);
		let y = color_jitter(&colored, jitter).unwrap();
		assert!(tensor::max_abs(&y).unwrap() <= 1.0);
		assert!(color_jitter(&images(2, 1, 4), jitter).is_err());
	}

	#[test]
	fn test_batches() {
		let split = DataSplit {
			images: images(10, 1, 4),
			labels: Tensor::arange(10, (Kind::Int64, Device::Cpu)),
			transform: Transform { crop_padding: Some(1), ..Transform::identity() },
		};
		assert_eq!(split.len(), 10);
		let sizes: Vec<i64> = split
			.batches(4, true)
			.map(|batch| {
				let (x, y) = batch.unwrap();
				assert_eq!(x.size()[1..], [1, 4, 4]);
				y.size()[0]
			})
			.collect();
		assert_eq!(sizes, [4, 4, 2]);
	}

	#[test]
	fn test_missing_dataset() {
		let root = std::env::temp_dir().join(format!("odenet-no-data-{}", std::process::id()));
		let err = load_dataset(&root, DatasetId::Mnist, Augmentation::None).err().unwrap();
		assert_eq!(err.code, DatasetError::MissingFiles);
		let err = load_test_split(&root, DatasetId::Mnist, Augmentation::CropFlipNorm).err().unwrap();
		assert_eq!(err.code, DatasetError::UnsupportedAugmentation);
	}
}
