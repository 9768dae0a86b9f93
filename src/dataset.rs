//! Sample sources: directory-structured image datasets and in-memory tensors.
//!
//! A dataset root holds `train/` and `val/`, each with one subdirectory per
//! class. Class ids come from the training split: directory names sorted, then
//! numbered from zero. The id map is shared with the validation split, whose
//! unknown class directories are skipped.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::config::FinetuneConfig;
use crate::error::{FinetuneError, Result};

/// File extensions accepted as images (compared case-insensitively).
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "ppm", "bmp", "pgm", "tif", "tiff", "webp",
];

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// One batch of inputs and integer labels.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Inputs, first dimension is the batch.
    pub images: Tensor,
    /// `u32` class ids of shape `(batch,)`.
    pub labels: Tensor,
}

/// A finite, re-iterable source of labeled batches.
pub trait SampleSource {
    /// Number of samples.
    fn len(&self) -> usize;

    /// Whether the source has no samples.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Samples per batch; the last batch may be shorter.
    fn batch_size(&self) -> usize;

    /// Number of batches in one pass.
    fn num_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size().max(1))
    }

    /// Start one pass over the source.
    ///
    /// Each call is one epoch; sources that shuffle draw a new order here.
    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_>;
}

/// Class id to class name mapping derived from a split directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassIndex {
    names: Vec<String>,
}

impl ClassIndex {
    /// Build from explicit names; ids follow the given order.
    #[must_use]
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Scan the subdirectories of `dir`, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Dataset`] if `dir` cannot be read or has no
    /// class directories.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let entries = fs::read_dir(dir).map_err(|e| {
            FinetuneError::Dataset(format!("cannot read {}: {e}", dir.display()))
        })?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.path().is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        if names.is_empty() {
            return Err(FinetuneError::Dataset(format!(
                "no class directories in {}",
                dir.display()
            )));
        }
        names.sort();
        Ok(Self { names })
    }

    /// Number of classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether there are no classes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Class names in id order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Id of the class called `name`.
    #[must_use]
    pub fn id_of(&self, name: &str) -> Option<u32> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| u32::try_from(i).ok())
    }

    /// Name of class `id`.
    #[must_use]
    pub fn name_of(&self, id: u32) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    /// Write as a 4-space indented JSON object `{"0": "name", ...}` in id order.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn write_json<W: Write>(&self, writer: W) -> Result<()> {
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(writer, formatter);
        self.serialize(&mut ser)?;
        Ok(())
    }

    /// Write the JSON map to `path`, flushed to stable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_json(&mut writer)?;
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|e| FinetuneError::Io(e.into_error()))?
            .sync_all()?;
        Ok(())
    }
}

impl Serialize for ClassIndex {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.names.len()))?;
        for (id, name) in self.names.iter().enumerate() {
            map.serialize_entry(&id.to_string(), name)?;
        }
        map.end()
    }
}

/// Which transform an [`ImageFolder`] applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    /// Exact resize, reshuffled every pass.
    Train,
    /// Resize the short side then centre crop, fixed order.
    Val,
}

/// Loader options shared by both splits.
#[derive(Debug, Clone)]
pub struct FolderOptions {
    /// Samples per batch.
    pub batch_size: usize,
    /// Square output side length.
    pub image_size: u32,
    /// Upper bound on decode workers.
    pub max_workers: Option<usize>,
    /// Seed for the shuffle order.
    pub seed: u64,
}

impl FolderOptions {
    /// Options derived from a run configuration.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Config`] if the image size does not fit in `u32`.
    pub fn from_config(config: &FinetuneConfig) -> Result<Self> {
        let image_size = u32::try_from(config.data.image_size)
            .map_err(|_| FinetuneError::Config("data.image_size too large".into()))?;
        Ok(Self {
            batch_size: config.training.batch_size,
            image_size,
            max_workers: config.data.num_workers,
            seed: config.seed,
        })
    }
}

/// Decode worker count: `min(cpus, batch_size if > 1 else 0, 8)`, then capped.
///
/// Zero means decoding runs on the calling thread.
#[must_use]
pub fn worker_count(batch_size: usize, cap: Option<usize>) -> usize {
    let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    let per_batch = if batch_size > 1 { batch_size } else { 0 };
    let workers = cpus.min(per_batch).min(8);
    cap.map_or(workers, |c| workers.min(c))
}

/// Whether `path` has one of the [`IMAGE_EXTENSIONS`].
#[must_use]
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

/// Image files anywhere below `dir`, following symlinks.
///
/// Directories already visited (by canonical path) are not entered twice.
fn collect_images(
    dir: &Path,
    seen: &mut HashSet<PathBuf>,
    files: &mut Vec<PathBuf>,
) -> Result<()> {
    if !seen.insert(fs::canonicalize(dir)?) {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_images(&path, seen, files)?;
        } else if path.is_file() && is_image_file(&path) {
            files.push(path);
        }
    }
    Ok(())
}

/// Images under `<split>/<class>/` (at any depth) decoded into normalised CHW batches.
pub struct ImageFolder {
    samples: Vec<(PathBuf, u32)>,
    split: Split,
    batch_size: usize,
    image_size: u32,
    rng: StdRng,
    pool: Option<rayon::ThreadPool>,
}

impl std::fmt::Debug for ImageFolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageFolder")
            .field("samples", &self.samples.len())
            .field("split", &self.split)
            .field("batch_size", &self.batch_size)
            .field("image_size", &self.image_size)
            .finish_non_exhaustive()
    }
}

impl ImageFolder {
    /// Scan `split_dir` using the ids in `classes`.
    ///
    /// Class directories not present in `classes` are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read or the decode pool
    /// cannot be started.
    pub fn open(
        split_dir: &Path,
        classes: &ClassIndex,
        split: Split,
        options: &FolderOptions,
    ) -> Result<Self> {
        let mut class_dirs: Vec<PathBuf> = fs::read_dir(split_dir)
            .map_err(|e| {
                FinetuneError::Dataset(format!("cannot read {}: {e}", split_dir.display()))
            })?
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        class_dirs.sort();

        let mut samples = Vec::new();
        for dir in class_dirs {
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let Some(label) = classes.id_of(&name) else {
                tracing::warn!(
                    "Skipping class directory {} (not in training classes)",
                    dir.display()
                );
                continue;
            };
            let mut files = Vec::new();
            collect_images(&dir, &mut HashSet::new(), &mut files)?;
            files.sort();
            tracing::debug!("{:?} class {name}: {} images", split, files.len());
            samples.extend(files.into_iter().map(|p| (p, label)));
        }

        let workers = worker_count(options.batch_size, options.max_workers);
        let pool = if workers > 0 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(workers)
                    .thread_name(|i| format!("decode-{i}"))
                    .build()?,
            )
        } else {
            None
        };
        tracing::info!(
            "{:?} split: {} images in {}, {} decode workers",
            split,
            samples.len(),
            split_dir.display(),
            workers
        );

        Ok(Self {
            samples,
            split,
            batch_size: options.batch_size.max(1),
            image_size: options.image_size,
            rng: StdRng::seed_from_u64(options.seed),
            pool,
        })
    }

    /// Sample paths with their labels, in scan order.
    #[must_use]
    pub fn samples(&self) -> &[(PathBuf, u32)] {
        &self.samples
    }

    fn load_batch(&self, indices: &[usize]) -> Result<Batch> {
        let decode = |&i: &usize| -> Result<Vec<f32>> {
            let (path, _) = &self.samples[i];
            let img = image::open(path).map_err(|e| {
                FinetuneError::Dataset(format!("failed to decode {}: {e}", path.display()))
            })?;
            Ok(to_chw(&self.transform(img)))
        };

        let pixels: Vec<Vec<f32>> = match &self.pool {
            Some(pool) => pool.install(|| {
                indices
                    .par_iter()
                    .map(decode)
                    .collect::<Result<Vec<_>>>()
            })?,
            None => indices.iter().map(decode).collect::<Result<_>>()?,
        };

        let side = self.image_size as usize;
        let data: Vec<f32> = pixels.into_iter().flatten().collect();
        let images = Tensor::from_vec(data, (indices.len(), 3, side, side), &Device::Cpu)?;
        let labels: Vec<u32> = indices.iter().map(|&i| self.samples[i].1).collect();
        let labels = Tensor::from_vec(labels, indices.len(), &Device::Cpu)?;
        Ok(Batch { images, labels })
    }

    fn transform(&self, img: DynamicImage) -> RgbImage {
        let size = self.image_size;
        match self.split {
            Split::Train => img.resize_exact(size, size, FilterType::Triangle).to_rgb8(),
            Split::Val => {
                let rgb = img.to_rgb8();
                let short = resize_short_side(size);
                let (w, h) = rgb.dimensions();
                let (nw, nh) = if w <= h {
                    (short, scale_dim(h, short, w))
                } else {
                    (scale_dim(w, short, h), short)
                };
                let resized = imageops::resize(&rgb, nw.max(size), nh.max(size), FilterType::Triangle);
                let (rw, rh) = resized.dimensions();
                imageops::crop_imm(&resized, (rw - size) / 2, (rh - size) / 2, size, size)
                    .to_image()
            }
        }
    }
}

/// Short side before the centre crop: `size * 256 / 224`, rounded.
fn resize_short_side(size: u32) -> u32 {
    u32::try_from((u64::from(size) * 256 + 112) / 224).unwrap_or(size)
}

fn scale_dim(long: u32, short_target: u32, short: u32) -> u32 {
    let scaled = (u64::from(long) * u64::from(short_target)) / u64::from(short.max(1));
    u32::try_from(scaled).unwrap_or(u32::MAX)
}

/// HWC RGB bytes to normalised CHW floats.
fn to_chw(img: &RgbImage) -> Vec<f32> {
    let (w, h) = img.dimensions();
    let plane = (w * h) as usize;
    let mut out = vec![0f32; 3 * plane];
    for (i, pixel) in img.pixels().enumerate() {
        for c in 0..3 {
            let v = f32::from(pixel[c]) / 255.0;
            out[c * plane + i] = (v - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    out
}

impl SampleSource for ImageFolder {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        if self.split == Split::Train {
            order.shuffle(&mut self.rng);
        }
        let this: &Self = self;
        let batch_size = this.batch_size;
        Box::new(
            (0..this.num_batches()).map(move |b| {
                let end = ((b + 1) * batch_size).min(order.len());
                this.load_batch(&order[b * batch_size..end])
            }),
        )
    }
}

/// Samples held in memory as one input tensor and one label tensor.
#[derive(Debug, Clone)]
pub struct TensorSource {
    images: Tensor,
    labels: Tensor,
    batch_size: usize,
}

impl TensorSource {
    /// Wrap `images` (first dimension = samples) and `u32` `labels`.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Dataset`] if the sample counts differ, labels are
    /// not one-dimensional or the batch size is zero.
    pub fn new(images: Tensor, labels: Tensor, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(FinetuneError::Dataset("batch size must be > 0".into()));
        }
        if labels.rank() != 1 {
            return Err(FinetuneError::Dataset(format!(
                "labels must be one-dimensional, got shape {:?}",
                labels.dims()
            )));
        }
        let n = images.dim(0)?;
        if labels.dim(0)? != n {
            return Err(FinetuneError::Dataset(format!(
                "{n} inputs but {} labels",
                labels.dim(0)?
            )));
        }
        let labels = labels.to_dtype(candle_core::DType::U32)?;
        Ok(Self {
            images,
            labels,
            batch_size,
        })
    }
}

impl SampleSource for TensorSource {
    fn len(&self) -> usize {
        self.labels.dims().first().copied().unwrap_or(0)
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        let n = self.len();
        let batch_size = self.batch_size;
        Box::new((0..n).step_by(batch_size).map(move |start| {
            let len = batch_size.min(n - start);
            Ok(Batch {
                images: self.images.narrow(0, start, len)?,
                labels: self.labels.narrow(0, start, len)?,
            })
        }))
    }
}
