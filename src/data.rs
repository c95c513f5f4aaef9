use anyhow::{anyhow, bail, Context, Result};
use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor, TensorData},
};
use image::{imageops::FilterType, DynamicImage, ImageReader};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rayon::prelude::*;
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{augmentation::AugmentationConfig, entity::ImageSize};

pub const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "bmp", "ppm", "tif", "tiff"];

/// Which side of a validation split a flow reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subset {
    Training,
    Validation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageItem {
    pub path: PathBuf,
    pub label: usize,
}

/// Images laid out as one subdirectory per class.
///
/// Class indices follow the sorted subdirectory names. Within each class
/// the files are sorted and the first `floor(split * n)` belong to the
/// validation subset, the remainder to training.
#[derive(Debug, Clone)]
pub struct DirectoryDataset {
    root: PathBuf,
    class_names: Vec<String>,
    items: Vec<ImageItem>,
}

impl DirectoryDataset {
    pub fn new<P: AsRef<Path>>(root: P, validation_split: f32, subset: Subset) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !(0.0..1.0).contains(&validation_split) {
            bail!("validation split must be in [0, 1), got {validation_split}");
        }
        if !root.is_dir() {
            bail!("image directory does not exist: {}", root.display());
        }

        let mut class_names = Vec::new();
        for entry in fs::read_dir(&root).with_context(|| format!("reading {}", root.display()))? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                class_names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        class_names.sort();

        let per_class: Vec<Vec<ImageItem>> = class_names
            .par_iter()
            .enumerate()
            .map(|(label, name)| -> Result<Vec<ImageItem>> {
                let files = collect_image_files(&root.join(name))?;
                let cut = (f64::from(validation_split) * files.len() as f64) as usize;
                let selected = match subset {
                    Subset::Validation => &files[..cut],
                    Subset::Training => &files[cut..],
                };
                Ok(selected
                    .iter()
                    .map(|path| ImageItem {
                        path: path.clone(),
                        label,
                    })
                    .collect())
            })
            .collect::<Result<_>>()?;

        let items: Vec<ImageItem> = per_class.into_iter().flatten().collect();
        tracing::info!(
            "Found {} images belonging to {} classes in {} ({:?})",
            items.len(),
            class_names.len(),
            root.display(),
            subset
        );

        Ok(Self {
            root,
            class_names,
            items,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn items(&self) -> &[ImageItem] {
        &self.items
    }

    pub fn samples(&self) -> usize {
        self.items.len()
    }

    /// Reorder the items with a seeded permutation.
    pub fn shuffled(mut self, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        self.items.shuffle(&mut rng);
        self
    }

    /// Keep only the first `count` items.
    pub fn truncated(mut self, count: usize) -> Self {
        self.items.truncate(count);
        self
    }
}

impl Dataset<ImageItem> for DirectoryDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// All image files below `dir`, sorted by path.
fn collect_image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut dirs = vec![dir.to_path_buf()];

    while let Some(current_dir) = dirs.pop() {
        let entries = fs::read_dir(&current_dir)
            .with_context(|| format!("reading {}", current_dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                dirs.push(path);
            } else if path.is_file() && is_image(&path) {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    Nearest,
    Bilinear,
}

impl Interpolation {
    fn filter(self) -> FilterType {
        match self {
            Interpolation::Nearest => FilterType::Nearest,
            Interpolation::Bilinear => FilterType::Triangle,
        }
    }
}

/// Decode, resize, rescale and optionally augment one image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTransform {
    pub size: ImageSize,
    pub rescale: f32,
    pub interpolation: Interpolation,
    pub augmentation: Option<AugmentationConfig>,
}

impl ImageTransform {
    pub fn new(size: ImageSize) -> Self {
        Self {
            size,
            rescale: 1.0 / 255.0,
            interpolation: Interpolation::Bilinear,
            augmentation: None,
        }
    }

    pub fn with_interpolation(mut self, interpolation: Interpolation) -> Self {
        self.interpolation = interpolation;
        self
    }

    pub fn with_augmentation(mut self, augmentation: Option<AugmentationConfig>) -> Self {
        self.augmentation = augmentation;
        self
    }

    /// Number of `f32` values one image occupies.
    pub fn item_len(&self) -> usize {
        self.size.channels * self.size.height * self.size.width
    }

    pub fn load(&self, path: &Path) -> Result<Vec<f32>> {
        let img = ImageReader::open(path)
            .with_context(|| format!("opening {}", path.display()))?
            .with_guessed_format()
            .with_context(|| format!("reading {}", path.display()))?
            .decode()
            .with_context(|| format!("decoding {}", path.display()))?;
        Ok(self.apply(img))
    }

    /// Channel-first pixels, rescaled and augmented if configured.
    pub fn apply(&self, img: DynamicImage) -> Vec<f32> {
        let ImageSize {
            height,
            width,
            channels,
        } = self.size;
        let img = img.resize_exact(width as u32, height as u32, self.interpolation.filter());

        let raw = if channels == 1 {
            img.to_luma8().into_raw()
        } else {
            img.to_rgb8().into_raw()
        };

        let frame_size = height * width;
        let mut chw = vec![0.0; frame_size * channels];
        for i in 0..frame_size {
            for c in 0..channels {
                chw[c * frame_size + i] = raw[i * channels + c] as f32 * self.rescale;
            }
        }

        match &self.augmentation {
            Some(augmentation) => augmentation.random_transform(
                &chw,
                channels,
                height,
                width,
                &mut rand::thread_rng(),
            ),
            None => chw,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CtScanBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

#[derive(Debug, Clone)]
pub struct CtScanBatcher {
    transform: ImageTransform,
}

impl CtScanBatcher {
    pub fn new(transform: ImageTransform) -> Self {
        Self { transform }
    }
}

impl<B: Backend> Batcher<B, ImageItem, CtScanBatch<B>> for CtScanBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> CtScanBatch<B> {
        let batch_size = items.len();
        let ImageSize {
            height,
            width,
            channels,
        } = self.transform.size;
        let item_len = self.transform.item_len();

        let decoded: Vec<Vec<f32>> = items
            .par_iter()
            .map(|item| match self.transform.load(&item.path) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!("Skipping unreadable image {}: {:#}", item.path.display(), e);
                    vec![0.0; item_len]
                }
            })
            .collect();

        let images: Vec<f32> = decoded.into_iter().flatten().collect();
        let targets: Vec<i64> = items.iter().map(|item| item.label as i64).collect();

        let images = Tensor::<B, 4>::from_data(
            TensorData::new(images, [batch_size, channels, height, width]).convert::<B::FloatElem>(),
            device,
        );
        let targets = Tensor::<B, 1, Int>::from_data(
            TensorData::new(targets, [batch_size]).convert::<B::IntElem>(),
            device,
        );

        CtScanBatch { images, targets }
    }
}

/// Preprocessed images ready for a forward pass, without a backend attached.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBatch {
    pub data: Vec<f32>,
    pub shape: [usize; 4],
}

impl ImageBatch {
    /// A batch holding the single image at `path`.
    pub fn from_path(transform: &ImageTransform, path: &Path) -> Result<Self> {
        let data = transform.load(path)?;
        let ImageSize {
            height,
            width,
            channels,
        } = transform.size;
        Ok(Self {
            data,
            shape: [1, channels, height, width],
        })
    }

    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Result<Tensor<B, 4>> {
        let expected: usize = self.shape.iter().product();
        if expected != self.data.len() {
            return Err(anyhow!(
                "batch shape {:?} does not match {} values",
                self.shape,
                self.data.len()
            ));
        }
        Ok(Tensor::from_data(
            TensorData::new(self.data.clone(), self.shape).convert::<B::FloatElem>(),
            device,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn write_image(path: &Path, value: u8) {
        RgbImage::from_pixel(8, 6, Rgb([value, value, value]))
            .save(path)
            .unwrap();
    }

    fn make_tree(root: &Path, counts: &[(&str, usize)]) {
        for (class, n) in counts {
            let dir = root.join(class);
            fs::create_dir_all(&dir).unwrap();
            for i in 0..*n {
                write_image(&dir.join(format!("img_{i:03}.png")), (i * 10) as u8);
            }
        }
    }

    #[test]
    fn split_counts_follow_per_class_floor() {
        let dir = TempDir::new().unwrap();
        make_tree(dir.path(), &[("normal", 7), ("adenocarcinoma", 13)]);

        let valid = DirectoryDataset::new(dir.path(), 0.2, Subset::Validation).unwrap();
        let train = DirectoryDataset::new(dir.path(), 0.2, Subset::Training).unwrap();

        // floor(1.4) + floor(2.6)
        assert_eq!(valid.samples(), 1 + 2);
        assert_eq!(train.samples(), 20 - 3);
        assert_eq!(valid.class_names(), &["adenocarcinoma", "normal"]);
    }

    #[test]
    fn validation_takes_leading_sorted_files() {
        let dir = TempDir::new().unwrap();
        make_tree(dir.path(), &[("a", 10)]);

        let valid = DirectoryDataset::new(dir.path(), 0.3, Subset::Validation).unwrap();
        let names: Vec<_> = valid
            .items()
            .iter()
            .map(|item| item.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["img_000.png", "img_001.png", "img_002.png"]);
    }

    #[test]
    fn non_image_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        make_tree(dir.path(), &[("a", 2)]);
        fs::write(dir.path().join("a").join("notes.txt"), "x").unwrap();

        let train = DirectoryDataset::new(dir.path(), 0.0, Subset::Training).unwrap();
        assert_eq!(train.samples(), 2);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(DirectoryDataset::new(dir.path().join("none"), 0.2, Subset::Training).is_err());
    }

    #[test]
    fn shuffle_and_truncate() {
        let dir = TempDir::new().unwrap();
        make_tree(dir.path(), &[("a", 5), ("b", 5)]);
        let ds = DirectoryDataset::new(dir.path(), 0.0, Subset::Training).unwrap();

        let once = ds.clone().shuffled(42).truncated(4);
        let twice = ds.shuffled(42).truncated(4);
        assert_eq!(once.items(), twice.items());
        assert_eq!(once.samples(), 4);
    }

    #[test]
    fn transform_rescales_to_unit_range() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("white.png");
        write_image(&path, 255);

        let transform = ImageTransform::new(ImageSize::new(4, 4, 3));
        let data = transform.load(&path).unwrap();
        assert_eq!(data.len(), 3 * 4 * 4);
        assert!(data.iter().all(|v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn batcher_produces_expected_shapes() {
        let dir = TempDir::new().unwrap();
        make_tree(dir.path(), &[("a", 2), ("b", 1)]);
        let ds = DirectoryDataset::new(dir.path(), 0.0, Subset::Training).unwrap();

        let batcher = CtScanBatcher::new(ImageTransform::new(ImageSize::new(4, 5, 3)));
        let device = Default::default();
        let batch: CtScanBatch<TestBackend> =
            batcher.batch(ds.items().to_vec(), &device);

        assert_eq!(batch.images.dims(), [3, 3, 4, 5]);
        let targets: Vec<i64> = batch.targets.into_data().to_vec().unwrap();
        assert_eq!(targets, vec![0, 0, 1]);
    }

    #[test]
    fn unreadable_image_becomes_zeros() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.png");
        fs::write(&path, b"not an image").unwrap();

        let batcher = CtScanBatcher::new(ImageTransform::new(ImageSize::new(2, 2, 3)));
        let device = Default::default();
        let batch: CtScanBatch<TestBackend> =
            batcher.batch(vec![ImageItem { path, label: 1 }], &device);

        let values: Vec<f32> = batch.images.into_data().to_vec().unwrap();
        assert!(values.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn image_batch_has_leading_batch_dimension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scan.png");
        write_image(&path, 128);

        let transform = ImageTransform::new(ImageSize::new(224, 224, 3))
            .with_interpolation(Interpolation::Nearest);
        let batch = ImageBatch::from_path(&transform, &path).unwrap();
        assert_eq!(batch.shape, [1, 3, 224, 224]);

        let device = Default::default();
        let tensor = batch.to_tensor::<TestBackend>(&device).unwrap();
        assert_eq!(tensor.dims(), [1, 3, 224, 224]);
    }
}
