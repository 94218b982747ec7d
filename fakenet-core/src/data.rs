use crate::error::{Error, Result};
use crate::transform::Transform;
use burn::{
    data::dataloader::{batcher::Batcher, Dataset},
    prelude::*,
    tensor::TensorData,
};
use rand::thread_rng;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One row of an annotations file.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub image: PathBuf,
    pub label: i64,
}

#[derive(Debug, Clone)]
pub struct Sample {
    /// `3 x size x size` values in CHW order
    pub image: Vec<f32>,
    pub label: i64,
    pub path: PathBuf,
}

impl Sample {
    pub fn new(image: Vec<f32>, label: i64, path: PathBuf) -> Self {
        Self { image, label, path }
    }
}

/// Reads `annotations` (a header row, then `file name, label, ...`) and
/// resolves every file name against `image_dir`.
pub fn read_annotations(
    annotations: &Path,
    image_dir: &Path,
    num_classes: usize,
) -> Result<Vec<Annotation>> {
    let into_err = |source| Error::Annotations {
        path: annotations.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(annotations)
        .map_err(into_err)?;

    let mut rows = vec![];
    for (i, record) in reader.records().enumerate() {
        let record = record.map_err(into_err)?;
        // Line the record starts on, so quoted newlines do not shift it
        let row = record
            .position()
            .map_or(i + 2, |pos| pos.line() as usize);
        let malformed = |reason: String| Error::MalformedRow {
            path: annotations.to_path_buf(),
            row,
            reason,
        };
        let (Some(name), Some(label)) = (record.get(0), record.get(1)) else {
            return Err(malformed(format!(
                "expected an image name and a label, found {} field(s)",
                record.len()
            )));
        };
        if name.is_empty() {
            return Err(malformed("empty image name".to_string()));
        }
        let label = label
            .parse::<i64>()
            .map_err(|e| malformed(format!("label {label:?} is not an integer: {e}")))?;
        if label < 0 || label as usize >= num_classes {
            return Err(Error::InvalidLabel {
                path: annotations.to_path_buf(),
                row,
                label,
                num_classes,
            });
        }
        let image = image_dir.join(name);
        if !image.is_file() {
            return Err(Error::MissingImage {
                path: annotations.to_path_buf(),
                row,
                image,
            });
        }
        rows.push(Annotation { image, label });
    }
    Ok(rows)
}

pub struct FakedditDataset {
    inner: Vec<Annotation>,
    transform: Transform,
}

impl FakedditDataset {
    pub fn new(inner: Vec<Annotation>, transform: Transform) -> Self {
        Self { inner, transform }
    }

    pub fn from_csv(
        split: &'static str,
        annotations: &Path,
        image_dir: &Path,
        num_classes: usize,
        transform: Transform,
    ) -> Result<Self> {
        let inner = read_annotations(annotations, image_dir, num_classes)?;
        if inner.is_empty() {
            return Err(Error::EmptySplit {
                split,
                path: annotations.to_path_buf(),
            });
        }
        debug!(split, samples = inner.len(), "annotations loaded");
        Ok(Self::new(inner, transform))
    }
}

impl Dataset<Sample> for FakedditDataset {
    fn get(&self, index: usize) -> Option<Sample> {
        let Annotation { image, label } = self.inner.get(index)?;
        let flip = self.transform.sample_flip(&mut thread_rng());
        let data = image::open(image)
            .ok()
            .and_then(|img| self.transform.apply(&img, flip))
            .unwrap_or_else(|| panic!("Failed to load image {}", image.display()));
        Some(Sample::new(data, *label, image.clone()))
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

#[derive(Clone)]
pub struct FakedditBatcher<B: Backend> {
    device: B::Device,
    size: usize,
}

#[derive(Debug, Clone)]
pub struct FakedditBatch<B: Backend> {
    /// [batch_size, 3, size, size]
    pub images: Tensor<B, 4>,
    /// [batch_size]
    pub targets: Tensor<B, 1, Int>,
    pub paths: Vec<PathBuf>,
}

impl<B: Backend> FakedditBatcher<B> {
    pub fn new(device: B::Device, size: usize) -> Self {
        Self { device, size }
    }
}

impl<B: Backend> Batcher<Sample, FakedditBatch<B>> for FakedditBatcher<B> {
    fn batch(&self, items: Vec<Sample>) -> FakedditBatch<B> {
        let n = items.len();
        let mut pixels = Vec::with_capacity(n * 3 * self.size * self.size);
        let mut labels = Vec::with_capacity(n);
        let mut paths = Vec::with_capacity(n);
        for item in items {
            assert_eq!(
                item.image.len(),
                3 * self.size * self.size,
                "sample {} does not match the batch image size {}",
                item.path.display(),
                self.size
            );
            pixels.extend(item.image);
            labels.push(item.label);
            paths.push(item.path);
        }

        let images = Tensor::from_data(
            TensorData::new(pixels, [n, 3, self.size, self.size]),
            &self.device,
        );
        let targets = Tensor::from_data(TensorData::new(labels, [n]), &self.device);

        FakedditBatch {
            images,
            targets,
            paths,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::{Rgb, RgbImage};
    use std::fs;

    type TestBackend = NdArray;

    fn write_csv(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("labels.csv");
        fs::write(&path, format!("image,label\n{body}")).unwrap();
        path
    }

    fn write_image(dir: &Path, name: &str) {
        RgbImage::from_pixel(10, 6, Rgb([1, 2, 3]))
            .save(dir.join(name))
            .unwrap();
    }

    #[test]
    fn test_read_annotations() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "a.png");
        write_image(dir.path(), "b.png");
        let csv = write_csv(dir.path(), "a.png,0,extra\nb.png, 1\n");
        let rows = read_annotations(&csv, dir.path(), 2).unwrap();
        assert_eq!(
            rows,
            vec![
                Annotation {
                    image: dir.path().join("a.png"),
                    label: 0
                },
                Annotation {
                    image: dir.path().join("b.png"),
                    label: 1
                },
            ]
        );
    }

    #[test]
    fn test_missing_image_names_the_row() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "a.png");
        let csv = write_csv(dir.path(), "a.png,0\nnope.png,1\n");
        match read_annotations(&csv, dir.path(), 2) {
            Err(Error::MissingImage { row, image, .. }) => {
                assert_eq!(row, 3);
                assert_eq!(image, dir.path().join("nope.png"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_row_follows_quoted_newlines() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "a.png");
        let csv = write_csv(dir.path(), "a.png,0,\"first line\nsecond line\"\nnope.png,1\n");
        match read_annotations(&csv, dir.path(), 2) {
            Err(Error::MissingImage { row, .. }) => assert_eq!(row, 4),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_bad_labels_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "a.png");
        let csv = write_csv(dir.path(), "a.png,2\n");
        assert!(matches!(
            read_annotations(&csv, dir.path(), 2),
            Err(Error::InvalidLabel { label: 2, .. })
        ));
        let csv = write_csv(dir.path(), "a.png,fake\n");
        assert!(matches!(
            read_annotations(&csv, dir.path(), 2),
            Err(Error::MalformedRow { row: 2, .. })
        ));
        let csv = write_csv(dir.path(), "a.png\n");
        assert!(matches!(
            read_annotations(&csv, dir.path(), 2),
            Err(Error::MalformedRow { .. })
        ));
    }

    #[test]
    fn test_empty_split_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let csv = write_csv(dir.path(), "");
        assert!(matches!(
            FakedditDataset::from_csv("valid", &csv, dir.path(), 2, Transform::valid(8)),
            Err(Error::EmptySplit { split: "valid", .. })
        ));
    }

    #[test]
    fn test_dataset_get_and_batch() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "a.png");
        write_image(dir.path(), "b.jpg");
        let csv = write_csv(dir.path(), "a.png,0\nb.jpg,1\n");
        let dataset =
            FakedditDataset::from_csv("train", &csv, dir.path(), 2, Transform::train(8, 0.5))
                .unwrap();
        assert_eq!(dataset.len(), 2);
        assert!(dataset.get(2).is_none());

        let items = (0..2).filter_map(|i| dataset.get(i)).collect::<Vec<_>>();
        assert!(items.iter().all(|item| item.image.len() == 3 * 8 * 8));

        let batch = FakedditBatcher::<TestBackend>::new(Default::default(), 8).batch(items);
        assert_eq!(batch.images.dims(), [2, 3, 8, 8]);
        assert_eq!(batch.targets.dims(), [2]);
        assert_eq!(
            batch.paths,
            vec![dir.path().join("a.png"), dir.path().join("b.jpg")]
        );
        assert_eq!(
            batch.targets.into_data().to_vec::<i64>().unwrap(),
            vec![0, 1]
        );
    }
}
