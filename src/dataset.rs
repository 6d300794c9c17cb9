use crate::annotations::{AnnotationIndex, Split, TextAnnotation};
use crate::converter::LabelConverter;
use crate::encoding::{SemanticEncoder, VectorKind};
use crate::error::{PipelineError, PipelineResult};
use crate::filter::{in_split, is_legible, passes_split_rule};
use crate::image_ops;
use crate::semantics::{ObjectCounts, SemanticResources};
use log::{info, warn};
use rayon::prelude::*;
use rayon::ThreadPool;
use std::path::{Path, PathBuf};
use tch::{Device, Kind, Tensor};

/// An annotation admitted to a dataset together with everything needed to
/// materialize it later.
#[derive(Debug, Clone)]
pub struct DatasetEntry {
    pub annotation: TextAnnotation,
    pub ground_truth: String,
    pub img_path: PathBuf,
    pub scene: ObjectCounts,
    pub overlap: ObjectCounts,
}

/// A model ready sample. `image` is `[1, 32, 100]` float, the two semantic
/// vectors are 1-D int64 of the dataset's fixed lengths.
#[derive(Debug)]
pub struct Sample {
    pub image_path: PathBuf,
    pub image: Tensor,
    pub ground_truth: String,
    pub scene: Tensor,
    pub overlap: Tensor,
}

/// The filtered annotations of one split. Membership is decided once when
/// the dataset is built, samples are materialized on every access.
#[derive(Debug)]
pub struct AnnotationsDataset {
    split: Split,
    entries: Vec<DatasetEntry>,
    encoder: SemanticEncoder,
}

impl AnnotationsDataset {
    pub fn build(
        split: Split,
        index: &AnnotationIndex,
        semantics: &SemanticResources,
        image_dir: &Path,
        encoder: SemanticEncoder,
    ) -> PipelineResult<Self> {
        let mut entries = Vec::new();
        for annotation in index.annotations.values() {
            if !is_legible(annotation) || !in_split(annotation, index, split)? {
                continue;
            }
            let image = index.image_of(annotation)?;
            let scene = semantics.scene(annotation.image_id, annotation.id)?;
            let overlap = semantics.overlap(annotation.image_id, annotation.id)?;
            if !passes_split_rule(split, annotation)? {
                continue;
            }
            let ground_truth = annotation.utf8_string.clone().ok_or_else(|| {
                PipelineError::data_format(
                    format!("annotation {}", annotation.id),
                    "legible annotation without utf8_string",
                )
            })?;
            entries.push(DatasetEntry {
                annotation: annotation.clone(),
                ground_truth,
                img_path: image_dir.join(&image.file_name),
                scene: scene.clone(),
                overlap: overlap.clone(),
            });
        }
        info!(
            "{} dataset: kept {} of {} annotations ({:?})",
            split,
            entries.len(),
            index.annotations.len(),
            encoder
        );
        Ok(AnnotationsDataset {
            split,
            entries,
            encoder,
        })
    }

    pub fn split(&self) -> Split {
        self.split
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[DatasetEntry] {
        &self.entries
    }

    pub fn encoder(&self) -> &SemanticEncoder {
        &self.encoder
    }

    /// Checks that every ground truth can become a decoder target, so an
    /// unencodable label stops the run before the first epoch.
    pub fn ensure_encodable(&self, converter: &LabelConverter) -> PipelineResult<()> {
        for entry in &self.entries {
            converter.text_ids(&entry.ground_truth).map_err(|err| {
                PipelineError::data_format(
                    format!(
                        "{} annotation {} ({})",
                        self.split(),
                        entry.annotation.id,
                        entry.img_path.display()
                    ),
                    format!(
                        "label is not a target of max length {}: {}",
                        converter.max_length(),
                        err
                    ),
                )
            })?;
        }
        Ok(())
    }

    pub fn get(&self, index: usize) -> PipelineResult<Sample> {
        let entry = self.entries.get(index).ok_or_else(|| {
            PipelineError::lookup("sample", index, format!("{} dataset", self.split))
        })?;
        let image = image_ops::load_text_crop(&entry.img_path, &entry.annotation.bbox)?;
        let scene = self.encode_vector(entry, &entry.scene, VectorKind::Scene)?;
        let overlap = self.encode_vector(entry, &entry.overlap, VectorKind::Overlap)?;
        Ok(Sample {
            image_path: entry.img_path.clone(),
            image,
            ground_truth: entry.ground_truth.clone(),
            scene,
            overlap,
        })
    }

    fn encode_vector(
        &self,
        entry: &DatasetEntry,
        counts: &ObjectCounts,
        kind: VectorKind,
    ) -> PipelineResult<Tensor> {
        let encoded = self.encoder.encode(counts, kind)?;
        if encoded.dropped > 0 {
            warn!(
                "capacity exceeded: {} {} vector of annotation {} has {} objects, {} entries dropped to fit {}",
                entry.img_path.display(),
                kind,
                entry.annotation.id,
                counts.total(),
                encoded.dropped,
                encoded.ids.len()
            );
        }
        Ok(Tensor::from_slice(&encoded.ids))
    }

    pub fn batch_iter(&self, batch_size: usize) -> BatchIter {
        BatchIter::new(self, batch_size)
    }

    pub fn num_batches(&self, batch_size: usize) -> usize {
        let batch_size = batch_size.max(1);
        (self.len() + batch_size - 1) / batch_size
    }
}

/// Samples collated along a new leading batch dimension.
#[derive(Debug)]
pub struct Batch {
    pub image_paths: Vec<PathBuf>,
    pub images: Tensor,
    pub ground_truths: Vec<String>,
    pub scenes: Tensor,
    pub overlaps: Tensor,
}

impl Batch {
    pub fn collate(samples: Vec<Sample>) -> Batch {
        let mut image_paths = Vec::with_capacity(samples.len());
        let mut ground_truths = Vec::with_capacity(samples.len());
        let mut images = Vec::with_capacity(samples.len());
        let mut scenes = Vec::with_capacity(samples.len());
        let mut overlaps = Vec::with_capacity(samples.len());
        for sample in samples {
            image_paths.push(sample.image_path);
            ground_truths.push(sample.ground_truth);
            images.push(sample.image);
            scenes.push(sample.scene);
            overlaps.push(sample.overlap);
        }
        Batch {
            image_paths,
            images: Tensor::stack(&images, 0),
            ground_truths,
            scenes: Tensor::stack(&scenes, 0),
            overlaps: Tensor::stack(&overlaps, 0),
        }
    }

    pub fn len(&self) -> usize {
        self.ground_truths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ground_truths.is_empty()
    }
}

/// An iterator over mini-batches of a dataset.
///
/// Samples of a batch are materialized in parallel, on the given rayon pool
/// or on the global one.
pub struct BatchIter<'a> {
    dataset: &'a AnnotationsDataset,
    order: Vec<usize>,
    batch_index: usize,
    batch_size: usize,
    device: Device,
    return_smaller_last_batch: bool,
    pool: Option<&'a ThreadPool>,
}

impl<'a> BatchIter<'a> {
    pub fn new(dataset: &'a AnnotationsDataset, batch_size: usize) -> BatchIter<'a> {
        BatchIter {
            dataset,
            order: (0..dataset.len()).collect(),
            batch_index: 0,
            batch_size: batch_size.max(1),
            device: Device::Cpu,
            return_smaller_last_batch: false,
            pool: None,
        }
    }

    /// Shuffles the dataset.
    ///
    /// The iterator would still run over the whole dataset but the order in
    /// which elements are grouped in mini-batches is randomized.
    pub fn shuffle(&mut self) -> &mut BatchIter<'a> {
        let total = self.order.len() as i64;
        let index = Tensor::randperm(total, (Kind::Int64, Device::Cpu));
        self.order = (0..total)
            .map(|i| index.int64_value(&[i]) as usize)
            .collect();
        self
    }

    /// Transfers the mini-batches to a specified device.
    #[allow(clippy::wrong_self_convention)]
    pub fn to_device(&mut self, device: Device) -> &mut BatchIter<'a> {
        self.device = device;
        self
    }

    /// When set, returns the last batch even if smaller than the batch size.
    pub fn return_smaller_last_batch(&mut self) -> &mut BatchIter<'a> {
        self.return_smaller_last_batch = true;
        self
    }

    pub fn with_pool(&mut self, pool: &'a ThreadPool) -> &mut BatchIter<'a> {
        self.pool = Some(pool);
        self
    }

    fn load(&self, indexes: &[usize]) -> PipelineResult<Vec<Sample>> {
        let dataset = self.dataset;
        let materialize = || {
            indexes
                .par_iter()
                .map(|&i| dataset.get(i))
                .collect::<PipelineResult<Vec<Sample>>>()
        };
        match self.pool {
            Some(pool) => pool.install(materialize),
            None => materialize(),
        }
    }
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = PipelineResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let total = self.order.len();
        let start = self.batch_index * self.batch_size;
        let size = self.batch_size.min(total.saturating_sub(start));
        if size == 0 || (!self.return_smaller_last_batch && size < self.batch_size) {
            return None;
        }
        self.batch_index += 1;
        let device = self.device;
        Some(self.load(&self.order[start..start + size]).map(|samples| {
            let batch = Batch::collate(samples);
            Batch {
                images: batch.images.to_device(device),
                scenes: batch.scenes.to_device(device),
                overlaps: batch.overlaps.to_device(device),
                ..batch
            }
        }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::annotations::Legibility;
    use crate::encoding::SemanticForm;
    use crate::filter::{is_english, is_trainable_text};
    use crate::semantics::{load_stats, ObjectStats, ObjectVocabulary, SemanticSource};
    use anyhow::Result;
    use image::{GrayImage, Luma};
    use std::convert::TryFrom;

    pub(crate) fn fixture_index() -> AnnotationIndex {
        AnnotationIndex::load("test_data/cocotext_sample.json").unwrap()
    }

    pub(crate) fn fixture_semantics() -> SemanticResources {
        SemanticResources {
            source: SemanticSource::Coco,
            vocabulary: ObjectVocabulary::load("test_data/classes.txt").unwrap(),
            stats: load_stats("test_data/frequency.json").unwrap(),
        }
    }

    pub(crate) fn sparse_encoder(vocabulary_len: usize) -> SemanticEncoder {
        SemanticEncoder::SparseFrequency {
            vocabulary_len,
            capacity: SemanticForm::SparseFrequency.default_capacity(),
        }
    }

    /// Writes a 64x48 image for every image of the index into a fresh
    /// directory under the system temp dir.
    pub(crate) fn fixture_image_dir(name: &str, index: &AnnotationIndex) -> Result<PathBuf> {
        let dir = std::env::temp_dir().join(format!("cocotext_semantic_{}", name));
        std::fs::create_dir_all(&dir)?;
        for image in index.images.values() {
            GrayImage::from_fn(64, 48, |x, y| Luma([(x * 3 + y) as u8]))
                .save(dir.join(&image.file_name))?;
        }
        Ok(dir)
    }

    fn ids(dataset: &AnnotationsDataset) -> Vec<u64> {
        dataset.entries().iter().map(|e| e.annotation.id).collect()
    }

    #[test]
    fn train_dataset_membership() -> Result<()> {
        let index = fixture_index();
        let semantics = fixture_semantics();
        let dataset = AnnotationsDataset::build(
            Split::Train,
            &index,
            &semantics,
            Path::new("images"),
            sparse_encoder(semantics.vocabulary.len()),
        )?;
        assert_eq!(ids(&dataset), vec![1001, 1004]);
        for entry in dataset.entries() {
            assert_eq!(entry.annotation.legibility, Legibility::Legible);
            assert_eq!(index.image_of(&entry.annotation)?.split, Split::Train);
            assert!(is_trainable_text(&entry.ground_truth));
        }
        assert_eq!(
            dataset.entries()[0].img_path,
            Path::new("images/COCO_train2014_000000000001.jpg")
        );
        Ok(())
    }

    #[test]
    fn unencodable_train_label_names_its_annotation() -> Result<()> {
        let mut index = fixture_index();
        if let Some(ann) = index.annotations.get_mut(&1004) {
            ann.utf8_string = Some("Café".to_string());
        }
        let semantics = fixture_semantics();
        let dataset = AnnotationsDataset::build(
            Split::Train,
            &index,
            &semantics,
            Path::new("images"),
            SemanticEncoder::None,
        )?;
        // the text filter admits it, the decoder charset does not
        assert_eq!(ids(&dataset), vec![1001, 1004]);
        let err = dataset
            .ensure_encodable(&LabelConverter::new(25))
            .unwrap_err();
        assert!(matches!(err, PipelineError::DataFormat { .. }));
        let message = err.to_string();
        assert!(message.contains("annotation 1004"), "{}", message);
        assert!(message.contains("COCO_train2014_000000000002.jpg"), "{}", message);
        Ok(())
    }

    #[test]
    fn short_converter_rejects_long_train_label() -> Result<()> {
        let index = fixture_index();
        let dataset = AnnotationsDataset::build(
            Split::Train,
            &index,
            &fixture_semantics(),
            Path::new("images"),
            SemanticEncoder::None,
        )?;
        dataset.ensure_encodable(&LabelConverter::new(25))?;
        let err = dataset.ensure_encodable(&LabelConverter::new(3)).unwrap_err();
        assert!(err.to_string().contains("annotation 1001"));
        Ok(())
    }

    #[test]
    fn val_dataset_membership() -> Result<()> {
        let index = fixture_index();
        let semantics = fixture_semantics();
        let dataset = AnnotationsDataset::build(
            Split::Val,
            &index,
            &semantics,
            Path::new("images"),
            sparse_encoder(semantics.vocabulary.len()),
        )?;
        // "two words" is not trainable but val only checks the language
        assert_eq!(ids(&dataset), vec![1005, 1007]);
        for entry in dataset.entries() {
            assert_eq!(entry.annotation.legibility, Legibility::Legible);
            assert_eq!(index.image_of(&entry.annotation)?.split, Split::Val);
            assert!(is_english(&entry.annotation));
        }
        Ok(())
    }

    #[test]
    fn missing_stats_abort_construction() {
        let index = fixture_index();
        let mut semantics = fixture_semantics();
        semantics.stats.remove(&2);
        let err = AnnotationsDataset::build(
            Split::Train,
            &index,
            &semantics,
            Path::new("images"),
            SemanticEncoder::None,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Lookup { .. }));
    }

    #[test]
    fn missing_overlap_of_filtered_text_still_aborts() {
        let index = fixture_index();
        let mut semantics = fixture_semantics();
        // 1003 is rejected by the text rule, but only after the join
        semantics.stats.get_mut(&2).unwrap().overlap.remove(&1003);
        let err = AnnotationsDataset::build(
            Split::Train,
            &index,
            &semantics,
            Path::new("images"),
            SemanticEncoder::None,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Lookup { .. }));
    }

    #[test]
    fn illegible_annotations_are_never_joined() -> Result<()> {
        let index = fixture_index();
        let mut semantics = fixture_semantics();
        semantics.stats.get_mut(&1).unwrap().overlap.remove(&1002);
        let dataset = AnnotationsDataset::build(
            Split::Train,
            &index,
            &semantics,
            Path::new("images"),
            SemanticEncoder::None,
        )?;
        assert_eq!(dataset.len(), 2);
        Ok(())
    }

    #[test]
    fn sparse_sample_materialization() -> Result<()> {
        let index = fixture_index();
        let semantics = fixture_semantics();
        let dir = fixture_image_dir("sparse_sample", &index)?;
        let dataset = AnnotationsDataset::build(
            Split::Train,
            &index,
            &semantics,
            &dir,
            sparse_encoder(semantics.vocabulary.len()),
        )?;
        let sample = dataset.get(0)?;
        assert_eq!(sample.ground_truth, "STOP");
        assert_eq!(sample.image.size(), vec![1, 32, 100]);
        assert_eq!(sample.scene.size(), vec![70]);
        assert_eq!(sample.overlap.size(), vec![20]);
        let scene = Vec::<i64>::try_from(&sample.scene)?;
        assert_eq!(&scene[..4], &[3, 3, 0, 0]);
        assert!(scene[3..].iter().all(|&id| id == 0));
        assert_eq!(Vec::<i64>::try_from(&sample.overlap)?[..2], [2, 0]);
        assert!(dataset.get(2).is_err());
        Ok(())
    }

    #[test]
    fn overflowing_scene_is_truncated_not_rejected() -> Result<()> {
        let index = fixture_index();
        let mut semantics = fixture_semantics();
        let crowded = ObjectStats {
            scene: ObjectCounts::new(vec![(4, 65), (2, 10)]),
            overlap: vec![(1003, ObjectCounts::default()), (1004, ObjectCounts::default())]
                .into_iter()
                .collect(),
        };
        semantics.stats.insert(2, crowded);
        let dir = fixture_image_dir("crowded_scene", &index)?;
        let dataset = AnnotationsDataset::build(
            Split::Train,
            &index,
            &semantics,
            &dir,
            sparse_encoder(semantics.vocabulary.len()),
        )?;
        let sample = dataset.get(1)?;
        let scene = Vec::<i64>::try_from(&sample.scene)?;
        assert_eq!(scene.len(), 70);
        assert_eq!(scene.iter().filter(|&&id| id == 4).count(), 65);
        assert_eq!(scene.iter().filter(|&&id| id == 2).count(), 5);
        Ok(())
    }

    #[test]
    fn none_form_vectors_have_length_one() -> Result<()> {
        let index = fixture_index();
        let dir = fixture_image_dir("none_form", &index)?;
        let dataset = AnnotationsDataset::build(
            Split::Val,
            &index,
            &fixture_semantics(),
            &dir,
            SemanticEncoder::None,
        )?;
        let sample = dataset.get(1)?;
        assert_eq!(sample.ground_truth, "two words");
        assert_eq!(sample.scene.size(), vec![1]);
        assert_eq!(sample.overlap.size(), vec![1]);
        Ok(())
    }

    #[test]
    fn batches_cover_dataset_once() -> Result<()> {
        let index = fixture_index();
        let semantics = fixture_semantics();
        let dir = fixture_image_dir("batches", &index)?;
        let dataset = AnnotationsDataset::build(
            Split::Val,
            &index,
            &semantics,
            &dir,
            sparse_encoder(semantics.vocabulary.len()),
        )?;
        assert_eq!(dataset.num_batches(1), 2);
        assert_eq!(dataset.num_batches(5), 1);

        assert_eq!(dataset.batch_iter(5).count(), 0);

        let mut seen = Vec::new();
        for batch in dataset.batch_iter(5).shuffle().return_smaller_last_batch() {
            let batch = batch?;
            assert_eq!(batch.images.size(), vec![2, 1, 32, 100]);
            assert_eq!(batch.scenes.size(), vec![2, 70]);
            assert_eq!(batch.overlaps.size(), vec![2, 20]);
            seen.extend(batch.ground_truths);
        }
        seen.sort();
        assert_eq!(seen, vec!["stop", "two words"]);
        Ok(())
    }

    #[test]
    fn batches_on_dedicated_pool() -> Result<()> {
        let index = fixture_index();
        let dir = fixture_image_dir("pool", &index)?;
        let dataset = AnnotationsDataset::build(
            Split::Train,
            &index,
            &fixture_semantics(),
            &dir,
            SemanticEncoder::None,
        )?;
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build()?;
        let batches = dataset
            .batch_iter(1)
            .with_pool(&pool)
            .collect::<PipelineResult<Vec<Batch>>>()?;
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].ground_truths, vec!["STOP"]);
        assert_eq!(batches[1].ground_truths, vec!["Cafe"]);
        Ok(())
    }
}
