use crate::encoding::{SemanticForm, VectorCapacity};
use crate::filter::MAX_TRAINABLE_CHARS;
use crate::semantics::SemanticSource;
use crate::utils::{parse_device, parse_number};
use anyhow::{anyhow, Result};
use tch::Device;

pub const DEFAULT_ANNOTATIONS_PATH: &str = "./annotations/COCO_Text.json";
pub const DEFAULT_IMAGES_DIR: &str = "./images/train2014/";
pub const DEFAULT_FEATURES_DIR: &str = "./annotations/features";
pub const DEFAULT_TOKENIZER_FILE: &str = "./annotations/bert-base-uncased-tokenizer.json";
pub const DEFAULT_RESULTS_DIR: &str = "./results";

#[derive(Debug)]
pub struct TrainOptions<'a> {
    pub annotations_path: &'a str,
    pub images_dir: &'a str,
    pub features_dir: &'a str,
    pub tokenizer_file: &'a str,
    pub results_dir: &'a str,
    pub experiment: &'a str,
    pub model_file_path: Option<&'a str>,
    pub semantic_source: SemanticSource,
    pub semantic_form: SemanticForm,
    pub encode_frequency: bool,
    pub capacity: VectorCapacity,
    pub max_text_length: usize,
    pub batch_size: usize,
    pub epoch: usize,
    pub workers: usize,
    pub device: Device,
    pub learning_rate: f64,
    pub lr_step: usize,
    pub lr_gamma: f64,
    pub clip_norm: f64,
    pub best_accuracy: f64,
    pub seed: i64,
}

impl Default for TrainOptions<'_> {
    fn default() -> Self {
        let semantic_form = SemanticForm::SparseFrequency;
        Self {
            annotations_path: DEFAULT_ANNOTATIONS_PATH,
            images_dir: DEFAULT_IMAGES_DIR,
            features_dir: DEFAULT_FEATURES_DIR,
            tokenizer_file: DEFAULT_TOKENIZER_FILE,
            results_dir: DEFAULT_RESULTS_DIR,
            experiment: "baseline",
            model_file_path: None,
            semantic_source: SemanticSource::VisualGenome,
            semantic_form,
            encode_frequency: false,
            capacity: semantic_form.default_capacity(),
            max_text_length: 25,
            batch_size: 32,
            epoch: 20,
            workers: 0,
            device: Device::cuda_if_available(),
            learning_rate: 1e-4,
            lr_step: 5,
            lr_gamma: 0.1,
            clip_norm: 2.,
            best_accuracy: 59.,
            seed: 0,
        }
    }
}

impl<'a> TrainOptions<'a> {
    pub fn new(args: &'a clap::ArgMatches) -> Result<Self> {
        let mut opts = Self::default();
        if let Some(path) = args.value_of("annotations") {
            opts.annotations_path = path;
        }
        if let Some(dir) = args.value_of("images-dir") {
            opts.images_dir = dir;
        }
        if let Some(dir) = args.value_of("features-dir") {
            opts.features_dir = dir;
        }
        if let Some(path) = args.value_of("tokenizer-file") {
            opts.tokenizer_file = path;
        }
        if let Some(dir) = args.value_of("results-dir") {
            opts.results_dir = dir;
        }
        if let Some(name) = args.value_of("experiment") {
            opts.experiment = name;
        }
        opts.model_file_path = args.value_of("model-file");
        if let Some(source) = args.value_of("semantic-source") {
            opts.semantic_source = source.parse()?;
        }
        if let Some(form) = args.value_of("semantic-form") {
            opts.semantic_form = form.parse()?;
            opts.capacity = opts.semantic_form.default_capacity();
        }
        if args.is_present("encode-frequency") {
            opts.encode_frequency = true;
        }
        if let Some(len) = args.value_of("overlap-length") {
            opts.capacity.overlap = parse_number(len, "overlap vector length")?;
        }
        if let Some(len) = args.value_of("scene-length") {
            opts.capacity.scene = parse_number(len, "scene vector length")?;
        }
        if let Some(len) = args.value_of("max-text-length") {
            opts.max_text_length = parse_number(len, "max text length")?;
            if opts.max_text_length < MAX_TRAINABLE_CHARS {
                return Err(anyhow!(
                    "max text length {} is below the {} characters a train label may have",
                    opts.max_text_length,
                    MAX_TRAINABLE_CHARS
                ));
            }
        }
        if let Some(size) = args.value_of("batch-size") {
            opts.batch_size = parse_number(size, "batch size")?;
        }
        if let Some(epoch) = args.value_of("epoch") {
            opts.epoch = parse_number(epoch, "epoch")?;
        }
        if let Some(workers) = args.value_of("workers") {
            opts.workers = parse_number(workers, "workers")?;
        }
        if let Some(device) = args.value_of("device") {
            opts.device = parse_device(device)?;
        }
        if let Some(lr) = args.value_of("learning-rate") {
            opts.learning_rate = parse_number(lr, "learning rate")?;
        }
        if let Some(step) = args.value_of("lr-step") {
            opts.lr_step = parse_number(step, "learning rate step")?;
        }
        if let Some(gamma) = args.value_of("lr-gamma") {
            opts.lr_gamma = parse_number(gamma, "learning rate gamma")?;
        }
        if let Some(norm) = args.value_of("clip-norm") {
            opts.clip_norm = parse_number(norm, "gradient clipping norm")?;
        }
        if let Some(acc) = args.value_of("best-accuracy") {
            opts.best_accuracy = parse_number(acc, "best accuracy")?;
        }
        if let Some(seed) = args.value_of("seed") {
            opts.seed = parse_number(seed, "seed")?;
        }

        Ok(opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::train_subcommand;
    use clap::App;

    fn parse(args: &[&str]) -> clap::ArgMatches<'static> {
        let mut argv = vec!["cocotext-semantic", "train"];
        argv.extend_from_slice(args);
        App::new("cocotext-semantic")
            .subcommand(train_subcommand())
            .get_matches_from(argv)
            .subcommand_matches("train")
            .cloned()
            .unwrap()
    }

    #[test]
    fn defaults_without_arguments() -> Result<()> {
        let matches = parse(&[]);
        let opts = TrainOptions::new(&matches)?;
        assert_eq!(opts.semantic_form, SemanticForm::SparseFrequency);
        assert_eq!(opts.capacity, VectorCapacity { overlap: 20, scene: 70 });
        assert_eq!(opts.max_text_length, 25);
        assert_eq!(opts.best_accuracy, 59.);
        assert!(opts.model_file_path.is_none());
        Ok(())
    }

    #[test]
    fn semantic_form_selects_capacity() -> Result<()> {
        let matches = parse(&["--semantic-form", "BERT", "--semantic-source", "COCO"]);
        let opts = TrainOptions::new(&matches)?;
        assert_eq!(opts.semantic_form, SemanticForm::TokenSequence);
        assert_eq!(opts.semantic_source, SemanticSource::Coco);
        assert_eq!(opts.capacity, VectorCapacity { overlap: 20, scene: 60 });
        Ok(())
    }

    #[test]
    fn explicit_lengths_override_form_defaults() -> Result<()> {
        let matches = parse(&["--semantic-form", "FREQ", "--scene-length", "90", "--epoch", "3"]);
        let opts = TrainOptions::new(&matches)?;
        assert_eq!(opts.capacity.scene, 90);
        assert_eq!(opts.capacity.overlap, 20);
        assert_eq!(opts.epoch, 3);
        Ok(())
    }

    #[test]
    fn unknown_selector_is_rejected() {
        let matches = parse(&["--semantic-source", "IMAGENET"]);
        let err = TrainOptions::new(&matches).unwrap_err();
        assert!(err.to_string().contains("IMAGENET"));
    }

    #[test]
    fn max_text_length_covers_trainable_labels() -> Result<()> {
        assert_eq!(TrainOptions::new(&parse(&["--max-text-length", "30"]))?.max_text_length, 30);
        assert!(TrainOptions::new(&parse(&["--max-text-length", "25"])).is_ok());
        let err = TrainOptions::new(&parse(&["--max-text-length", "10"])).unwrap_err();
        assert!(err.to_string().contains("max text length 10"));
        Ok(())
    }

    #[test]
    fn malformed_number_is_rejected() {
        let matches = parse(&["--batch-size", "many"]);
        assert!(TrainOptions::new(&matches).is_err());
    }
}
