pub mod ledger;
pub mod model;
pub mod options;
pub mod report;

use crate::annotations::{AnnotationIndex, Split};
use crate::converter::LabelConverter;
use crate::dataset::{AnnotationsDataset, Batch};
use crate::encoding::{load_tokenizer, SemanticEncoder, SemanticForm};
use crate::error::PipelineResult;
use crate::semantics::SemanticResources;
use crate::utils::{round_to, GO_ID, NUM_CLASSES};
use anyhow::{anyhow, Context, Result};
use itertools::izip;
use ledger::ValidationLedger;
use log::{debug, info};
use model::{Predictor, SemanticRecognizer};
use options::TrainOptions;
use report::{save_checkpoint, TrainingLog};
use std::path::Path;
use tch::{nn, nn::OptimizerConfig, Device, Kind, Reduction, Tensor};

/// Cross entropy of `[B, T, C]` logits against `[B, T]` class ids, the
/// `[GO]` padding class excluded.
pub fn sequence_loss(logits: &Tensor, target: &Tensor) -> Tensor {
    logits
        .reshape([-1, NUM_CLASSES])
        .cross_entropy_loss::<Tensor>(&target.reshape([-1]), None, Reduction::Mean, GO_ID, 0.)
}

/// One teacher forced pass over `batches`. Returns the average batch cost.
pub fn train_epoch<P, I>(
    predictor: &P,
    opt: &mut nn::Optimizer,
    batches: I,
    converter: &LabelConverter,
    clip_norm: f64,
    device: Device,
) -> Result<f64>
where
    P: Predictor,
    I: Iterator<Item = PipelineResult<Batch>>,
{
    let steps = converter.steps();
    let mut cost_sum = 0.;
    let mut batch_count = 0usize;
    for batch in batches {
        let batch = batch?;
        let text = converter.encode(&batch.ground_truths)?.to_device(device);
        let decoder_input = text.narrow(1, 0, steps);
        let target = text.narrow(1, 1, steps);
        let logits = predictor.predict(
            &batch.images,
            &decoder_input,
            &batch.scenes,
            &batch.overlaps,
            true,
        );
        let cost = sequence_loss(&logits, &target);
        opt.backward_step_clip_norm(&cost, clip_norm);
        cost_sum += cost.double_value(&[]);
        batch_count += 1;
    }
    if batch_count == 0 {
        return Ok(0.);
    }
    Ok(round_to(cost_sum / batch_count as f64, 5))
}

#[derive(Debug)]
pub struct ValidationReport {
    pub accuracy: f64,
    pub case_insensitive_accuracy: f64,
    pub loss: f64,
    pub ledger: ValidationLedger,
}

/// Free running decoding over `batches`, scored against the ground truths.
pub fn validate<P, I>(
    predictor: &P,
    batches: I,
    converter: &LabelConverter,
    device: Device,
) -> Result<ValidationReport>
where
    P: Predictor,
    I: Iterator<Item = PipelineResult<Batch>>,
{
    let steps = converter.steps();
    let mut ledger = ValidationLedger::new();
    let mut loss_sum = 0.;
    let mut batch_count = 0usize;
    tch::no_grad(|| -> Result<()> {
        for batch in batches {
            let batch = batch?;
            let batch_size = batch.len() as i64;
            let decoder_input = Tensor::zeros([batch_size, steps], (Kind::Int64, device));
            let logits = predictor.predict(
                &batch.images,
                &decoder_input,
                &batch.scenes,
                &batch.overlaps,
                false,
            );
            let target = converter
                .encode_lossy(&batch.ground_truths)
                .narrow(1, 1, steps)
                .to_device(device);
            loss_sum += sequence_loss(&logits, &target).double_value(&[]);
            batch_count += 1;

            let predicted_ids = logits.argmax(2, false).to_device(Device::Cpu);
            let predictions = converter.decode_batch(&predicted_ids)?;
            for (i, ground_truth, prediction, image_path) in izip!(
                0..,
                &batch.ground_truths,
                &predictions,
                &batch.image_paths
            ) {
                if i == 0 {
                    debug!(
                        "{}: gt {:?} pred {:?}",
                        image_path.display(),
                        ground_truth,
                        prediction
                    );
                }
                ledger.observe(ground_truth, prediction);
            }
        }
        Ok(())
    })?;

    let loss = if batch_count == 0 {
        0.
    } else {
        round_to(loss_sum / batch_count as f64, 5)
    };
    Ok(ValidationReport {
        accuracy: ledger.case_sensitive_accuracy(),
        case_insensitive_accuracy: ledger.case_insensitive_accuracy(),
        loss,
        ledger,
    })
}

/// Multiplies the learning rate by `gamma` every `step_size` epochs.
#[derive(Debug, Clone, Copy)]
pub struct StepLr {
    base_lr: f64,
    step_size: usize,
    gamma: f64,
    epoch: usize,
}

impl StepLr {
    pub fn new(base_lr: f64, step_size: usize, gamma: f64) -> Self {
        StepLr {
            base_lr,
            step_size,
            gamma,
            epoch: 0,
        }
    }

    pub fn current(&self) -> f64 {
        if self.step_size == 0 {
            return self.base_lr;
        }
        self.base_lr * self.gamma.powi((self.epoch / self.step_size) as i32)
    }

    /// Advances one epoch and returns the new learning rate.
    pub fn step(&mut self) -> f64 {
        self.epoch += 1;
        self.current()
    }
}

/// Tracks the best case sensitive accuracy. Only strict improvements count.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointPolicy {
    best: f64,
}

impl CheckpointPolicy {
    pub fn new(baseline: f64) -> Self {
        CheckpointPolicy { best: baseline }
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    /// Returns true and records `accuracy` when it beats the best so far.
    pub fn improves(&mut self, accuracy: f64) -> bool {
        if accuracy > self.best {
            self.best = accuracy;
            true
        } else {
            false
        }
    }
}

fn build_encoder(opts: &TrainOptions, semantics: &SemanticResources) -> Result<SemanticEncoder> {
    let capacity = opts.capacity;
    Ok(match opts.semantic_form {
        SemanticForm::TokenSequence => SemanticEncoder::TokenSequence {
            tokenizer: load_tokenizer(opts.tokenizer_file)?,
            vocabulary: semantics.vocabulary.clone(),
            encode_frequency: opts.encode_frequency,
            capacity,
        },
        SemanticForm::SparseFrequency => SemanticEncoder::SparseFrequency {
            vocabulary_len: semantics.vocabulary.len(),
            capacity,
        },
        SemanticForm::None => SemanticEncoder::None,
    })
}

pub fn run_training(opts: &TrainOptions) -> Result<()> {
    tch::manual_seed(opts.seed);
    info!("training {:?}", opts);

    let index = measure_time!(
        "loading annotations",
        || AnnotationIndex::load(opts.annotations_path),
        LogType::Info
    )?;
    let semantics = measure_time!(
        "loading semantic features",
        || SemanticResources::load(opts.semantic_source, opts.features_dir),
        LogType::Debug
    )?;
    info!(
        "{:?} semantics: {} object labels, stats of {} images",
        semantics.source,
        semantics.vocabulary.len(),
        semantics.stats.len()
    );
    let encoder = build_encoder(opts, &semantics)?;
    let images_dir = Path::new(opts.images_dir);
    let (train_set, val_set) = measure_time!(
        "building datasets",
        || -> Result<_> {
            let train =
                AnnotationsDataset::build(Split::Train, &index, &semantics, images_dir, encoder.clone())?;
            let val = AnnotationsDataset::build(Split::Val, &index, &semantics, images_dir, encoder)?;
            Ok((train, val))
        },
        LogType::Info
    )?;
    let converter = LabelConverter::new(opts.max_text_length);
    train_set.ensure_encodable(&converter)?;
    info!(
        "{} train batches, {} val batches",
        train_set.num_batches(opts.batch_size),
        val_set.num_batches(opts.batch_size)
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.workers)
        .build()?;

    let mut vs = nn::VarStore::new(opts.device);
    let net = SemanticRecognizer::new(&vs.root(), train_set.encoder().id_space() as i64);
    if let Some(model_file) = opts.model_file_path {
        if !Path::new(model_file).exists() {
            return Err(anyhow!("Model file {} doesn't exist", model_file));
        }
        vs.load(model_file)
            .with_context(|| format!("loading weights from {}", model_file))?;
        info!("resumed from {}", model_file);
    }
    let mut opt = nn::AdamW::default().build(&vs, opts.learning_rate)?;
    let mut scheduler = StepLr::new(opts.learning_rate, opts.lr_step, opts.lr_gamma);
    let mut policy = CheckpointPolicy::new(opts.best_accuracy);
    let mut training_log = TrainingLog::new(opts.results_dir, opts.experiment);

    let baseline = validate(
        &net,
        val_set
            .batch_iter(opts.batch_size)
            .shuffle()
            .to_device(opts.device)
            .return_smaller_last_batch()
            .with_pool(&pool),
        &converter,
        opts.device,
    )?;
    info!(
        "epoch: {:4} cost avg: {:>8} val acc: {:8.5} val loss: {:8.5}",
        0,
        report::NOT_AVAILABLE,
        baseline.accuracy,
        baseline.loss
    );
    training_log.push(0, None, baseline.accuracy, baseline.loss)?;

    for epoch in 1..=opts.epoch {
        let cost_avg = measure_time!(
            format!("training epoch {}", epoch),
            || {
                train_epoch(
                    &net,
                    &mut opt,
                    train_set
                        .batch_iter(opts.batch_size)
                        .shuffle()
                        .to_device(opts.device)
                        .return_smaller_last_batch()
                        .with_pool(&pool),
                    &converter,
                    opts.clip_norm,
                    opts.device,
                )
            },
            LogType::Info
        )?;
        let report = validate(
            &net,
            val_set
                .batch_iter(opts.batch_size)
                .shuffle()
                .to_device(opts.device)
                .return_smaller_last_batch()
                .with_pool(&pool),
            &converter,
            opts.device,
        )?;
        opt.set_lr(scheduler.step());

        info!(
            "epoch: {:4} cost avg: {:8.5} val acc: {:8.5} (case insensitive {:8.5}) val loss: {:8.5}",
            epoch, cost_avg, report.accuracy, report.case_insensitive_accuracy, report.loss
        );
        training_log.push(epoch, Some(cost_avg), report.accuracy, report.loss)?;

        if policy.improves(report.accuracy) {
            save_checkpoint(&vs, &report.ledger, opts.results_dir, opts.experiment, epoch)?;
        }
    }
    info!(
        "best val acc: {:8.5}, training log at {}",
        policy.best(),
        training_log.path().display()
    );

    Ok(())
}
