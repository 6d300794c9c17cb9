#[macro_use]
extern crate lazy_static;
extern crate log;
extern crate log4rs;
extern crate tch;

#[macro_use]
mod macros;
mod annotations;
mod converter;
mod dataset;
mod encoding;
mod error;
mod filter;
mod image_ops;
mod recognition;
mod semantics;
mod utils;

use anyhow::{anyhow, Result};
use clap::{App, AppSettings, Arg, SubCommand};
use recognition::options::TrainOptions;

fn value_arg(name: &'static str, help: &'static str) -> Arg<'static, 'static> {
    Arg::with_name(name)
        .long(name)
        .takes_value(true)
        .help(help)
}

pub(crate) fn train_subcommand() -> App<'static, 'static> {
    SubCommand::with_name("train")
        .about("Trains the semantic scene text recognizer on COCO-Text")
        .arg(value_arg("annotations", "COCO-Text annotations json"))
        .arg(value_arg("images-dir", "Directory with the COCO train2014 images"))
        .arg(value_arg(
            "features-dir",
            "Directory with the <vg|coco>_classes.txt and <vg|coco>_frequency.json files",
        ))
        .arg(value_arg("semantic-source", "Object detector of the semantic context (VG, COCO)"))
        .arg(value_arg(
            "semantic-form",
            "Encoding of the semantic context (TOKEN_SEQUENCE, SPARSE_FREQUENCY, NONE)",
        ))
        .arg(
            Arg::with_name("encode-frequency")
                .long("encode-frequency")
                .help("Repeats every object label by its count in token sequences"),
        )
        .arg(value_arg("tokenizer-file", "tokenizer.json used by the TOKEN_SEQUENCE form"))
        .arg(value_arg("overlap-length", "Length of the overlap vector"))
        .arg(value_arg("scene-length", "Length of the scene vector"))
        .arg(value_arg("max-text-length", "Maximum transcription length"))
        .arg(value_arg("batch-size", "Batch size"))
        .arg(value_arg("epoch", "Number of epochs"))
        .arg(value_arg("workers", "Data loading threads (0 = one per core)"))
        .arg(value_arg("device", "cpu, cuda or cuda:N"))
        .arg(value_arg("experiment", "Experiment name prefixing every artifact"))
        .arg(value_arg("results-dir", "Directory of the training log and checkpoints"))
        .arg(value_arg("model-file", "Weights to resume training from"))
        .arg(value_arg("learning-rate", "Initial learning rate"))
        .arg(value_arg("lr-step", "Epochs between learning rate decays"))
        .arg(value_arg("lr-gamma", "Learning rate decay factor"))
        .arg(value_arg("clip-norm", "Gradient clipping norm"))
        .arg(value_arg("best-accuracy", "Accuracy a checkpoint has to exceed"))
        .arg(value_arg("seed", "Random seed"))
}

fn main() -> Result<()> {
    log4rs::init_file("log4rs.yml", Default::default())?;

    let matches = App::new("cocotext-semantic")
        .about("Scene text recognition conditioned on the objects around the text")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(train_subcommand())
        .get_matches();

    match matches.subcommand() {
        ("train", Some(args)) => {
            let opts = TrainOptions::new(args)?;
            recognition::run_training(&opts)
        }
        (name, _) => Err(anyhow!("unknown subcommand '{}'", name)),
    }
}
