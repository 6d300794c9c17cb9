use crate::encoding::PAD_ID;
use crate::utils::NUM_CLASSES;
use tch::nn::{self, RNN};
use tch::{Kind, Tensor};

const FEATURE_DIM: i64 = 128;
const SEMANTIC_DIM: i64 = 128;
const CHAR_EMBEDDING_DIM: i64 = 64;
const HIDDEN_DIM: i64 = 256;

/// The recognizer contract used by training and validation.
///
/// `images` is `[B, 1, 32, 100]`, `decoder_input` `[B, T]` class ids and the
/// two semantic vectors `[B, L]` ids. Returns `[B, T, NUM_CLASSES]` logits.
/// With `teacher_forcing` off only the first decoder input column is read
/// and every later step consumes the previous prediction.
pub trait Predictor {
    fn predict(
        &self,
        images: &Tensor,
        decoder_input: &Tensor,
        scenes: &Tensor,
        overlaps: &Tensor,
        teacher_forcing: bool,
    ) -> Tensor;
}

#[derive(Debug)]
pub struct SemanticRecognizer {
    conv1: nn::Conv2D,
    conv2: nn::Conv2D,
    conv3: nn::Conv2D,
    scene_embedding: nn::Embedding,
    overlap_embedding: nn::Embedding,
    init_state: nn::Linear,
    attention_query: nn::Linear,
    char_embedding: nn::Embedding,
    gru: nn::GRU,
    classifier: nn::Linear,
}

impl SemanticRecognizer {
    /// `semantic_ids` is the size of the id space of the semantic vectors.
    pub fn new(vs: &nn::Path, semantic_ids: i64) -> SemanticRecognizer {
        let conv_cfg = nn::ConvConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1 = nn::conv2d(vs / "conv1", 1, 32, 3, conv_cfg);
        let conv2 = nn::conv2d(vs / "conv2", 32, 64, 3, conv_cfg);
        let conv3 = nn::conv2d(vs / "conv3", 64, FEATURE_DIM, 3, conv_cfg);
        let semantic_ids = semantic_ids.max(1);
        let scene_embedding = nn::embedding(
            vs / "scene_embedding",
            semantic_ids,
            SEMANTIC_DIM,
            Default::default(),
        );
        let overlap_embedding = nn::embedding(
            vs / "overlap_embedding",
            semantic_ids,
            SEMANTIC_DIM,
            Default::default(),
        );
        let init_state = nn::linear(
            vs / "init_state",
            FEATURE_DIM + 2 * SEMANTIC_DIM,
            HIDDEN_DIM,
            Default::default(),
        );
        let attention_query = nn::linear(
            vs / "attention_query",
            HIDDEN_DIM,
            FEATURE_DIM,
            Default::default(),
        );
        let char_embedding = nn::embedding(
            vs / "char_embedding",
            NUM_CLASSES,
            CHAR_EMBEDDING_DIM,
            Default::default(),
        );
        let gru = nn::gru(
            vs / "gru",
            CHAR_EMBEDDING_DIM + FEATURE_DIM,
            HIDDEN_DIM,
            Default::default(),
        );
        let classifier = nn::linear(
            vs / "classifier",
            HIDDEN_DIM + FEATURE_DIM,
            NUM_CLASSES,
            Default::default(),
        );
        SemanticRecognizer {
            conv1,
            conv2,
            conv3,
            scene_embedding,
            overlap_embedding,
            init_state,
            attention_query,
            char_embedding,
            gru,
            classifier,
        }
    }

    /// `[B, 1, 32, 100]` -> `[B, 25, FEATURE_DIM]`, one feature per column.
    fn encode_image(&self, xs: &Tensor, train: bool) -> Tensor {
        xs.apply(&self.conv1)
            .relu()
            .max_pool2d_default(2)
            .apply(&self.conv2)
            .relu()
            .max_pool2d_default(2)
            .apply(&self.conv3)
            .relu()
            .mean_dim(2, false, Kind::Float)
            .permute([0, 2, 1])
            .dropout(0.1, train)
    }

    fn attend(&self, features: &Tensor, hidden: &Tensor) -> Tensor {
        let query = hidden.apply(&self.attention_query).unsqueeze(2);
        let weights = features.matmul(&query).softmax(1, Kind::Float);
        (features * weights).sum_dim_intlist(1, false, Kind::Float)
    }
}

/// Mean embedding of the non pad ids of every row.
fn pool_semantic(ids: &Tensor, embedding: &nn::Embedding) -> Tensor {
    let mask = ids.ne(PAD_ID).to_kind(Kind::Float).unsqueeze(-1);
    let summed = (ids.apply(embedding) * &mask).sum_dim_intlist(1, false, Kind::Float);
    let count = mask.sum_dim_intlist(1, false, Kind::Float).clamp_min(1.);
    summed / count
}

impl Predictor for SemanticRecognizer {
    fn predict(
        &self,
        images: &Tensor,
        decoder_input: &Tensor,
        scenes: &Tensor,
        overlaps: &Tensor,
        teacher_forcing: bool,
    ) -> Tensor {
        let features = self.encode_image(images, teacher_forcing);
        let context = Tensor::cat(
            &[
                features.mean_dim(1, false, Kind::Float),
                pool_semantic(scenes, &self.scene_embedding),
                pool_semantic(overlaps, &self.overlap_embedding),
            ],
            1,
        );
        let mut state = nn::GRUState(context.apply(&self.init_state).tanh().unsqueeze(0));

        let steps = decoder_input.size()[1];
        let mut previous = decoder_input.select(1, 0);
        let mut outputs = Vec::with_capacity(steps as usize);
        for t in 0..steps {
            let input_ids = if teacher_forcing {
                decoder_input.select(1, t)
            } else {
                previous.shallow_clone()
            };
            let attended = self.attend(&features, &state.0.get(0));
            let step_input = Tensor::cat(
                &[input_ids.apply(&self.char_embedding), attended.shallow_clone()],
                1,
            );
            state = self.gru.step(&step_input, &state);
            let logits = Tensor::cat(&[state.0.get(0), attended], 1).apply(&self.classifier);
            previous = logits.argmax(-1, false);
            outputs.push(logits);
        }
        Tensor::stack(&outputs, 1)
    }
}
