use crate::error::{PipelineError, PipelineResult};
use crate::semantics::{ObjectCounts, ObjectVocabulary};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

pub const PAD_ID: i64 = 0;
const LABEL_SEPARATOR: &str = " [SEP] ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemanticForm {
    TokenSequence,
    SparseFrequency,
    None,
}

impl SemanticForm {
    pub fn default_capacity(self) -> VectorCapacity {
        match self {
            SemanticForm::TokenSequence => VectorCapacity {
                overlap: 20,
                scene: 60,
            },
            SemanticForm::SparseFrequency => VectorCapacity {
                overlap: 20,
                scene: 70,
            },
            SemanticForm::None => VectorCapacity {
                overlap: 1,
                scene: 1,
            },
        }
    }
}

impl FromStr for SemanticForm {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "TOKEN_SEQUENCE" | "BERT" => Ok(SemanticForm::TokenSequence),
            "SPARSE_FREQUENCY" | "FREQ" => Ok(SemanticForm::SparseFrequency),
            "NONE" => Ok(SemanticForm::None),
            _ => Err(PipelineError::Configuration {
                option: "semantic form",
                value: s.to_string(),
                expected: "TOKEN_SEQUENCE (BERT), SPARSE_FREQUENCY (FREQ), NONE",
            }),
        }
    }
}

/// Fixed lengths of the two semantic vectors of every sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorCapacity {
    pub overlap: usize,
    pub scene: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorKind {
    Scene,
    Overlap,
}

impl fmt::Display for VectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VectorKind::Scene => write!(f, "scene"),
            VectorKind::Overlap => write!(f, "overlap"),
        }
    }
}

/// A padded id vector and how many entries did not fit into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedVector {
    pub ids: Vec<i64>,
    pub dropped: usize,
}

/// Subword tokenizer used for the token sequence form. It is loaded once and
/// shared read-only by every sample.
pub trait SequenceTokenizer: Send + Sync {
    /// Token ids of `text` including the model's special tokens, unpadded.
    fn encode_ids(&self, text: &str) -> PipelineResult<Vec<i64>>;
    fn pad_id(&self) -> i64;
    fn vocab_size(&self) -> usize;
}

impl SequenceTokenizer for tokenizers::Tokenizer {
    fn encode_ids(&self, text: &str) -> PipelineResult<Vec<i64>> {
        let encoding = self
            .encode(text, true)
            .map_err(|err| PipelineError::Tokenizer(err.to_string()))?;
        Ok(encoding.get_ids().iter().map(|&id| i64::from(id)).collect())
    }

    fn pad_id(&self) -> i64 {
        self.get_padding()
            .map(|params| params.pad_id)
            .or_else(|| self.token_to_id("[PAD]"))
            .map_or(PAD_ID, i64::from)
    }

    fn vocab_size(&self) -> usize {
        self.get_vocab_size(true)
    }
}

pub fn load_tokenizer<P: AsRef<Path>>(path: P) -> PipelineResult<Arc<dyn SequenceTokenizer>> {
    let path = path.as_ref();
    let tokenizer = tokenizers::Tokenizer::from_file(path).map_err(|err| {
        PipelineError::Tokenizer(format!("cannot load {}: {}", path.display(), err))
    })?;
    Ok(Arc::new(tokenizer))
}

/// The semantic conditioning of a dataset, chosen once when it is built.
#[derive(Clone)]
pub enum SemanticEncoder {
    TokenSequence {
        tokenizer: Arc<dyn SequenceTokenizer>,
        vocabulary: ObjectVocabulary,
        encode_frequency: bool,
        capacity: VectorCapacity,
    },
    SparseFrequency {
        vocabulary_len: usize,
        capacity: VectorCapacity,
    },
    None,
}

impl SemanticEncoder {
    pub fn capacity(&self) -> VectorCapacity {
        match self {
            SemanticEncoder::TokenSequence { capacity, .. }
            | SemanticEncoder::SparseFrequency { capacity, .. } => *capacity,
            SemanticEncoder::None => SemanticForm::None.default_capacity(),
        }
    }

    pub fn form(&self) -> SemanticForm {
        match self {
            SemanticEncoder::TokenSequence { .. } => SemanticForm::TokenSequence,
            SemanticEncoder::SparseFrequency { .. } => SemanticForm::SparseFrequency,
            SemanticEncoder::None => SemanticForm::None,
        }
    }

    /// Number of distinct ids the vectors can hold, pad included.
    pub fn id_space(&self) -> usize {
        match self {
            SemanticEncoder::TokenSequence { tokenizer, .. } => tokenizer.vocab_size(),
            SemanticEncoder::SparseFrequency { vocabulary_len, .. } => *vocabulary_len,
            SemanticEncoder::None => 1,
        }
    }

    pub fn encode(&self, counts: &ObjectCounts, kind: VectorKind) -> PipelineResult<EncodedVector> {
        let capacity = match kind {
            VectorKind::Scene => self.capacity().scene,
            VectorKind::Overlap => self.capacity().overlap,
        };
        match self {
            SemanticEncoder::TokenSequence {
                tokenizer,
                vocabulary,
                encode_frequency,
                ..
            } => {
                let sentence = label_sentence(counts, vocabulary, *encode_frequency)?;
                let ids = tokenizer.encode_ids(&sentence)?;
                Ok(truncate_and_pad(ids, capacity, tokenizer.pad_id()))
            }
            SemanticEncoder::SparseFrequency { .. } => {
                Ok(place_padded(&get_object_vector(counts), capacity))
            }
            SemanticEncoder::None => Ok(EncodedVector {
                ids: vec![PAD_ID],
                dropped: 0,
            }),
        }
    }
}

impl fmt::Debug for SemanticEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SemanticEncoder({:?}, {:?})", self.form(), self.capacity())
    }
}

/// Flattens object counts into class ids repeated by their count, in the
/// order of the counts: `{3: 2, 7: 1}` -> `[3, 3, 7]`.
pub fn get_object_vector(counts: &ObjectCounts) -> Vec<i64> {
    counts
        .entries()
        .iter()
        .flat_map(|&(class_id, count)| std::iter::repeat(i64::from(class_id)).take(count as usize))
        .collect()
}

/// Copies `ids` into a zero vector of length `capacity` starting at offset 0.
/// Ids past the capacity are dropped.
pub fn place_padded(ids: &[i64], capacity: usize) -> EncodedVector {
    let mut padded = vec![PAD_ID; capacity];
    let kept = ids.len().min(capacity);
    padded[..kept].copy_from_slice(&ids[..kept]);
    EncodedVector {
        ids: padded,
        dropped: ids.len() - kept,
    }
}

/// Joins the labels of the counted classes with `[SEP]`. The statistics are
/// keyed by detector class index, whose label sits one slot after it in the
/// vocabulary because of the background entry.
fn label_sentence(
    counts: &ObjectCounts,
    vocabulary: &ObjectVocabulary,
    encode_frequency: bool,
) -> PipelineResult<String> {
    let mut labels = Vec::new();
    for &(class_id, count) in counts.entries() {
        let index = class_id as usize + 1;
        let label = vocabulary.label(index).ok_or_else(|| {
            PipelineError::lookup("vocabulary label", index, format!("class id {}", class_id))
        })?;
        let repeats = if encode_frequency { count as usize } else { 1 };
        labels.extend(std::iter::repeat(label).take(repeats));
    }
    Ok(labels.join(LABEL_SEPARATOR))
}

/// Cuts a tokenized sequence to `capacity` keeping its closing special token,
/// then pads it with `pad_id`.
fn truncate_and_pad(mut ids: Vec<i64>, capacity: usize, pad_id: i64) -> EncodedVector {
    let mut dropped = 0;
    if ids.len() > capacity {
        dropped = ids.len() - capacity;
        let closing = ids.last().copied();
        ids.truncate(capacity);
        if let (Some(last), Some(closing)) = (ids.last_mut(), closing) {
            *last = closing;
        }
    }
    ids.resize(capacity, pad_id);
    EncodedVector { ids, dropped }
}
