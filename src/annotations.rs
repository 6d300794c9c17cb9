use crate::error::{PipelineError, PipelineResult};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
    #[serde(other)]
    Other,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Val => write!(f, "val"),
            Split::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Legibility {
    Legible,
    Illegible,
}

/// Axis aligned text region in source image pixels, stored as `[x, y, w, h]`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(from = "[f64; 4]")]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl From<[f64; 4]> for BoundingBox {
    fn from([x, y, width, height]: [f64; 4]) -> Self {
        BoundingBox {
            x,
            y,
            width,
            height,
        }
    }
}

impl BoundingBox {
    /// Corner coordinates `(left, top, right, bottom)`.
    pub fn corners(&self) -> (f64, f64, f64, f64) {
        (self.x, self.y, self.x + self.width, self.y + self.height)
    }
}

/// A single COCO-Text instance. Illegible instances usually carry neither a
/// transcription nor a language, hence the options.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TextAnnotation {
    pub id: u64,
    pub image_id: u64,
    pub bbox: BoundingBox,
    #[serde(default)]
    pub utf8_string: Option<String>,
    pub legibility: Legibility,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ImageRecord {
    #[serde(rename = "id")]
    pub image_id: u64,
    pub file_name: String,
    #[serde(rename = "set")]
    pub split: Split,
}

#[derive(Debug, Deserialize)]
pub struct AnnotationIndex {
    #[serde(rename = "anns")]
    pub annotations: BTreeMap<u64, TextAnnotation>,
    #[serde(rename = "imgs")]
    pub images: BTreeMap<u64, ImageRecord>,
}

impl AnnotationIndex {
    pub fn load<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|err| json_error(path, err))
    }

    pub fn image_of(&self, annotation: &TextAnnotation) -> PipelineResult<&ImageRecord> {
        self.images.get(&annotation.image_id).ok_or_else(|| {
            PipelineError::lookup(
                "image",
                annotation.image_id,
                format!("annotation {}", annotation.id),
            )
        })
    }
}

/// Schema violations (missing keys, wrong types) become `DataFormat`, anything
/// else keeps the raw json error.
pub(crate) fn json_error(path: &Path, err: serde_json::Error) -> PipelineError {
    use serde_json::error::Category;
    match err.classify() {
        Category::Data => PipelineError::data_format(path.display().to_string(), err.to_string()),
        Category::Io | Category::Syntax | Category::Eof => PipelineError::Json {
            path: path.to_path_buf(),
            source: err,
        },
    }
}
