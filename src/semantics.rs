use crate::annotations::json_error;
use crate::error::{PipelineError, PipelineResult};
use serde::de::{self, Deserializer, MapAccess, Unexpected, Visitor};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;

pub const BACKGROUND_LABEL: &str = "background";

/// Which object detector the semantic context was produced with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemanticSource {
    VisualGenome,
    Coco,
}

impl SemanticSource {
    fn file_prefix(self) -> &'static str {
        match self {
            SemanticSource::VisualGenome => "vg",
            SemanticSource::Coco => "coco",
        }
    }

    pub fn classes_file(self) -> String {
        format!("{}_classes.txt", self.file_prefix())
    }

    pub fn frequency_file(self) -> String {
        format!("{}_frequency.json", self.file_prefix())
    }
}

impl FromStr for SemanticSource {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "VG" => Ok(SemanticSource::VisualGenome),
            "COCO" => Ok(SemanticSource::Coco),
            _ => Err(PipelineError::Configuration {
                option: "semantic source",
                value: s.to_string(),
                expected: "VG, COCO",
            }),
        }
    }
}

/// Class labels of the detector. Index 0 is always the synthetic background
/// entry, real classes start at 1.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectVocabulary {
    labels: Vec<String>,
}

impl ObjectVocabulary {
    pub fn load<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let path = path.as_ref();
        let io_err = |source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(io_err)?;
        let lines = BufReader::new(file)
            .lines()
            .collect::<Result<Vec<String>, _>>()
            .map_err(io_err)?;
        Ok(Self::from_lines(lines))
    }

    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut labels = vec![BACKGROUND_LABEL.to_string()];
        labels.extend(lines.into_iter().map(|line| canonical_label(line.as_ref())));
        ObjectVocabulary { labels }
    }

    pub fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// `"Person's hat, cap"` -> `"persons hat"`
fn canonical_label(line: &str) -> String {
    line.split(',')
        .next()
        .unwrap_or_default()
        .to_lowercase()
        .trim()
        .replace('\'', "")
}

/// Object counts keyed by class id, kept in the order they appear in the
/// statistics file. The sparse encoding depends on this order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectCounts(Vec<(u32, u32)>);

impl ObjectCounts {
    pub fn new(entries: Vec<(u32, u32)>) -> Self {
        ObjectCounts(entries)
    }

    pub fn entries(&self) -> &[(u32, u32)] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of detected objects, i.e. the sum of all counts.
    pub fn total(&self) -> usize {
        self.0.iter().map(|&(_, count)| count as usize).sum()
    }
}

impl<'de> Deserialize<'de> for ObjectCounts {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct CountsVisitor;

        impl<'de> Visitor<'de> for CountsVisitor {
            type Value = ObjectCounts;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of class id to object count")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((key, count)) = map.next_entry::<String, u32>()? {
                    let class_id = key.trim().parse::<u32>().map_err(|_| {
                        de::Error::invalid_value(Unexpected::Str(&key), &"an integer class id")
                    })?;
                    entries.push((class_id, count));
                }
                Ok(ObjectCounts(entries))
            }
        }

        deserializer.deserialize_map(CountsVisitor)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ObjectStats {
    pub scene: ObjectCounts,
    pub overlap: HashMap<u64, ObjectCounts>,
}

#[derive(Debug, Clone)]
pub struct SemanticResources {
    pub source: SemanticSource,
    pub vocabulary: ObjectVocabulary,
    pub stats: HashMap<u64, ObjectStats>,
}

impl SemanticResources {
    /// Loads `<prefix>_classes.txt` and `<prefix>_frequency.json` from
    /// `features_dir`.
    pub fn load<P: AsRef<Path>>(source: SemanticSource, features_dir: P) -> PipelineResult<Self> {
        let dir = features_dir.as_ref();
        let vocabulary = ObjectVocabulary::load(dir.join(source.classes_file()))?;
        let stats = load_stats(dir.join(source.frequency_file()))?;
        Ok(SemanticResources {
            source,
            vocabulary,
            stats,
        })
    }

    pub fn scene(&self, image_id: u64, annotation_id: u64) -> PipelineResult<&ObjectCounts> {
        Ok(&self.image_stats(image_id, annotation_id)?.scene)
    }

    pub fn overlap(&self, image_id: u64, annotation_id: u64) -> PipelineResult<&ObjectCounts> {
        self.image_stats(image_id, annotation_id)?
            .overlap
            .get(&annotation_id)
            .ok_or_else(|| {
                PipelineError::lookup(
                    "overlap statistics",
                    annotation_id,
                    format!("image {}", image_id),
                )
            })
    }

    fn image_stats(&self, image_id: u64, annotation_id: u64) -> PipelineResult<&ObjectStats> {
        self.stats.get(&image_id).ok_or_else(|| {
            PipelineError::lookup(
                "object statistics for image",
                image_id,
                format!("annotation {}", annotation_id),
            )
        })
    }
}

pub fn load_stats<P: AsRef<Path>>(path: P) -> PipelineResult<HashMap<u64, ObjectStats>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| PipelineError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|err| json_error(path, err))
}
