use crate::annotations::{AnnotationIndex, Legibility, Split, TextAnnotation};
use crate::error::{PipelineError, PipelineResult};
use regex::Regex;

/// Longest transcription the recognizer is trained on.
pub const MAX_TRAINABLE_CHARS: usize = 25;

lazy_static! {
    // ASCII whitespace plus the symbols the decoder vocabulary leaves out
    static ref ILLEGAL_CHARS_REGEX: Regex = Regex::new(r"[ \t\n\r\x0B\x0C/°\-]").unwrap();
}

pub fn is_legible(annotation: &TextAnnotation) -> bool {
    annotation.legibility == Legibility::Legible
}

pub fn in_split(
    annotation: &TextAnnotation,
    index: &AnnotationIndex,
    split: Split,
) -> PipelineResult<bool> {
    Ok(index.image_of(annotation)?.split == split)
}

pub fn is_english(annotation: &TextAnnotation) -> bool {
    annotation.language.as_deref() == Some("english")
}

/// Trims the transcription and removes every illegal character.
pub fn clean_transcription(text: &str) -> String {
    ILLEGAL_CHARS_REGEX.replace_all(text.trim(), "").into_owned()
}

/// A transcription is trainable when cleaning and truncating it to
/// `MAX_TRAINABLE_CHARS` leaves it untouched.
pub fn is_trainable_text(text: &str) -> bool {
    let cleaned = clean_transcription(text);
    cleaned.chars().take(MAX_TRAINABLE_CHARS).eq(text.chars())
}

/// The split specific half of the membership rule, applied to an annotation
/// that is already known to be legible and in `split`.
pub fn passes_split_rule(split: Split, annotation: &TextAnnotation) -> PipelineResult<bool> {
    match split {
        Split::Train => {
            let text = annotation.utf8_string.as_deref().ok_or_else(|| {
                PipelineError::data_format(
                    format!("annotation {}", annotation.id),
                    "legible annotation without utf8_string",
                )
            })?;
            Ok(is_trainable_text(text))
        }
        Split::Val => Ok(is_english(annotation)),
        Split::Other => Ok(false),
    }
}
