use crate::utils::{CHAR_TO_POS, EOS_ID, GO_ID, GO_TOKEN, POS_TO_CHAR};
use anyhow::{anyhow, Result};
use std::convert::TryFrom;
use tch::Tensor;

/// Maps transcriptions to attention decoder targets and back.
///
/// A text `abc` with `max_length = 5` is encoded as
/// `[GO] a b c [s] [GO] [GO]`, i.e. every row has `max_length + 2` columns.
/// The first `max_length + 1` columns are the decoder input and the last
/// `max_length + 1` the target.
#[derive(Debug, Clone, Copy)]
pub struct LabelConverter {
    max_length: usize,
}

impl LabelConverter {
    pub fn new(max_length: usize) -> Self {
        LabelConverter { max_length }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Decoder steps per sequence, the end token included.
    pub fn steps(&self) -> i64 {
        self.max_length as i64 + 1
    }

    /// Class ids of one text. Fails on characters outside the decoder
    /// charset or texts longer than `max_length`.
    pub fn text_ids(&self, text: &str) -> Result<Vec<i64>> {
        let ids = text
            .chars()
            .map(|ch| {
                CHAR_TO_POS
                    .get(&ch)
                    .copied()
                    .ok_or_else(|| anyhow!("character {:?} of {:?} can't be encoded", ch, text))
            })
            .collect::<Result<Vec<i64>>>()?;
        if ids.len() > self.max_length {
            return Err(anyhow!(
                "{:?} is longer than {} characters",
                text,
                self.max_length
            ));
        }
        Ok(ids)
    }

    /// Strict batch encoding, see `text_ids`.
    pub fn encode<S: AsRef<str>>(&self, texts: &[S]) -> Result<Tensor> {
        let rows = texts
            .iter()
            .map(|text| self.text_ids(text.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.to_tensor(&rows))
    }

    /// Drops unknown characters and truncates to `max_length`.
    pub fn encode_lossy<S: AsRef<str>>(&self, texts: &[S]) -> Tensor {
        let rows = texts
            .iter()
            .map(|text| {
                text.as_ref()
                    .chars()
                    .filter_map(|ch| CHAR_TO_POS.get(&ch).copied())
                    .take(self.max_length)
                    .collect::<Vec<i64>>()
            })
            .collect::<Vec<_>>();
        self.to_tensor(&rows)
    }

    fn to_tensor(&self, rows: &[Vec<i64>]) -> Tensor {
        let width = self.max_length + 2;
        let mut flat = vec![GO_ID; rows.len() * width];
        for (row, ids) in flat.chunks_mut(width).zip(rows) {
            row[1..=ids.len()].copy_from_slice(ids);
            row[ids.len() + 1] = EOS_ID;
        }
        Tensor::from_slice(&flat).view((rows.len() as i64, width as i64))
    }

    /// Reads class ids up to the first end token. A `[GO]` id inside the
    /// text is written out as `[GO]`.
    pub fn decode(&self, ids: &[i64]) -> String {
        let mut text = String::new();
        for &id in ids.iter().take_while(|&&id| id != EOS_ID) {
            if id == GO_ID {
                text.push_str(GO_TOKEN);
            } else if let Some(&ch) = POS_TO_CHAR.get(&id) {
                text.push(ch);
            }
        }
        text
    }

    /// Decodes a `[batch, steps]` tensor of class ids.
    pub fn decode_batch(&self, ids: &Tensor) -> Result<Vec<String>> {
        let (batch, steps) = ids.size2()?;
        let flat = Vec::<i64>::try_from(&ids.contiguous().view(-1))?;
        if batch == 0 {
            return Ok(Vec::new());
        }
        Ok(flat
            .chunks(steps as usize)
            .map(|row| self.decode(row))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(tensor: &Tensor, index: i64) -> Vec<i64> {
        Vec::<i64>::try_from(&tensor.get(index)).unwrap()
    }

    #[test]
    fn encode_layout() -> Result<()> {
        let converter = LabelConverter::new(5);
        let encoded = converter.encode(&["ab", ""])?;
        assert_eq!(encoded.size(), vec![2, 7]);
        let a = CHAR_TO_POS[&'a'];
        let b = CHAR_TO_POS[&'b'];
        assert_eq!(row(&encoded, 0), vec![GO_ID, a, b, EOS_ID, 0, 0, 0]);
        assert_eq!(row(&encoded, 1), vec![GO_ID, EOS_ID, 0, 0, 0, 0, 0]);
        Ok(())
    }

    #[test]
    fn encode_full_length_text() -> Result<()> {
        let converter = LabelConverter::new(3);
        let encoded = converter.encode(&["xyz"])?;
        assert_eq!(row(&encoded, 0)[4], EOS_ID);
        Ok(())
    }

    #[test]
    fn encode_rejects_unknown_and_long_texts() {
        let converter = LabelConverter::new(3);
        assert!(converter.encode(&["a b"]).is_err());
        assert!(converter.encode(&["Straße"]).is_err());
        assert!(converter.encode(&["abcd"]).is_err());
    }

    #[test]
    fn lossy_encoding_filters_and_truncates() -> Result<()> {
        let converter = LabelConverter::new(3);
        let lossy = converter.encode_lossy(&["a b-cd"]);
        let strict = converter.encode(&["ab-"])?;
        assert_eq!(row(&lossy, 0), row(&strict, 0));
        Ok(())
    }

    #[test]
    fn decode_stops_at_first_end_token() {
        let converter = LabelConverter::new(5);
        let s = CHAR_TO_POS[&'s'];
        let t = CHAR_TO_POS[&'t'];
        assert_eq!(converter.decode(&[s, t, EOS_ID, s, s]), "st");
        assert_eq!(converter.decode(&[EOS_ID, s]), "");
    }

    #[test]
    fn decode_writes_out_start_tokens() {
        let converter = LabelConverter::new(5);
        let s = CHAR_TO_POS[&'s'];
        let t = CHAR_TO_POS[&'t'];
        assert_eq!(converter.decode(&[s, GO_ID, t, EOS_ID]), "s[GO]t");
        assert_eq!(converter.decode(&[GO_ID, EOS_ID, s]), "[GO]");
    }

    #[test]
    fn text_ids_reports_the_failing_character() {
        let converter = LabelConverter::new(25);
        let err = converter.text_ids("Café").unwrap_err();
        assert!(err.to_string().contains("'é'"));
        assert_eq!(converter.text_ids("Cafe").unwrap().len(), 4);
    }

    #[test]
    fn decode_batch_round_trips_encoding() -> Result<()> {
        let converter = LabelConverter::new(10);
        let texts = ["Stop", "st0p!"];
        let encoded = converter.encode(&texts)?;
        let targets = encoded.narrow(1, 1, converter.steps());
        assert_eq!(converter.decode_batch(&targets)?, vec!["Stop", "st0p!"]);
        Ok(())
    }
}
