use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::str::FromStr;
use tch::Device;

/// Printable ASCII without whitespace: digits, lowercase, uppercase, punctuation.
pub const CHARACTERS: &str = concat!(
    "0123456789",
    "abcdefghijklmnopqrstuvwxyz",
    "ABCDEFGHIJKLMNOPQRSTUVWXYZ",
    "!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~"
);
pub const GO_TOKEN: &str = "[GO]";
/// `[GO]`, which doubles as the padding class the loss ignores.
pub const GO_ID: i64 = 0;
/// `[s]`, end of sequence.
pub const EOS_ID: i64 = 1;
pub const NUM_CLASSES: i64 = CHARACTERS.len() as i64 + 2;

lazy_static! {
    pub static ref POS_TO_CHAR: HashMap<i64, char> = {
        let mut m = HashMap::new();
        for (pos, ch) in CHARACTERS.chars().enumerate() {
            m.insert(pos as i64 + 2, ch);
        }
        m
    };
    pub static ref CHAR_TO_POS: HashMap<char, i64> = {
        let mut m = HashMap::new();
        for (pos, ch) in CHARACTERS.chars().enumerate() {
            m.insert(ch, pos as i64 + 2);
        }
        m
    };
}

pub fn parse_number<T: FromStr>(value: &str, name: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| anyhow!("invalid value '{}' for {}", value, name))
}

/// `cpu`, `cuda` (first device if available) or `cuda:N`.
pub fn parse_device(value: &str) -> Result<Device> {
    match value.trim().to_lowercase().as_str() {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::cuda_if_available()),
        other => match other.strip_prefix("cuda:") {
            Some(index) => Ok(Device::Cuda(parse_number(index, "cuda device index")?)),
            None => Err(anyhow!("unknown device '{}'", value)),
        },
    }
}

/// Rounds to `digits` decimal places.
pub fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}
