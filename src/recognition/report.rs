use super::ledger::ValidationLedger;
use anyhow::Result;
use log::info;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tch::nn;

pub const NOT_AVAILABLE: &str = "n/a";

#[derive(Debug, Clone, PartialEq, Serialize)]
struct EpochRecord {
    epoch: usize,
    cost_avg: String,
    val_acc: f64,
    val_loss: f64,
}

/// Per epoch results, rewritten as a whole to
/// `<results>/<experiment>_training_log.csv` after every push.
#[derive(Debug)]
pub struct TrainingLog {
    path: PathBuf,
    records: Vec<EpochRecord>,
}

impl TrainingLog {
    pub fn new<P: AsRef<Path>>(results_dir: P, experiment: &str) -> Self {
        TrainingLog {
            path: results_dir
                .as_ref()
                .join(format!("{}_training_log.csv", experiment)),
            records: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `cost_avg` is `None` for the validation run before any training.
    pub fn push(
        &mut self,
        epoch: usize,
        cost_avg: Option<f64>,
        val_acc: f64,
        val_loss: f64,
    ) -> Result<()> {
        self.records.push(EpochRecord {
            epoch,
            cost_avg: cost_avg.map_or_else(|| NOT_AVAILABLE.to_string(), |c| c.to_string()),
            val_acc,
            val_loss,
        });
        self.write()
    }

    fn write(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(&self.path)?;
        for record in &self.records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

pub fn checkpoint_stem<P: AsRef<Path>>(results_dir: P, experiment: &str, epoch: usize) -> PathBuf {
    results_dir
        .as_ref()
        .join("models")
        .join(format!("{}_e_{}", experiment, epoch))
}

/// Saves the weights as `<stem>.pt` and the ledger as `<stem>.json`.
pub fn save_checkpoint<P: AsRef<Path>>(
    vs: &nn::VarStore,
    ledger: &ValidationLedger,
    results_dir: P,
    experiment: &str,
    epoch: usize,
) -> Result<PathBuf> {
    let stem = checkpoint_stem(results_dir, experiment, epoch);
    if let Some(parent) = stem.parent() {
        fs::create_dir_all(parent)?;
    }
    let weights = stem.with_extension("pt");
    vs.save(&weights)?;
    ledger.save_json(stem.with_extension("json"))?;
    info!("saved checkpoint {}", weights.display());
    Ok(weights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn log_is_rewritten_with_header() -> Result<()> {
        let dir = std::env::temp_dir().join("cocotext_semantic_training_log");
        let mut log = TrainingLog::new(&dir, "unit");
        log.push(0, None, 12.5, 3.25)?;
        log.push(1, Some(0.75), 50., 1.5)?;
        let written = fs::read_to_string(log.path())?;
        assert_eq!(
            written,
            "epoch,cost_avg,val_acc,val_loss\n0,n/a,12.5,3.25\n1,0.75,50.0,1.5\n"
        );
        Ok(())
    }

    #[test]
    fn checkpoint_writes_weights_and_ledger() -> Result<()> {
        let dir = std::env::temp_dir().join("cocotext_semantic_checkpoint");
        let vs = nn::VarStore::new(Device::Cpu);
        let _ = nn::linear(vs.root() / "probe", 2, 2, Default::default());
        let mut ledger = ValidationLedger::new();
        ledger.observe("stop", "stop");

        let weights = save_checkpoint(&vs, &ledger, &dir, "unit", 3)?;
        assert_eq!(weights, dir.join("models").join("unit_e_3.pt"));
        assert!(weights.exists());
        let json = fs::read_to_string(dir.join("models").join("unit_e_3.json"))?;
        assert_eq!(json, r#"{"stop":[1,1,[]]}"#);

        let mut restored = nn::VarStore::new(Device::Cpu);
        let _ = nn::linear(restored.root() / "probe", 2, 2, Default::default());
        restored.load(&weights)?;
        Ok(())
    }
}
