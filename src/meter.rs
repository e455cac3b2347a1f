//! Precision/recall accumulation for classifier evaluation.

use std::collections::HashMap;
use std::io::Write;

use crate::error::Result;
use crate::loss::Predictions;

#[derive(Debug, Default, Clone, Copy)]
struct Metrics {
    gold: u64,
    predicted: u64,
    predicted_gold: u64,
}

impl Metrics {
    fn precision(&self) -> f64 {
        self.predicted_gold as f64 / self.predicted as f64
    }

    fn recall(&self) -> f64 {
        self.predicted_gold as f64 / self.gold as f64
    }

    fn f1(&self) -> f64 {
        2.0 * self.predicted_gold as f64 / (self.predicted + self.gold) as f64
    }
}

#[derive(Debug, Default)]
pub struct Meter {
    overall: Metrics,
    labels: HashMap<i32, Metrics>,
    nexamples: u64,
}

impl Meter {
    pub fn new() -> Self {
        Meter::default()
    }

    pub fn log(&mut self, gold: &[i32], predictions: &Predictions) {
        self.nexamples += 1;
        self.overall.gold += gold.len() as u64;
        self.overall.predicted += predictions.len() as u64;

        for &(_, pred) in predictions {
            let m = self.labels.entry(pred).or_default();
            m.predicted += 1;
            if gold.contains(&pred) {
                m.predicted_gold += 1;
                self.overall.predicted_gold += 1;
            }
        }
        for &label in gold {
            self.labels.entry(label).or_default().gold += 1;
        }
    }

    pub fn nexamples(&self) -> u64 {
        self.nexamples
    }

    pub fn precision(&self) -> f64 {
        self.overall.precision()
    }

    pub fn recall(&self) -> f64 {
        self.overall.recall()
    }

    pub fn label_precision(&self, label: i32) -> f64 {
        self.labels.get(&label).copied().unwrap_or_default().precision()
    }

    pub fn label_recall(&self, label: i32) -> f64 {
        self.labels.get(&label).copied().unwrap_or_default().recall()
    }

    pub fn label_f1(&self, label: i32) -> f64 {
        self.labels.get(&label).copied().unwrap_or_default().f1()
    }

    pub fn write_general_metrics<W: Write>(&self, out: &mut W, k: i32) -> Result<()> {
        writeln!(out, "N\t{}", self.nexamples)?;
        writeln!(out, "P@{k}\t{:.3}", self.precision())?;
        writeln!(out, "R@{k}\t{:.3}", self.recall())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate_per_label() {
        let mut meter = Meter::new();
        meter.log(&[0], &vec![(-0.1, 0)]);
        meter.log(&[1], &vec![(-0.2, 0)]);
        meter.log(&[0, 1], &vec![(-0.3, 1)]);

        assert_eq!(meter.nexamples(), 3);
        // 2 of 3 predictions matched a gold label
        assert!((meter.precision() - 2.0 / 3.0).abs() < 1e-9);
        // 4 gold labels, 2 found
        assert!((meter.recall() - 0.5).abs() < 1e-9);
        assert!((meter.label_precision(0) - 0.5).abs() < 1e-9);
        assert!((meter.label_f1(1) - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn missing_label_metrics_are_nan() {
        let meter = Meter::new();
        assert!(meter.label_precision(7).is_nan());
    }
}
