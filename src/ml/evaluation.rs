//! 検証データに対する評価指標
//!
//! 混同行列とクラスごとの precision / recall / F1 を計算します。

use serde::Serialize;

/// クラスごとの指標
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClassReport {
    pub label: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// 混同行列（行: 正解クラス, 列: 予測クラス）
#[derive(Debug, Clone, Serialize)]
pub struct ConfusionMatrix {
    labels: Vec<String>,
    counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    pub fn new(labels: Vec<String>) -> Self {
        let n = labels.len();
        Self {
            labels,
            counts: vec![vec![0; n]; n],
        }
    }

    /// 正解と予測の組から作成する（範囲外のクラスIDは無視）
    pub fn from_predictions(labels: Vec<String>, targets: &[usize], predictions: &[usize]) -> Self {
        let mut matrix = Self::new(labels);
        for (&t, &p) in targets.iter().zip(predictions) {
            matrix.add(t, p);
        }
        matrix
    }

    pub fn add(&mut self, target: usize, prediction: usize) {
        let n = self.labels.len();
        if target < n && prediction < n {
            self.counts[target][prediction] += 1;
        }
    }

    /// 範囲外のクラスIDは 0
    pub fn count(&self, target: usize, prediction: usize) -> usize {
        self.counts
            .get(target)
            .and_then(|row| row.get(prediction))
            .copied()
            .unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let correct: usize = (0..self.labels.len()).map(|i| self.count(i, i)).sum();
        correct as f64 / total as f64
    }

    pub fn class_reports(&self) -> Vec<ClassReport> {
        let n = self.labels.len();
        (0..n)
            .map(|c| {
                let tp = self.count(c, c) as f64;
                let predicted: usize = (0..n).map(|r| self.count(r, c)).sum();
                let support: usize = self.counts[c].iter().sum();

                let precision = ratio(tp, predicted as f64);
                let recall = ratio(tp, support as f64);
                let f1 = ratio(2.0 * precision * recall, precision + recall);

                ClassReport {
                    label: self.labels[c].clone(),
                    precision,
                    recall,
                    f1,
                    support,
                }
            })
            .collect()
    }

    /// ログ出力用の表
    pub fn render(&self) -> String {
        let width = self.labels.iter().map(|l| l.len()).max().unwrap_or(0).max(9);
        let mut out = String::new();

        out.push_str(&format!("{:>width$}", "", width = width));
        for label in &self.labels {
            out.push_str(&format!(" {:>width$}", label, width = width));
        }
        out.push('\n');
        for (label, row) in self.labels.iter().zip(&self.counts) {
            out.push_str(&format!("{:>width$}", label, width = width));
            for count in row {
                out.push_str(&format!(" {:>width$}", count, width = width));
            }
            out.push('\n');
        }

        out.push('\n');
        out.push_str(&format!(
            "{:>width$} {:>9} {:>9} {:>9} {:>9}\n",
            "", "precision", "recall", "f1-score", "support",
            width = width
        ));
        for r in self.class_reports() {
            out.push_str(&format!(
                "{:>width$} {:>9.3} {:>9.3} {:>9.3} {:>9}\n",
                r.label, r.precision, r.recall, r.f1, r.support,
                width = width
            ));
        }
        out.push_str(&format!(
            "{:>width$} {:>9} {:>9} {:>9.3} {:>9}\n",
            "accuracy", "", "", self.accuracy(), self.total(),
            width = width
        ));
        out
    }
}

fn ratio(num: f64, den: f64) -> f64 {
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}
