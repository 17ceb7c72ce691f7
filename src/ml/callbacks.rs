//! 学習ループのコールバック
//!
//! - `EarlyStopping`: val_accuracy が改善しなくなったら学習を打ち切る
//! - `ReduceLrOnPlateau`: val_loss が改善しなくなったら学習率を下げる

/// エポック終了時のEarlyStoppingの判定結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopDecision {
    /// このエポックで最良値を更新したか（重みを保存すべきか）
    pub improved: bool,
    /// 学習を打ち切るべきか
    pub stop: bool,
}

/// 監視値（大きいほど良い）が `patience` エポック改善しなければ停止する
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    best: Option<f64>,
    best_epoch: usize,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            min_delta: 0.0,
            best: None,
            best_epoch: 0,
            wait: 0,
        }
    }

    /// `min_delta` を超えて上回った場合のみ改善とみなす
    pub fn with_min_delta(mut self, min_delta: f64) -> Self {
        self.min_delta = min_delta;
        self
    }

    /// エポックごとの監視値を渡す
    pub fn update(&mut self, epoch: usize, value: f64) -> StopDecision {
        let improved = match self.best {
            None => true,
            Some(best) => value > best + self.min_delta,
        };

        if improved {
            self.best = Some(value);
            self.best_epoch = epoch;
            self.wait = 0;
        } else {
            self.wait += 1;
        }

        StopDecision {
            improved,
            stop: !improved && self.wait >= self.patience,
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }
}

/// 監視値（小さいほど良い）が `patience` エポック改善しなければ学習率に `factor` を掛ける
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    patience: usize,
    factor: f64,
    min_lr: f64,
    min_delta: f64,
    best: f64,
    wait: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(patience: usize, factor: f64, min_lr: f64) -> Self {
        Self {
            patience,
            factor,
            min_lr,
            min_delta: 1e-4,
            best: f64::INFINITY,
            wait: 0,
        }
    }

    pub fn with_min_delta(mut self, min_delta: f64) -> Self {
        self.min_delta = min_delta;
        self
    }

    /// エポックごとの監視値と現在の学習率を渡し、次エポックの学習率を返す
    pub fn update(&mut self, value: f64, lr: f64) -> f64 {
        if value < self.best - self.min_delta {
            self.best = value;
            self.wait = 0;
            return lr;
        }

        self.wait += 1;
        if self.wait < self.patience || lr <= self.min_lr {
            return lr;
        }

        self.wait = 0;
        (lr * self.factor).max(self.min_lr)
    }
}
