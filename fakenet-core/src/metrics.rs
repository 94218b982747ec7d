use burn::{prelude::*, tensor::ElementConversion};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// What per-batch accuracy is divided by.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum AccuracyDenominator {
    /// Number of samples in the batch
    #[default]
    Actual,
    /// Configured batch size, even for a smaller last batch
    Configured,
}

impl AccuracyDenominator {
    pub fn accuracy(self, correct: usize, len: usize, batch_size: usize) -> f64 {
        let denominator = match self {
            AccuracyDenominator::Actual => len,
            AccuracyDenominator::Configured => batch_size,
        };
        if denominator == 0 {
            return 0.;
        }
        correct as f64 / denominator as f64
    }
}

/// Predictions of one batch against its targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub correct: usize,
    pub len: usize,
    /// Number of samples predicted as each class
    pub predicted: Vec<usize>,
}

impl BatchOutcome {
    /// # Shapes
    ///   - Logits [batch_size, num_classes]
    ///   - Targets [batch_size]
    pub fn new<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Self {
        let [len, num_classes] = logits.dims();
        let predictions = logits.argmax(1).squeeze::<1>(1);
        let correct = predictions
            .clone()
            .equal(targets)
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>() as usize;

        let mut predicted = vec![0; num_classes];
        for class in predictions.into_data().iter::<i64>() {
            predicted[class as usize] += 1;
        }

        Self {
            correct,
            len,
            predicted,
        }
    }
}

/// Correct predictions accumulated over a whole pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub correct: usize,
    pub total: usize,
    pub predicted: Vec<usize>,
}

impl Tally {
    pub fn new(num_classes: usize) -> Self {
        Self {
            correct: 0,
            total: 0,
            predicted: vec![0; num_classes],
        }
    }

    pub fn record(&mut self, outcome: &BatchOutcome) {
        self.correct += outcome.correct;
        self.total += outcome.len;
        for (sum, count) in self.predicted.iter_mut().zip(&outcome.predicted) {
            *sum += count;
        }
    }

    /// `correct / total * 100`, zero for an empty pass
    pub fn accuracy_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.;
        }
        100. * self.correct as f64 / self.total as f64
    }
}

/// Per-batch loss and accuracy of both phases, append only.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSeries {
    train_loss: Vec<f64>,
    train_accuracy: Vec<f64>,
    valid_loss: Vec<f64>,
    valid_accuracy: Vec<f64>,
}

impl MetricSeries {
    pub fn push_train(&mut self, loss: f64, accuracy: f64) {
        self.train_loss.push(loss);
        self.train_accuracy.push(accuracy);
    }

    pub fn push_valid(&mut self, loss: f64, accuracy: f64) {
        self.valid_loss.push(loss);
        self.valid_accuracy.push(accuracy);
    }

    pub fn train_loss(&self) -> &[f64] {
        &self.train_loss
    }

    pub fn train_accuracy(&self) -> &[f64] {
        &self.train_accuracy
    }

    pub fn valid_loss(&self) -> &[f64] {
        &self.valid_loss
    }

    pub fn valid_accuracy(&self) -> &[f64] {
        &self.valid_accuracy
    }
}
