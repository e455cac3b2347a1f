//! The two-matrix embedding model: hidden = mean of input rows, loss
//! kernels score it against output rows and the gradient flows back into
//! the input matrix.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{Error, Result};
use crate::loss::{Loss, Predictions};
use crate::matrix::Matrix;
use crate::real;
use crate::vector::Vector;

pub const K_UNLIMITED_PREDICTIONS: i32 = -1;

/// Per-thread scratch: hidden/output/gradient vectors, the thread RNG and
/// the running loss average. Everything mutable during training lives
/// here; the model itself is shared immutably.
pub struct State {
    pub hidden: Vector,
    pub output: Vector,
    pub grad: Vector,
    pub rng: StdRng,
    loss_value: f64,
    nexamples: i64,
}

impl State {
    pub fn new(hidden_size: usize, output_size: usize, seed: u64) -> Self {
        State {
            hidden: Vector::new(hidden_size),
            output: Vector::new(output_size),
            grad: Vector::new(hidden_size),
            rng: StdRng::seed_from_u64(seed),
            loss_value: 0.0,
            nexamples: 0,
        }
    }

    pub fn loss(&self) -> real {
        if self.nexamples == 0 {
            return 0.0;
        }
        (self.loss_value / self.nexamples as f64) as real
    }

    fn increment_nexamples(&mut self, loss: real) {
        self.loss_value += loss as f64;
        self.nexamples += 1;
    }
}

pub struct Model {
    wi: Arc<Matrix>,
    wo: Arc<Matrix>,
    loss: Box<dyn Loss>,
    normalize_gradient: bool,
}

impl Model {
    pub fn new(
        wi: Arc<Matrix>,
        wo: Arc<Matrix>,
        loss: Box<dyn Loss>,
        normalize_gradient: bool,
    ) -> Self {
        Model {
            wi,
            wo,
            loss,
            normalize_gradient,
        }
    }

    pub fn output_rows(&self) -> usize {
        self.wo.rows()
    }

    pub fn compute_hidden(&self, input: &[i32], state: &mut State) -> Result<()> {
        let hidden = &mut state.hidden;
        hidden.zero();
        for &id in input {
            hidden.add_row(&self.wi, id as usize)?;
        }
        hidden.mul(1.0 / input.len() as real);
        Ok(())
    }

    /// One SGD step: mean the input rows, run the loss against
    /// `targets[target_idx]`, push the gradient back onto every input row.
    /// Nothing happens for empty inputs or a discarded (negative) target.
    pub fn update(
        &self,
        input: &[i32],
        targets: &[i32],
        target_idx: usize,
        lr: real,
        state: &mut State,
    ) -> Result<()> {
        if input.is_empty() || targets[target_idx] < 0 {
            return Ok(());
        }
        self.compute_hidden(input, state)?;

        state.grad.zero();
        let loss_value = self
            .loss
            .forward(targets, target_idx, state, lr, true)?;
        state.increment_nexamples(loss_value);

        if self.normalize_gradient {
            state.grad.mul(1.0 / input.len() as real);
        }
        for &id in input {
            self.wi.add_vector_to_row(&state.grad, id as usize, 1.0)?;
        }
        Ok(())
    }

    pub fn predict(
        &self,
        input: &[i32],
        k: i32,
        threshold: real,
        heap: &mut Predictions,
        state: &mut State,
    ) -> Result<()> {
        let k = if k == K_UNLIMITED_PREDICTIONS {
            self.wo.rows()
        } else if k <= 0 {
            return Err(Error::config("k needs to be 1 or higher".to_string()));
        } else {
            k as usize
        };
        self.compute_hidden(input, state)?;
        self.loss.predict(k, threshold, heap, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::NegativeSamplingLoss;
    use crate::matrix::DenseMatrix;

    fn model(wi_rows: usize, wo_rows: usize, dim: usize, neg: i32) -> (Model, Arc<Matrix>) {
        let wi = Arc::new(Matrix::Dense(DenseMatrix::new(wi_rows, dim)));
        let wo = Arc::new(Matrix::Dense(DenseMatrix::new(wo_rows, dim)));
        let counts = vec![10i64; wo_rows];
        let loss = Box::new(NegativeSamplingLoss::new(wo.clone(), neg, &counts));
        (Model::new(wi.clone(), wo, loss, false), wi)
    }

    #[test]
    fn hidden_is_the_mean_of_input_rows() {
        let (m, wi) = model(3, 2, 2, 0);
        if let Matrix::Dense(d) = wi.as_ref() {
            d.set_at(0, 0, 2.0);
            d.set_at(1, 0, 4.0);
        }
        let mut state = State::new(2, 2, 0);
        m.compute_hidden(&[0, 1], &mut state).unwrap();
        assert_eq!(state.hidden[0], 3.0);
        assert_eq!(state.hidden[1], 0.0);
    }

    #[test]
    fn zero_initialized_model_stays_zero() {
        // with both matrices at zero the binary-logistic gradient is
        // lr * (label - 0.5) * wo_row = 0, so no update can move anything
        let (m, wi) = model(2, 2, 2, 0);
        let mut state = State::new(2, 2, 1);
        for _ in 0..5 {
            m.update(&[0], &[0, 1], 1, 0.05, &mut state).unwrap();
        }
        if let Matrix::Dense(d) = wi.as_ref() {
            for i in 0..2 {
                for j in 0..2 {
                    assert_eq!(d.at(i, j), 0.0);
                }
            }
        }
        assert!(state.loss() > 0.0);
    }

    #[test]
    fn discarded_targets_are_skipped() {
        let (m, _) = model(2, 2, 2, 0);
        let mut state = State::new(2, 2, 1);
        m.update(&[0], &[0, -1], 1, 0.05, &mut state).unwrap();
        assert_eq!(state.loss(), 0.0);
    }

    #[test]
    fn predict_validates_k() {
        let (m, _) = model(2, 2, 2, 0);
        let mut state = State::new(2, 2, 1);
        let mut heap = Predictions::new();
        assert!(m.predict(&[0], 0, 0.0, &mut heap, &mut state).is_err());
        m.predict(&[0], K_UNLIMITED_PREDICTIONS, 0.0, &mut heap, &mut state)
            .unwrap();
        assert_eq!(heap.len(), 2);
    }
}
