//! The four output-layer objectives. Each kernel owns a handle to the
//! shared output matrix and scores/updates it through the precomputed
//! sigmoid and log tables.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use ordered_float::OrderedFloat;
use rand::Rng;

use crate::error::{Error, Result};
use crate::matrix::Matrix;
use crate::model::State;
use crate::real;
use crate::vector::Vector;

const SIGMOID_TABLE_SIZE: usize = 512;
const MAX_SIGMOID: real = 8.0;
const LOG_TABLE_SIZE: usize = 512;
const NEGATIVE_TABLE_SIZE: usize = 10_000_000;

/// `(log-probability, output id)` pairs, best first.
pub type Predictions = Vec<(real, i32)>;

pub fn std_log(x: real) -> real {
    (x + 1e-5).ln()
}

pub trait Loss: Send + Sync {
    /// Score the positive target `targets[target_idx]` against the hidden
    /// vector in `state`, accumulating into `state.grad` and the output
    /// matrix when `backprop` is set. Entries of `targets` may be `-1`
    /// (discarded tokens); the positive one never is by the time a kernel
    /// runs.
    fn forward(
        &self,
        targets: &[i32],
        target_idx: usize,
        state: &mut State,
        lr: real,
        backprop: bool,
    ) -> Result<real>;

    fn compute_output(&self, state: &mut State) -> Result<()>;

    fn predict(
        &self,
        k: usize,
        threshold: real,
        heap: &mut Predictions,
        state: &mut State,
    ) -> Result<()> {
        self.compute_output(state)?;
        find_k_best(k, threshold, heap, &state.output);
        Ok(())
    }
}

/// Shared output-matrix handle plus the sigmoid/log lookup tables.
struct LossCore {
    wo: Arc<Matrix>,
    t_sigmoid: Vec<real>,
    t_log: Vec<real>,
}

impl LossCore {
    fn new(wo: Arc<Matrix>) -> Self {
        let t_sigmoid = (0..=SIGMOID_TABLE_SIZE)
            .map(|i| {
                let x = (i * 2) as real * MAX_SIGMOID / SIGMOID_TABLE_SIZE as real - MAX_SIGMOID;
                1.0 / (1.0 + (-x).exp())
            })
            .collect();
        let t_log = (0..=LOG_TABLE_SIZE)
            .map(|i| ((i as real + 1e-5) / LOG_TABLE_SIZE as real).ln())
            .collect();
        LossCore {
            wo,
            t_sigmoid,
            t_log,
        }
    }

    fn sigmoid(&self, x: real) -> real {
        if x < -MAX_SIGMOID {
            0.0
        } else if x > MAX_SIGMOID {
            1.0
        } else {
            let i = ((x + MAX_SIGMOID) * SIGMOID_TABLE_SIZE as real / MAX_SIGMOID / 2.0) as usize;
            self.t_sigmoid[i]
        }
    }

    fn log(&self, x: real) -> real {
        if x > 1.0 {
            return 0.0;
        }
        self.t_log[(x * LOG_TABLE_SIZE as real) as usize]
    }

    /// One binary cross-entropy step against output row `target`.
    fn binary_logistic(
        &self,
        target: i32,
        state: &mut State,
        label_is_positive: bool,
        lr: real,
        backprop: bool,
    ) -> Result<real> {
        let row = target as usize;
        let score = self.sigmoid(self.wo.dot_row(&state.hidden, row)?);
        if backprop {
            let label = if label_is_positive { 1.0 } else { 0.0 };
            let alpha = lr * (label - score);
            state.grad.add_row_scaled(&self.wo, row, alpha)?;
            self.wo.add_vector_to_row(&state.hidden, row, alpha)?;
        }
        if label_is_positive {
            Ok(-self.log(score))
        } else {
            Ok(-self.log(1.0 - score))
        }
    }

    /// Sigmoid of every output row; shared by the binary kernels.
    fn compute_sigmoid_output(&self, state: &mut State) -> Result<()> {
        let State { hidden, output, .. } = state;
        output.mul_matrix(&self.wo, hidden)?;
        for i in 0..output.size() {
            let v = output[i];
            output[i] = self.sigmoid(v);
        }
        Ok(())
    }
}

struct KBest {
    k: usize,
    heap: BinaryHeap<Reverse<(OrderedFloat<real>, i32)>>,
}

impl KBest {
    fn new(k: usize) -> Self {
        KBest {
            k,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    fn worst(&self) -> Option<real> {
        self.heap.peek().map(|Reverse((s, _))| s.0)
    }

    fn would_enter(&self, score: real) -> bool {
        self.heap.len() < self.k || self.worst().map_or(true, |w| score > w)
    }

    fn push(&mut self, score: real, id: i32) {
        if !self.would_enter(score) {
            return;
        }
        self.heap.push(Reverse((OrderedFloat(score), id)));
        if self.heap.len() > self.k {
            self.heap.pop();
        }
    }

    fn into_sorted(self) -> Predictions {
        let mut out: Predictions = self
            .heap
            .into_iter()
            .map(|Reverse((s, id))| (s.0, id))
            .collect();
        out.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        out
    }
}

fn find_k_best(k: usize, threshold: real, heap: &mut Predictions, output: &Vector) {
    let mut kb = KBest::new(k);
    for i in 0..output.size() {
        if output[i] < threshold {
            continue;
        }
        kb.push(std_log(output[i]), i as i32);
    }
    *heap = kb.into_sorted();
}

// ---------------------------------------------------------------------

pub struct NegativeSamplingLoss {
    core: LossCore,
    neg: i32,
    negatives: Vec<i32>,
}

impl NegativeSamplingLoss {
    pub fn new(wo: Arc<Matrix>, neg: i32, target_counts: &[i64]) -> Self {
        // unigram^0.75 sampling table
        let z: f64 = target_counts.iter().map(|&c| (c as f64).powf(0.75)).sum();
        let mut negatives = Vec::new();
        for (i, &c) in target_counts.iter().enumerate() {
            let n = ((c as f64).powf(0.75) / z * NEGATIVE_TABLE_SIZE as f64) as usize;
            negatives.extend(std::iter::repeat(i as i32).take(n));
        }
        if negatives.is_empty() {
            negatives.extend(0..target_counts.len() as i32);
        }
        NegativeSamplingLoss {
            core: LossCore::new(wo),
            neg,
            negatives,
        }
    }

    fn get_negative(&self, target: i32, state: &mut State) -> i32 {
        for _ in 0..1000 {
            let n = self.negatives[state.rng.gen_range(0..self.negatives.len())];
            if n != target {
                return n;
            }
        }
        // single-class table; the draw cannot avoid the target
        target
    }
}

impl Loss for NegativeSamplingLoss {
    fn forward(
        &self,
        targets: &[i32],
        target_idx: usize,
        state: &mut State,
        lr: real,
        backprop: bool,
    ) -> Result<real> {
        let target = targets[target_idx];
        let mut loss = self.core.binary_logistic(target, state, true, lr, backprop)?;
        for _ in 0..self.neg {
            let negative = self.get_negative(target, state);
            loss += self
                .core
                .binary_logistic(negative, state, false, lr, backprop)?;
        }
        Ok(loss)
    }

    fn compute_output(&self, state: &mut State) -> Result<()> {
        self.core.compute_sigmoid_output(state)
    }
}

// ---------------------------------------------------------------------

#[derive(Clone, Copy)]
struct TreeNode {
    parent: i32,
    left: i32,
    right: i32,
    count: i64,
    binary: bool,
}

pub struct HierarchicalSoftmaxLoss {
    core: LossCore,
    paths: Vec<Vec<i32>>,
    codes: Vec<Vec<bool>>,
    tree: Vec<TreeNode>,
    osz: i32,
}

impl HierarchicalSoftmaxLoss {
    pub fn new(wo: Arc<Matrix>, target_counts: &[i64]) -> Self {
        let mut loss = HierarchicalSoftmaxLoss {
            core: LossCore::new(wo),
            paths: Vec::new(),
            codes: Vec::new(),
            tree: Vec::new(),
            osz: target_counts.len() as i32,
        };
        loss.build_tree(target_counts);
        loss
    }

    // Huffman construction over the target counts; frequent targets get
    // short codes.
    fn build_tree(&mut self, counts: &[i64]) {
        let osz = counts.len();
        self.tree = vec![
            TreeNode {
                parent: -1,
                left: -1,
                right: -1,
                count: 1_000_000_000_000_000,
                binary: false,
            };
            2 * osz - 1
        ];
        for i in 0..osz {
            self.tree[i].count = counts[i];
        }
        let mut leaf = osz as i32 - 1;
        let mut node = osz as i32;
        for i in osz..2 * osz - 1 {
            let mut mini = [0i32; 2];
            for m in &mut mini {
                if leaf >= 0 && self.tree[leaf as usize].count < self.tree[node as usize].count {
                    *m = leaf;
                    leaf -= 1;
                } else {
                    *m = node;
                    node += 1;
                }
            }
            self.tree[i].left = mini[0];
            self.tree[i].right = mini[1];
            self.tree[i].count =
                self.tree[mini[0] as usize].count + self.tree[mini[1] as usize].count;
            self.tree[mini[0] as usize].parent = i as i32;
            self.tree[mini[1] as usize].parent = i as i32;
            self.tree[mini[1] as usize].binary = true;
        }
        for i in 0..osz {
            let mut path = Vec::new();
            let mut code = Vec::new();
            let mut j = i as i32;
            while self.tree[j as usize].parent != -1 {
                path.push(self.tree[j as usize].parent - osz as i32);
                code.push(self.tree[j as usize].binary);
                j = self.tree[j as usize].parent;
            }
            self.paths.push(path);
            self.codes.push(code);
        }
    }

    fn dfs(
        &self,
        threshold: real,
        node: i32,
        score: real,
        kb: &mut KBest,
        state: &State,
    ) -> Result<()> {
        if score < std_log(threshold) || !kb.would_enter(score) {
            return Ok(());
        }
        let n = self.tree[node as usize];
        if n.left == -1 && n.right == -1 {
            kb.push(score, node);
            return Ok(());
        }
        let f = self
            .core
            .sigmoid(self.core.wo.dot_row(&state.hidden, (node - self.osz) as usize)?);
        self.dfs(threshold, n.left, score + std_log(1.0 - f), kb, state)?;
        self.dfs(threshold, n.right, score + std_log(f), kb, state)
    }
}

impl Loss for HierarchicalSoftmaxLoss {
    fn forward(
        &self,
        targets: &[i32],
        target_idx: usize,
        state: &mut State,
        lr: real,
        backprop: bool,
    ) -> Result<real> {
        let target = targets[target_idx] as usize;
        let mut loss = 0.0;
        for (node, &code) in self.paths[target].iter().zip(&self.codes[target]) {
            loss += self.core.binary_logistic(*node, state, code, lr, backprop)?;
        }
        Ok(loss)
    }

    fn compute_output(&self, _state: &mut State) -> Result<()> {
        Err(Error::runtime(
            "hierarchical softmax has no dense output".to_string(),
        ))
    }

    fn predict(
        &self,
        k: usize,
        threshold: real,
        heap: &mut Predictions,
        state: &mut State,
    ) -> Result<()> {
        let mut kb = KBest::new(k);
        self.dfs(threshold, 2 * self.osz - 2, 0.0, &mut kb, state)?;
        *heap = kb.into_sorted();
        Ok(())
    }
}

// ---------------------------------------------------------------------

pub struct SoftmaxLoss {
    core: LossCore,
}

impl SoftmaxLoss {
    pub fn new(wo: Arc<Matrix>) -> Self {
        SoftmaxLoss {
            core: LossCore::new(wo),
        }
    }
}

impl Loss for SoftmaxLoss {
    fn forward(
        &self,
        targets: &[i32],
        target_idx: usize,
        state: &mut State,
        lr: real,
        backprop: bool,
    ) -> Result<real> {
        self.compute_output(state)?;
        let target = targets[target_idx] as usize;
        if backprop {
            let osz = self.core.wo.rows();
            for i in 0..osz {
                let label = if i == target { 1.0 } else { 0.0 };
                let alpha = lr * (label - state.output[i]);
                state.grad.add_row_scaled(&self.core.wo, i, alpha)?;
                self.core.wo.add_vector_to_row(&state.hidden, i, alpha)?;
            }
        }
        Ok(-std_log(state.output[target]))
    }

    fn compute_output(&self, state: &mut State) -> Result<()> {
        let State { hidden, output, .. } = state;
        output.mul_matrix(&self.core.wo, hidden)?;
        let mut max = output[0];
        for i in 1..output.size() {
            max = max.max(output[i]);
        }
        let mut z = 0.0;
        for i in 0..output.size() {
            output[i] = (output[i] - max).exp();
            z += output[i];
        }
        for i in 0..output.size() {
            output[i] /= z;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------

pub struct OneVsAllLoss {
    core: LossCore,
}

impl OneVsAllLoss {
    pub fn new(wo: Arc<Matrix>) -> Self {
        OneVsAllLoss {
            core: LossCore::new(wo),
        }
    }
}

impl Loss for OneVsAllLoss {
    /// Binary cross-entropy over every class; `targets` is the positive
    /// set and `target_idx` is ignored.
    fn forward(
        &self,
        targets: &[i32],
        _target_idx: usize,
        state: &mut State,
        lr: real,
        backprop: bool,
    ) -> Result<real> {
        let mut loss = 0.0;
        let osz = self.core.wo.rows() as i32;
        for i in 0..osz {
            let is_match = targets.contains(&i);
            loss += self.core.binary_logistic(i, state, is_match, lr, backprop)?;
        }
        Ok(loss)
    }

    fn compute_output(&self, state: &mut State) -> Result<()> {
        self.core.compute_sigmoid_output(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::DenseMatrix;

    fn dense(m: usize, n: usize) -> Arc<Matrix> {
        Arc::new(Matrix::Dense(DenseMatrix::new(m, n)))
    }

    #[test]
    fn sigmoid_table_tracks_the_function() {
        let core = LossCore::new(dense(1, 1));
        for &x in &[-7.5, -2.0, -0.1, 0.0, 0.3, 1.0, 6.0] {
            let exact = 1.0 / (1.0 + (-x as real).exp());
            assert!((core.sigmoid(x) - exact).abs() < 0.01, "x = {x}");
        }
        assert_eq!(core.sigmoid(9.0), 1.0);
        assert_eq!(core.sigmoid(-9.0), 0.0);
    }

    #[test]
    fn log_table_tracks_the_function() {
        let core = LossCore::new(dense(1, 1));
        for &x in &[0.05, 0.25, 0.5, 0.99] {
            assert!((core.log(x) - (x as real).ln()).abs() < 0.05, "x = {x}");
        }
        assert_eq!(core.log(1.5), 0.0);
    }

    #[test]
    fn huffman_codes_shorten_with_frequency() {
        let counts = vec![100, 50, 20, 10, 5, 2, 1];
        let hs = HierarchicalSoftmaxLoss::new(dense(counts.len(), 4), &counts);

        for w in hs.codes.windows(2).map(|w| (w[0].len(), w[1].len())) {
            assert!(w.0 <= w.1, "code lengths must grow as counts shrink");
        }
        // every leaf reaches the root
        for i in 0..counts.len() {
            assert!(!hs.paths[i].is_empty());
            for &p in &hs.paths[i] {
                assert!(p >= 0 && (p as usize) < counts.len());
            }
        }
        // root aggregates the full mass
        assert_eq!(hs.tree[2 * counts.len() - 2].count, 188);
    }

    #[test]
    fn negative_draws_avoid_the_target() {
        let wo = dense(3, 2);
        let ns = NegativeSamplingLoss::new(wo, 5, &[50, 30, 20]);
        let mut state = State::new(2, 3, 9);
        for _ in 0..200 {
            assert_ne!(ns.get_negative(1, &mut state), 1);
        }
    }

    #[test]
    fn softmax_output_is_a_distribution() {
        let wo = Arc::new(Matrix::Dense(DenseMatrix::new(3, 2)));
        if let Matrix::Dense(d) = wo.as_ref() {
            d.uniform(0.5, 1, 3);
        }
        let sm = SoftmaxLoss::new(wo);
        let mut state = State::new(2, 3, 0);
        state.hidden[0] = 0.4;
        state.hidden[1] = -0.2;
        sm.compute_output(&mut state).unwrap();
        let sum: real = (0..3).map(|i| state.output[i]).sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn zero_weights_give_zero_gradient_for_ns() {
        // sigmoid(0) = 0.5 and label-score symmetric negatives cancel only
        // through lr = 0; with zero lr nothing moves
        let wo = dense(2, 2);
        let ns = NegativeSamplingLoss::new(wo.clone(), 1, &[5, 5]);
        let mut state = State::new(2, 2, 1);
        let loss = ns.forward(&[0, 1], 0, &mut state, 0.0, true).unwrap();
        assert!(loss > 0.0);
        assert_eq!(state.grad[0], 0.0);
        assert_eq!(wo.dot_row(&state.hidden, 0).unwrap(), 0.0);
    }

    #[test]
    fn k_best_keeps_the_top_k_sorted() {
        let mut kb = KBest::new(2);
        kb.push(-3.0, 0);
        kb.push(-1.0, 1);
        kb.push(-2.0, 2);
        kb.push(-9.0, 3);
        let out = kb.into_sorted();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].1, 1);
        assert_eq!(out[1].1, 2);
    }
}
