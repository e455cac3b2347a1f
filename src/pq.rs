//! Product quantization: each row is split into `d/dsub` sub-vectors and
//! every sub-vector is replaced by the index of its nearest codebook
//! centroid, learned with k-means.

use std::io::{Read, Write};

use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::binio;
use crate::error::{Error, Result};
use crate::matrix::DenseMatrix;
use crate::real;
use crate::vector::Vector;

const NBITS: u32 = 8;
const KSUB: usize = 1 << NBITS;
const MAX_POINTS_PER_CLUSTER: usize = 256;
const MAX_POINTS: usize = MAX_POINTS_PER_CLUSTER * KSUB;
const SEED: u64 = 1234;
const NITER: usize = 25;
const EPS: real = 1e-7;

fn distance_l2(x: &[real], y: &[real]) -> real {
    x.iter().zip(y).map(|(a, b)| (a - b) * (a - b)).sum()
}

pub struct ProductQuantizer {
    dim: usize,
    nsubq: usize,
    dsub: usize,
    lastdsub: usize,
    centroids: Vec<real>,
}

impl ProductQuantizer {
    pub fn new(dim: usize, dsub: usize) -> Self {
        let nsubq = (dim + dsub - 1) / dsub;
        let mut lastdsub = dim % dsub;
        if lastdsub == 0 {
            lastdsub = dsub;
        }
        ProductQuantizer {
            dim,
            nsubq,
            dsub,
            lastdsub,
            centroids: vec![0.0; dim * KSUB],
        }
    }

    pub fn nsubq(&self) -> usize {
        self.nsubq
    }

    fn subdim(&self, m: usize) -> usize {
        if m == self.nsubq - 1 {
            self.lastdsub
        } else {
            self.dsub
        }
    }

    pub fn centroid(&self, m: usize, i: usize) -> &[real] {
        if m == self.nsubq - 1 {
            let base = m * KSUB * self.dsub + i * self.lastdsub;
            &self.centroids[base..base + self.lastdsub]
        } else {
            let base = (m * KSUB + i) * self.dsub;
            &self.centroids[base..base + self.dsub]
        }
    }

    fn centroid_block(&mut self, m: usize) -> &mut [real] {
        let d = self.subdim(m);
        let base = m * KSUB * self.dsub;
        &mut self.centroids[base..base + KSUB * d]
    }

    fn assign_centroid(centroids: &[real], x: &[real], d: usize) -> (u8, real) {
        let mut best = 0u8;
        let mut best_dist = distance_l2(x, &centroids[..d]);
        for i in 1..KSUB {
            let dist = distance_l2(x, &centroids[i * d..][..d]);
            if dist < best_dist {
                best_dist = dist;
                best = i as u8;
            }
        }
        (best, best_dist)
    }

    fn e_step(x: &[real], centroids: &[real], codes: &mut [u8], d: usize) {
        for (point, code) in x.chunks_exact(d).zip(codes.iter_mut()) {
            let (c, _) = Self::assign_centroid(centroids, point, d);
            *code = c;
        }
    }

    fn m_step(x: &[real], centroids: &mut [real], codes: &[u8], d: usize, rng: &mut StdRng) {
        let n = codes.len();
        let mut nelts = vec![0i64; KSUB];
        centroids.fill(0.0);
        for (point, &code) in x.chunks_exact(d).zip(codes) {
            let c = &mut centroids[code as usize * d..][..d];
            for (acc, v) in c.iter_mut().zip(point) {
                *acc += v;
            }
            nelts[code as usize] += 1;
        }
        for (k, &cnt) in nelts.iter().enumerate() {
            if cnt > 0 {
                for v in &mut centroids[k * d..][..d] {
                    *v /= cnt as real;
                }
            }
        }
        // split a populated cluster into every empty one
        for k in 0..KSUB {
            if nelts[k] == 0 {
                let mut m = 0usize;
                let mut tries = 0usize;
                while rng.gen::<real>() * (n.saturating_sub(KSUB)) as real
                    >= (nelts[m] - 1) as real
                {
                    m = (m + 1) % KSUB;
                    tries += 1;
                    if tries > 8 * KSUB {
                        // degenerate distribution (fewer points than
                        // centroids): take any populated cluster
                        m = nelts.iter().position(|&c| c > 0).unwrap_or(0);
                        break;
                    }
                }
                for j in 0..d {
                    let sign = ((j % 2) as real) * 2.0 - 1.0;
                    centroids[k * d + j] = centroids[m * d + j] + sign * EPS;
                    centroids[m * d + j] -= sign * EPS;
                }
                nelts[k] = nelts[m] / 2;
                nelts[m] -= nelts[k];
            }
        }
    }

    fn kmeans(x: &[real], centroids: &mut [real], n: usize, d: usize, rng: &mut StdRng) {
        let mut perm: Vec<usize> = (0..n).collect();
        perm.shuffle(rng);
        for i in 0..KSUB {
            let src = perm[i % n];
            centroids[i * d..][..d].copy_from_slice(&x[src * d..][..d]);
        }
        let mut codes = vec![0u8; n];
        for _ in 0..NITER {
            Self::e_step(x, centroids, &mut codes, d);
            Self::m_step(x, centroids, &codes, d, rng);
        }
    }

    /// Learn one codebook per sub-quantizer from (a sample of) `n` rows of
    /// row-major data `x`.
    pub fn train(&mut self, n: usize, x: &[real]) -> Result<()> {
        if n == 0 {
            return Err(Error::runtime("cannot quantize an empty matrix".to_string()));
        }
        let mut rng = StdRng::seed_from_u64(SEED);
        let np = n.min(MAX_POINTS);
        let mut perm: Vec<usize> = (0..n).collect();
        let dim = self.dim;
        let mut slice = vec![0.0 as real; np * self.dsub];
        for m in 0..self.nsubq {
            let d = self.subdim(m);
            if np != n {
                perm.shuffle(&mut rng);
            }
            for (j, &row) in perm[..np].iter().enumerate() {
                slice[j * d..][..d].copy_from_slice(&x[row * dim + m * self.dsub..][..d]);
            }
            let centroids = self.centroid_block(m);
            Self::kmeans(&slice[..np * d], centroids, np, d, &mut rng);
        }
        Ok(())
    }

    pub fn compute_code(&self, x: &[real], code: &mut [u8]) {
        for m in 0..self.nsubq {
            let d = self.subdim(m);
            let base = m * KSUB * self.dsub;
            let block = &self.centroids[base..base + KSUB * d];
            let (c, _) = Self::assign_centroid(block, &x[m * self.dsub..][..d], d);
            code[m] = c;
        }
    }

    pub fn compute_codes(&self, x: &[real], codes: &mut [u8], n: usize) {
        for i in 0..n {
            self.compute_code(
                &x[i * self.dim..][..self.dim],
                &mut codes[i * self.nsubq..][..self.nsubq],
            );
        }
    }

    /// Dot product of `x` with the reconstruction of row `t`, scaled.
    pub fn mulcode(&self, x: &Vector, codes: &[u8], t: usize, alpha: real) -> real {
        let mut res = 0.0;
        let code = &codes[t * self.nsubq..][..self.nsubq];
        for m in 0..self.nsubq {
            let c = self.centroid(m, code[m] as usize);
            for (j, cv) in c.iter().enumerate() {
                res += x[m * self.dsub + j] * cv;
            }
        }
        res * alpha
    }

    /// `x += alpha * reconstruction(row t)`.
    pub fn addcode(&self, x: &mut Vector, codes: &[u8], t: usize, alpha: real) {
        let code = &codes[t * self.nsubq..][..self.nsubq];
        for m in 0..self.nsubq {
            let c = self.centroid(m, code[m] as usize);
            for (j, cv) in c.iter().enumerate() {
                x[m * self.dsub + j] += alpha * cv;
            }
        }
    }

    pub fn save<W: Write>(&self, out: &mut W) -> Result<()> {
        binio::write_i32(out, self.dim as i32)?;
        binio::write_i32(out, self.nsubq as i32)?;
        binio::write_i32(out, self.dsub as i32)?;
        binio::write_i32(out, self.lastdsub as i32)?;
        let bytes = bytemuck::cast_slice::<real, u8>(&self.centroids);
        out.write_all(bytes)?;
        Ok(())
    }

    pub fn load<R: Read>(inp: &mut R) -> Result<Self> {
        let dim = binio::read_i32(inp)? as usize;
        let nsubq = binio::read_i32(inp)? as usize;
        let dsub = binio::read_i32(inp)? as usize;
        let lastdsub = binio::read_i32(inp)? as usize;
        let mut centroids = vec![0.0 as real; dim * KSUB];
        inp.read_exact(bytemuck::cast_slice_mut::<real, u8>(&mut centroids))?;
        Ok(ProductQuantizer {
            dim,
            nsubq,
            dsub,
            lastdsub,
            centroids,
        })
    }
}

/// A matrix stored as per-row codebook indices plus (optionally) a
/// separately quantized per-row norm.
pub struct QuantMatrix {
    m: usize,
    n: usize,
    codesize: usize,
    codes: Vec<u8>,
    norm_codes: Vec<u8>,
    pq: ProductQuantizer,
    npq: Option<ProductQuantizer>,
    qnorm: bool,
}

impl QuantMatrix {
    pub fn quantize(mat: &DenseMatrix, dsub: usize, qnorm: bool) -> Result<Self> {
        let m = mat.rows();
        let n = mat.cols();
        let nsubq = (n + dsub - 1) / dsub;
        let codesize = m * nsubq;

        let mut data = vec![0.0 as real; m * n];
        for i in 0..m {
            for j in 0..n {
                data[i * n + j] = mat.at(i, j);
            }
        }

        let mut norm_codes = Vec::new();
        let mut npq = None;
        if qnorm {
            let mut norms = vec![0.0 as real; m];
            for i in 0..m {
                norms[i] = mat.l2_norm_row(i);
                if norms[i] > 0.0 {
                    for v in &mut data[i * n..][..n] {
                        *v /= norms[i];
                    }
                }
            }
            let mut q = ProductQuantizer::new(1, 1);
            q.train(m, &norms)?;
            norm_codes = vec![0u8; m];
            q.compute_codes(&norms, &mut norm_codes, m);
            npq = Some(q);
        }

        let mut pq = ProductQuantizer::new(n, dsub);
        pq.train(m, &data)?;
        let mut codes = vec![0u8; codesize];
        pq.compute_codes(&data, &mut codes, m);

        Ok(QuantMatrix {
            m,
            n,
            codesize,
            codes,
            norm_codes,
            pq,
            npq,
            qnorm,
        })
    }

    pub fn rows(&self) -> usize {
        self.m
    }

    pub fn cols(&self) -> usize {
        self.n
    }

    fn row_norm(&self, i: usize) -> real {
        match &self.npq {
            Some(npq) if self.qnorm => npq.centroid(0, self.norm_codes[i] as usize)[0],
            _ => 1.0,
        }
    }

    pub fn dot_row(&self, vec: &Vector, i: usize) -> Result<real> {
        if i >= self.m {
            return Err(Error::runtime(format!("row {i} out of range")));
        }
        Ok(self.pq.mulcode(vec, &self.codes, i, self.row_norm(i)))
    }

    pub fn add_row_to_vector(&self, vec: &mut Vector, i: usize, a: real) -> Result<()> {
        if i >= self.m {
            return Err(Error::runtime(format!("row {i} out of range")));
        }
        self.pq.addcode(vec, &self.codes, i, a * self.row_norm(i));
        Ok(())
    }

    pub fn save<W: Write>(&self, out: &mut W) -> Result<()> {
        binio::write_bool(out, self.qnorm)?;
        binio::write_i64(out, self.m as i64)?;
        binio::write_i64(out, self.n as i64)?;
        binio::write_i64(out, self.codesize as i64)?;
        out.write_all(&self.codes)?;
        self.pq.save(out)?;
        if self.qnorm {
            out.write_all(&self.norm_codes)?;
            self.npq.as_ref().expect("norm quantizer missing").save(out)?;
        }
        Ok(())
    }

    pub fn load<R: Read>(inp: &mut R) -> Result<Self> {
        let qnorm = binio::read_bool(inp)?;
        let m = binio::read_i64(inp)? as usize;
        let n = binio::read_i64(inp)? as usize;
        let codesize = binio::read_i64(inp)? as usize;
        let mut codes = vec![0u8; codesize];
        inp.read_exact(&mut codes)?;
        let pq = ProductQuantizer::load(inp)?;
        let mut norm_codes = Vec::new();
        let mut npq = None;
        if qnorm {
            norm_codes = vec![0u8; m];
            inp.read_exact(&mut norm_codes)?;
            npq = Some(ProductQuantizer::load(inp)?);
        }
        Ok(QuantMatrix {
            m,
            n,
            codesize,
            codes,
            norm_codes,
            pq,
            npq,
            qnorm,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_matrix(m: usize, n: usize) -> DenseMatrix {
        let mat = DenseMatrix::new(m, n);
        mat.uniform(0.5, 1, 7);
        mat
    }

    #[test]
    fn reconstruction_preserves_dot_products() {
        let mat = sample_matrix(40, 8);
        let q = QuantMatrix::quantize(&mat, 2, false).unwrap();

        let mut v = Vector::new(8);
        for j in 0..8 {
            v[j] = 0.1 * (j as real + 1.0);
        }
        for i in 0..40 {
            let exact = mat.dot_row(&v, i).unwrap();
            let approx = q.dot_row(&v, i).unwrap();
            assert!(
                (exact - approx).abs() < 0.15,
                "row {i}: exact {exact} vs approx {approx}"
            );
        }
    }

    #[test]
    fn norm_quantization_round_trip() {
        let mat = sample_matrix(30, 4);
        let q = QuantMatrix::quantize(&mat, 2, true).unwrap();
        let mut buf = Vec::new();
        q.save(&mut buf).unwrap();
        let l = QuantMatrix::load(&mut std::io::Cursor::new(buf)).unwrap();
        assert_eq!(l.rows(), 30);
        assert_eq!(l.cols(), 4);

        let mut v = Vector::new(4);
        v[0] = 1.0;
        v[3] = -1.0;
        for i in 0..30 {
            assert_eq!(q.dot_row(&v, i).unwrap(), l.dot_row(&v, i).unwrap());
        }
    }

    #[test]
    fn updates_are_rejected() {
        let mat = sample_matrix(10, 4);
        let q = crate::matrix::Matrix::Quant(QuantMatrix::quantize(&mat, 2, false).unwrap());
        let v = Vector::new(4);
        assert!(q.add_vector_to_row(&v, 0, 1.0).is_err());
    }
}
