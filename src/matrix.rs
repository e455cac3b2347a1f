use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};

use aligned_box::AlignedBox;
use rand::{Rng, SeedableRng};

use crate::binio;
use crate::error::{Error, Result};
use crate::pq::QuantMatrix;
use crate::real;
use crate::vector::Vector;

const ALIGNMENT: usize = 128;

/// A shared mutable `f32` cell. Training threads update matrix cells
/// concurrently without locks; lost updates are tolerated (hogwild SGD),
/// so all accesses are relaxed.
#[derive(Default)]
#[repr(transparent)]
pub struct Real {
    bits: AtomicU32,
}

impl Real {
    pub fn get(&self) -> real {
        real::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: real) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn add(&self, x: real) {
        self.set(self.get() + x);
    }
}

/// Row-major dense matrix over atomic cells, shared by all training
/// threads.
pub struct DenseMatrix {
    m: usize,
    n: usize,
    data: AlignedBox<[Real]>,
}

impl DenseMatrix {
    pub fn new(m: usize, n: usize) -> Self {
        DenseMatrix {
            m,
            n,
            data: AlignedBox::slice_from_default(ALIGNMENT, m * n)
                .expect("matrix allocation failed"),
        }
    }

    pub fn rows(&self) -> usize {
        self.m
    }

    pub fn cols(&self) -> usize {
        self.n
    }

    pub fn zero(&self) {
        for cell in self.data.iter() {
            cell.set(0.0);
        }
    }

    /// Uniform init in `(-a, a)`. The data is split into `blocks` ranges
    /// seeded independently, so initialization does not depend on how many
    /// threads will train afterwards.
    pub fn uniform(&self, a: real, blocks: usize, seed: i32) {
        let blocks = blocks.max(1);
        let total = self.m * self.n;
        for b in 0..blocks {
            let start = total * b / blocks;
            let end = total * (b + 1) / blocks;
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed as u64 + b as u64);
            for cell in &self.data[start..end] {
                cell.set(rng.gen_range(-a..a));
            }
        }
    }

    pub fn at(&self, i: usize, j: usize) -> real {
        self.data[i * self.n + j].get()
    }

    pub fn set_at(&self, i: usize, j: usize, v: real) {
        self.data[i * self.n + j].set(v);
    }

    pub fn row(&self, i: usize) -> &[Real] {
        &self.data[i * self.n..][..self.n]
    }

    pub fn add_row_to_vector(&self, vec: &mut Vector, i: usize, a: real) {
        debug_assert!(i < self.m);
        for (v, cell) in vec.as_mut_slice().iter_mut().zip(self.row(i)) {
            *v += a * cell.get();
        }
    }

    pub fn add_vector_to_row(&self, vec: &Vector, i: usize, a: real) -> Result<()> {
        debug_assert!(i < self.m);
        for (v, cell) in vec.as_slice().iter().zip(self.row(i)) {
            if v.is_nan() {
                return Err(Error::runtime("encountered NaN in gradient".to_string()));
            }
            cell.add(a * v);
        }
        Ok(())
    }

    pub fn dot_row(&self, vec: &Vector, i: usize) -> Result<real> {
        debug_assert!(i < self.m);
        let mut d = 0.0;
        for (v, cell) in vec.as_slice().iter().zip(self.row(i)) {
            d += v * cell.get();
        }
        if d.is_nan() {
            return Err(Error::runtime(format!("encountered NaN in matrix row {i}")));
        }
        Ok(d)
    }

    pub fn l2_norm_row(&self, i: usize) -> real {
        self.row(i).iter().map(|c| c.get() * c.get()).sum::<real>().sqrt()
    }

    pub fn l2_norm_rows(&self, norms: &mut Vector) {
        debug_assert_eq!(norms.size(), self.m);
        for i in 0..self.m {
            norms[i] = self.l2_norm_row(i);
        }
    }

    pub fn save<W: Write>(&self, out: &mut W) -> Result<()> {
        binio::write_i64(out, self.m as i64)?;
        binio::write_i64(out, self.n as i64)?;
        let snapshot: Vec<real> = self.data.iter().map(Real::get).collect();
        out.write_all(bytemuck::cast_slice::<real, u8>(&snapshot))?;
        Ok(())
    }

    pub fn load<R: Read>(inp: &mut R) -> Result<Self> {
        let m = binio::read_i64(inp)? as usize;
        let n = binio::read_i64(inp)? as usize;
        let mut buf = vec![0.0 as real; m * n];
        inp.read_exact(bytemuck::cast_slice_mut::<real, u8>(&mut buf))?;
        let mat = DenseMatrix::new(m, n);
        for (cell, v) in mat.data.iter().zip(buf) {
            cell.set(v);
        }
        Ok(mat)
    }

    pub fn dump<W: Write>(&self, out: &mut W) -> Result<()> {
        writeln!(out, "{} {}", self.m, self.n)?;
        for i in 0..self.m {
            let mut first = true;
            for j in 0..self.n {
                if !first {
                    write!(out, " ")?;
                }
                first = false;
                write!(out, "{}", self.at(i, j))?;
            }
            writeln!(out)?;
        }
        Ok(())
    }
}

/// Either a trainable dense matrix or a product-quantized one loaded from
/// a compressed model.
pub enum Matrix {
    Dense(DenseMatrix),
    Quant(QuantMatrix),
}

impl Matrix {
    pub fn rows(&self) -> usize {
        match self {
            Matrix::Dense(m) => m.rows(),
            Matrix::Quant(m) => m.rows(),
        }
    }

    pub fn cols(&self) -> usize {
        match self {
            Matrix::Dense(m) => m.cols(),
            Matrix::Quant(m) => m.cols(),
        }
    }

    pub fn dot_row(&self, vec: &Vector, i: usize) -> Result<real> {
        match self {
            Matrix::Dense(m) => m.dot_row(vec, i),
            Matrix::Quant(m) => m.dot_row(vec, i),
        }
    }

    pub fn add_row_to_vector(&self, vec: &mut Vector, i: usize, a: real) -> Result<()> {
        match self {
            Matrix::Dense(m) => {
                m.add_row_to_vector(vec, i, a);
                Ok(())
            }
            Matrix::Quant(m) => m.add_row_to_vector(vec, i, a),
        }
    }

    pub fn add_vector_to_row(&self, vec: &Vector, i: usize, a: real) -> Result<()> {
        match self {
            Matrix::Dense(m) => m.add_vector_to_row(vec, i, a),
            Matrix::Quant(_) => Err(Error::runtime(
                "cannot update a quantized matrix".to_string(),
            )),
        }
    }

    pub fn save<W: Write>(&self, out: &mut W) -> Result<()> {
        match self {
            Matrix::Dense(m) => m.save(out),
            Matrix::Quant(m) => m.save(out),
        }
    }

    pub fn as_dense(&self) -> Result<&DenseMatrix> {
        match self {
            Matrix::Dense(m) => Ok(m),
            Matrix::Quant(_) => Err(Error::runtime(
                "can't export quantized matrix".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn row_ops() {
        let m = DenseMatrix::new(2, 3);
        m.set_at(1, 0, 1.0);
        m.set_at(1, 1, 2.0);
        m.set_at(1, 2, 2.0);

        let mut v = Vector::new(3);
        m.add_row_to_vector(&mut v, 1, 2.0);
        assert_eq!(v.as_slice(), &[2.0, 4.0, 4.0]);
        assert_eq!(m.dot_row(&v, 1).unwrap(), 2.0 + 8.0 + 8.0);
        assert_eq!(m.l2_norm_row(1), 3.0);
        assert_eq!(m.l2_norm_row(0), 0.0);
    }

    #[test]
    fn nan_update_is_detected() {
        let m = DenseMatrix::new(1, 2);
        let mut v = Vector::new(2);
        v[0] = real::NAN;
        assert!(m.add_vector_to_row(&v, 0, 1.0).is_err());
    }

    #[test]
    fn uniform_is_deterministic_per_block_count() {
        let a = DenseMatrix::new(4, 5);
        let b = DenseMatrix::new(4, 5);
        a.uniform(0.1, 3, 42);
        b.uniform(0.1, 3, 42);
        for i in 0..4 {
            for j in 0..5 {
                assert_eq!(a.at(i, j), b.at(i, j));
                assert!(a.at(i, j).abs() < 0.1);
            }
        }
    }

    #[test]
    fn save_load_round_trip() {
        let m = DenseMatrix::new(2, 2);
        m.set_at(0, 1, -1.5);
        m.set_at(1, 0, 3.25);
        let mut buf = Vec::new();
        m.save(&mut buf).unwrap();
        let l = DenseMatrix::load(&mut Cursor::new(buf)).unwrap();
        assert_eq!(l.rows(), 2);
        assert_eq!(l.at(0, 1), -1.5);
        assert_eq!(l.at(1, 0), 3.25);
    }
}
