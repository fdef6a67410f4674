//! Small dense square-matrix kernels.
//!
//! Only what substitution models need for 2–20 states: products, a Padé
//! matrix exponential, Gauss–Jordan inversion and a cyclic Jacobi
//! eigendecomposition for symmetric matrices. Storage is row-major.

use std::ops::{Index, IndexMut};

use sylva_core::{Result, SylvaError};

/// A dense `n × n` matrix in row-major order.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Matrix {
    n: usize,
    data: Vec<f64>,
}

impl Matrix {
    /// All-zero matrix.
    pub fn zeros(n: usize) -> Self {
        Self {
            n,
            data: vec![0.0; n * n],
        }
    }

    /// Identity matrix.
    pub fn identity(n: usize) -> Self {
        let mut m = Self::zeros(n);
        for i in 0..n {
            m[(i, i)] = 1.0;
        }
        m
    }

    /// Diagonal matrix from a vector.
    pub fn from_diagonal(diag: &[f64]) -> Self {
        let mut m = Self::zeros(diag.len());
        for (i, &d) in diag.iter().enumerate() {
            m[(i, i)] = d;
        }
        m
    }

    /// Build from nested rows. Every row must have `rows.len()` entries.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let n = rows.len();
        let mut data = Vec::with_capacity(n * n);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != n {
                return Err(SylvaError::InvalidInput(format!(
                    "row {} has {} entries, expected {}",
                    i,
                    row.len(),
                    n
                )));
            }
            data.extend_from_slice(row);
        }
        Ok(Self { n, data })
    }

    /// Dimension.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Row `i` as a slice.
    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.n..(i + 1) * self.n]
    }

    /// Nested-row copy, for callers that want `Vec<Vec<f64>>`.
    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        (0..self.n).map(|i| self.row(i).to_vec()).collect()
    }

    /// Matrix product `self · other`.
    pub fn matmul(&self, other: &Matrix) -> Matrix {
        let n = self.n;
        let mut out = Matrix::zeros(n);
        for i in 0..n {
            for k in 0..n {
                let a = self.data[i * n + k];
                if a == 0.0 {
                    continue;
                }
                for j in 0..n {
                    out.data[i * n + j] += a * other.data[k * n + j];
                }
            }
        }
        out
    }

    /// `out[i] = Σⱼ self[i][j] · v[j]`.
    pub fn mul_vec_into(&self, v: &[f64], out: &mut [f64]) {
        let n = self.n;
        for (i, o) in out.iter_mut().enumerate().take(n) {
            let row = &self.data[i * n..(i + 1) * n];
            *o = row.iter().zip(v).map(|(a, b)| a * b).sum();
        }
    }

    /// `out[j] = Σᵢ v[i] · self[i][j]` (row vector times matrix).
    pub fn vec_mul_into(&self, v: &[f64], out: &mut [f64]) {
        let n = self.n;
        for o in out.iter_mut().take(n) {
            *o = 0.0;
        }
        for (i, &vi) in v.iter().enumerate().take(n) {
            if vi == 0.0 {
                continue;
            }
            let row = &self.data[i * n..(i + 1) * n];
            for (o, &a) in out.iter_mut().zip(row) {
                *o += vi * a;
            }
        }
    }

    /// Bilinear form `uᵀ · self · v`.
    pub fn bilinear(&self, u: &[f64], v: &[f64]) -> f64 {
        let n = self.n;
        let mut total = 0.0;
        for (i, &ui) in u.iter().enumerate().take(n) {
            if ui == 0.0 {
                continue;
            }
            let row = &self.data[i * n..(i + 1) * n];
            let dot: f64 = row.iter().zip(v).map(|(a, b)| a * b).sum();
            total += ui * dot;
        }
        total
    }

    /// Element-wise `self · s`.
    pub fn scaled(&self, s: f64) -> Matrix {
        Matrix {
            n: self.n,
            data: self.data.iter().map(|&x| x * s).collect(),
        }
    }

    /// In-place `self += s · other`.
    pub fn add_scaled(&mut self, other: &Matrix, s: f64) {
        for (a, &b) in self.data.iter_mut().zip(&other.data) {
            *a += s * b;
        }
    }

    /// Transpose.
    pub fn transpose(&self) -> Matrix {
        let n = self.n;
        let mut t = Matrix::zeros(n);
        for i in 0..n {
            for j in 0..n {
                t.data[j * n + i] = self.data[i * n + j];
            }
        }
        t
    }

    /// Maximum absolute column sum. NaN if any entry is NaN.
    pub fn norm_one(&self) -> f64 {
        let n = self.n;
        (0..n)
            .map(|j| (0..n).map(|i| self.data[i * n + j].abs()).sum::<f64>())
            .fold(0.0, |acc: f64, s| if acc.is_nan() || s.is_nan() { f64::NAN } else { acc.max(s) })
    }

    /// Largest absolute element-wise difference.
    pub fn max_abs_diff(&self, other: &Matrix) -> f64 {
        self.data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }

    /// Inverse via Gauss–Jordan elimination with partial pivoting.
    pub fn inverse(&self) -> Result<Matrix> {
        let n = self.n;
        let cols = 2 * n;
        let mut aug = vec![0.0; n * cols];
        for i in 0..n {
            for j in 0..n {
                aug[i * cols + j] = self.data[i * n + j];
            }
            aug[i * cols + n + i] = 1.0;
        }

        for col in 0..n {
            let mut max_row = col;
            let mut max_val = aug[col * cols + col].abs();
            for row in (col + 1)..n {
                let val = aug[row * cols + col].abs();
                if val > max_val {
                    max_val = val;
                    max_row = row;
                }
            }
            if max_val < 1e-300 {
                return Err(SylvaError::Singular(format!(
                    "zero pivot in column {} of a {}x{} matrix",
                    col, n, n
                )));
            }
            if max_row != col {
                for j in 0..cols {
                    aug.swap(col * cols + j, max_row * cols + j);
                }
            }
            let pivot = aug[col * cols + col];
            for j in 0..cols {
                aug[col * cols + j] /= pivot;
            }
            for row in 0..n {
                if row == col {
                    continue;
                }
                let factor = aug[row * cols + col];
                if factor == 0.0 {
                    continue;
                }
                for j in 0..cols {
                    let above = aug[col * cols + j];
                    aug[row * cols + j] -= factor * above;
                }
            }
        }

        let mut inv = Matrix::zeros(n);
        for i in 0..n {
            for j in 0..n {
                inv.data[i * n + j] = aug[i * cols + n + j];
            }
        }
        Ok(inv)
    }

    /// Matrix exponential `exp(self)`.
    ///
    /// Scaling and squaring with a diagonal [6/6] Padé approximant: the
    /// argument is halved until its 1-norm is at most 1/2, the approximant is
    /// evaluated, and the result is squared back up.
    pub fn expm(&self) -> Result<Matrix> {
        const ORDER: usize = 6;
        let n = self.n;
        let norm = self.norm_one();
        if !norm.is_finite() {
            return Err(SylvaError::Numerical(
                "matrix exponential of a non-finite matrix".into(),
            ));
        }
        let squarings = if norm > 0.5 {
            (norm / 0.5).log2().ceil().max(0.0) as u32
        } else {
            0
        };
        let a = self.scaled(1.0 / 2f64.powi(squarings as i32));

        let identity = Matrix::identity(n);
        let mut c = 0.5;
        let mut x = a.clone();
        let mut num = identity.clone();
        num.add_scaled(&a, c);
        let mut den = identity;
        den.add_scaled(&a, -c);
        let mut positive = true;
        for k in 2..=ORDER {
            c *= (ORDER - k + 1) as f64 / (k * (2 * ORDER - k + 1)) as f64;
            x = a.matmul(&x);
            num.add_scaled(&x, c);
            den.add_scaled(&x, if positive { c } else { -c });
            positive = !positive;
        }

        let mut e = den.inverse()?.matmul(&num);
        for _ in 0..squarings {
            e = e.matmul(&e);
        }
        Ok(e)
    }

    /// Eigendecomposition of a symmetric matrix by cyclic Jacobi rotations.
    ///
    /// Returns `(eigenvalues, vectors)` where column `k` of `vectors` is the
    /// unit eigenvector for `eigenvalues[k]`. Only the symmetric part of
    /// `self` is meaningful.
    pub fn symmetric_eigen(&self) -> (Vec<f64>, Matrix) {
        const MAX_SWEEPS: usize = 100;
        let n = self.n;
        let mut a = self.clone();
        let mut v = Matrix::identity(n);

        for _ in 0..MAX_SWEEPS {
            let off: f64 = (0..n)
                .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
                .map(|(i, j)| a[(i, j)] * a[(i, j)])
                .sum();
            let scale: f64 = (0..n).map(|i| a[(i, i)] * a[(i, i)]).sum::<f64>() + off;
            if off <= 1e-30 * scale.max(1e-300) {
                break;
            }
            for p in 0..n {
                for q in (p + 1)..n {
                    let apq = a[(p, q)];
                    if apq.abs() < 1e-300 {
                        continue;
                    }
                    let theta = (a[(q, q)] - a[(p, p)]) / (2.0 * apq);
                    let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                    let t = if theta == 0.0 { 1.0 } else { t };
                    let c = 1.0 / (t * t + 1.0).sqrt();
                    let s = t * c;

                    for k in 0..n {
                        let akp = a[(k, p)];
                        let akq = a[(k, q)];
                        a[(k, p)] = c * akp - s * akq;
                        a[(k, q)] = s * akp + c * akq;
                    }
                    for k in 0..n {
                        let apk = a[(p, k)];
                        let aqk = a[(q, k)];
                        a[(p, k)] = c * apk - s * aqk;
                        a[(q, k)] = s * apk + c * aqk;
                    }
                    for k in 0..n {
                        let vkp = v[(k, p)];
                        let vkq = v[(k, q)];
                        v[(k, p)] = c * vkp - s * vkq;
                        v[(k, q)] = s * vkp + c * vkq;
                    }
                }
            }
        }

        let values = (0..n).map(|i| a[(i, i)]).collect();
        (values, v)
    }
}

impl Index<(usize, usize)> for Matrix {
    type Output = f64;

    fn index(&self, (i, j): (usize, usize)) -> &f64 {
        &self.data[i * self.n + j]
    }
}

impl IndexMut<(usize, usize)> for Matrix {
    fn index_mut(&mut self, (i, j): (usize, usize)) -> &mut f64 {
        &mut self.data[i * self.n + j]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: &Matrix, b: &Matrix, tol: f64) -> bool {
        a.max_abs_diff(b) < tol
    }

    #[test]
    fn matmul_identity() {
        let m = Matrix::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(m.matmul(&Matrix::identity(2)), m);
    }

    #[test]
    fn from_rows_rejects_ragged() {
        assert!(Matrix::from_rows(&[vec![1.0, 2.0], vec![3.0]]).is_err());
    }

    #[test]
    fn inverse_roundtrip() {
        let m = Matrix::from_rows(&[
            vec![4.0, 7.0, 2.0],
            vec![3.0, 6.0, 1.0],
            vec![2.0, 5.0, 3.0],
        ])
        .unwrap();
        let inv = m.inverse().unwrap();
        assert!(approx_eq(&m.matmul(&inv), &Matrix::identity(3), 1e-12));
    }

    #[test]
    fn inverse_singular() {
        let m = Matrix::from_rows(&[vec![1.0, 2.0], vec![2.0, 4.0]]).unwrap();
        assert!(matches!(m.inverse(), Err(SylvaError::Singular(_))));
    }

    #[test]
    fn expm_zero_is_identity() {
        let e = Matrix::zeros(4).expm().unwrap();
        assert!(approx_eq(&e, &Matrix::identity(4), 1e-15));
    }

    #[test]
    fn expm_diagonal() {
        let d = Matrix::from_diagonal(&[-1.0, 0.5, 3.0]);
        let e = d.expm().unwrap();
        assert!(((e[(0, 0)]) - (-1.0f64).exp()).abs() < 1e-12);
        assert!(((e[(1, 1)]) - 0.5f64.exp()).abs() < 1e-12);
        assert!(((e[(2, 2)]) - 3.0f64.exp()).abs() < 1e-10);
        assert!(e[(0, 1)].abs() < 1e-14);
    }

    #[test]
    fn expm_two_state_closed_form() {
        // Q = [[-a, a], [b, -b]]: P01(t) = a/(a+b) · (1 - e^{-(a+b)t}).
        let (a, b, t) = (0.7, 0.3, 2.5);
        let q = Matrix::from_rows(&[vec![-a, a], vec![b, -b]]).unwrap();
        let p = q.scaled(t).expm().unwrap();
        let expected = a / (a + b) * (1.0 - (-(a + b) * t).exp());
        assert!((p[(0, 1)] - expected).abs() < 1e-12);
        assert!((p[(0, 0)] + p[(0, 1)] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn expm_rejects_nan() {
        let mut m = Matrix::zeros(2);
        m[(0, 1)] = f64::NAN;
        assert!(m.norm_one().is_nan());
        assert!(matches!(m.expm(), Err(SylvaError::Numerical(_))));
        let mut inf = Matrix::zeros(3);
        inf[(2, 0)] = f64::INFINITY;
        assert!(inf.expm().is_err());
    }

    #[test]
    fn symmetric_eigen_diagonal() {
        let m = Matrix::from_diagonal(&[1.0, 2.0, 3.0]);
        let (vals, _) = m.symmetric_eigen();
        let mut sorted = vals.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert!((sorted[0] - 1.0).abs() < 1e-12);
        assert!((sorted[1] - 2.0).abs() < 1e-12);
        assert!((sorted[2] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn symmetric_eigen_reconstructs() {
        let m = Matrix::from_rows(&[
            vec![2.0, -1.0, 0.0, 0.5],
            vec![-1.0, 2.0, -1.0, 0.0],
            vec![0.0, -1.0, 2.0, 0.3],
            vec![0.5, 0.0, 0.3, 1.0],
        ])
        .unwrap();
        let (vals, v) = m.symmetric_eigen();
        let rebuilt = v
            .matmul(&Matrix::from_diagonal(&vals))
            .matmul(&v.transpose());
        assert!(approx_eq(&rebuilt, &m, 1e-10));
        assert!(approx_eq(&v.matmul(&v.transpose()), &Matrix::identity(4), 1e-10));
    }

    #[test]
    fn vector_products() {
        let m = Matrix::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        let mut out = [0.0; 2];
        m.mul_vec_into(&[1.0, 1.0], &mut out);
        assert_eq!(out, [3.0, 7.0]);
        m.vec_mul_into(&[1.0, 1.0], &mut out);
        assert_eq!(out, [4.0, 6.0]);
        assert_eq!(m.bilinear(&[1.0, 0.0], &[0.0, 1.0]), 2.0);
    }
}
