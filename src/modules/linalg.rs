//! Small dense linear algebra on the host
//!
//! Candle has no determinant or inverse kernels. The channel-mixing matrices
//! are tiny (`n_split × n_split`), so they are pulled to the host as f64
//! `nalgebra` matrices and factored with partial-pivot LU.

use candle_core::{DType, Device, Tensor};
use nalgebra::DMatrix;

use crate::error::{OverFlowError, Result};

/// Pivots below this magnitude count as singular
const SINGULAR_PIVOT: f64 = 1e-12;

/// Square f64 matrix on the host
#[derive(Debug, Clone, PartialEq)]
pub struct HostMatrix {
    matrix: DMatrix<f64>,
}

impl HostMatrix {
    /// `data` is row-major.
    pub fn new(n: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != n * n {
            return Err(OverFlowError::ShapeMismatch(format!(
                "expected {} entries for a {}x{} matrix, got {}",
                n * n,
                n,
                n,
                data.len()
            )));
        }
        Ok(Self {
            matrix: DMatrix::from_row_slice(n, n, &data),
        })
    }

    pub fn from_tensor(t: &Tensor) -> Result<Self> {
        let (rows, cols) = t.dims2()?;
        if rows != cols {
            return Err(OverFlowError::ShapeMismatch(format!(
                "mixing matrix must be square, got {}x{}",
                rows, cols
            )));
        }
        let data = t.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
        Self::new(rows, data)
    }

    pub fn to_tensor(&self, dtype: DType, device: &Device) -> Result<Tensor> {
        let n = self.dim();
        let row_major: Vec<f64> = self.matrix.transpose().iter().copied().collect();
        Ok(Tensor::from_vec(row_major, (n, n), device)?.to_dtype(dtype)?)
    }

    pub fn dim(&self) -> usize {
        self.matrix.nrows()
    }

    /// Diagonal of `U` in `PA = LU`, rejecting singular or non-finite input
    fn pivots(&self) -> Result<Vec<f64>> {
        let lu = self.matrix.clone().lu();
        let pivots: Vec<f64> = lu.u().diagonal().iter().copied().collect();
        if let Some((column, pivot)) = pivots
            .iter()
            .enumerate()
            .find(|&(_, p)| p.abs() < SINGULAR_PIVOT || !p.is_finite())
        {
            return Err(OverFlowError::NumericalDegeneracy(format!(
                "singular mixing matrix (pivot {:e} at column {})",
                pivot, column
            )));
        }
        Ok(pivots)
    }

    /// `log |det A|`, summed over the LU pivots
    pub fn log_abs_det(&self) -> Result<f64> {
        Ok(self.pivots()?.iter().map(|p| p.abs().ln()).sum())
    }

    pub fn inverse(&self) -> Result<Self> {
        self.pivots()?;
        let matrix = self.matrix.clone().lu().try_inverse().ok_or_else(|| {
            OverFlowError::NumericalDegeneracy("mixing matrix has no inverse".to_string())
        })?;
        Ok(Self { matrix })
    }

    /// Largest absolute elementwise difference
    pub fn max_abs_diff(&self, other: &Self) -> f64 {
        if self.matrix.shape() != other.matrix.shape() {
            return f64::INFINITY;
        }
        (&self.matrix - &other.matrix).amax()
    }
}
