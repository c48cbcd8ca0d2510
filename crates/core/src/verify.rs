//! Numeric comparison of a computed tensor against a reference.
//!
//! Element `a` of the computed tensor is close to `b` of the reference when
//! `|a - b| <= atol + rtol * |b|`. NaN is never close to anything.

use std::fmt;
use std::path::Path;

use candle_core::{DType, Device, Tensor};

use crate::tensor_io::{self, TensorIoError};

/// Smallest relative tolerance accepted by [`check_close`].
pub const MIN_RTOL: f64 = 1e-4;
/// Largest relative tolerance accepted by [`check_close`].
pub const MAX_RTOL: f64 = 1e-3;
/// Default absolute tolerance.
pub const DEFAULT_ATOL: f64 = 1e-6;

/// Elements reported in full by [`NumericMismatch`]'s `Display`.
const DISPLAY_LIMIT: usize = 10;

#[derive(thiserror::Error, Debug)]
pub enum VerifyError {
    #[error(transparent)]
    Mismatch(#[from] NumericMismatch),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    TensorIo(#[from] TensorIoError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, VerifyError>;

/// One element outside tolerance.
#[derive(Debug, Clone, PartialEq)]
pub struct MismatchEntry {
    /// Row-major flat index.
    pub index: usize,
    /// Multi-dimensional coordinates.
    pub coords: Vec<usize>,
    pub computed: f64,
    pub reference: f64,
    /// `|computed - reference|`.
    pub residual: f64,
}

/// Report of every element outside tolerance.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericMismatch {
    pub shape: Vec<usize>,
    pub total: usize,
    pub rtol: f64,
    pub atol: f64,
    pub entries: Vec<MismatchEntry>,
}

impl NumericMismatch {
    pub fn indices(&self) -> Vec<usize> {
        self.entries.iter().map(|e| e.index).collect()
    }

    pub fn max_residual(&self) -> f64 {
        self.entries
            .iter()
            .map(|e| e.residual)
            .fold(0.0, |acc, r| if r.is_nan() || r > acc { r } else { acc })
    }
}

impl fmt::Display for NumericMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} of {} elements differ (rtol={:e}, atol={:e}, max residual {:e})",
            self.entries.len(),
            self.total,
            self.rtol,
            self.atol,
            self.max_residual()
        )?;
        for e in self.entries.iter().take(DISPLAY_LIMIT) {
            writeln!(
                f,
                "  at {:?}: computed {:e}, reference {:e}, residual {:e}",
                e.coords, e.computed, e.reference, e.residual
            )?;
        }
        if self.entries.len() > DISPLAY_LIMIT {
            writeln!(f, "  ... {} more", self.entries.len() - DISPLAY_LIMIT)?;
        }
        Ok(())
    }
}

impl std::error::Error for NumericMismatch {}

fn is_close(a: f64, b: f64, rtol: f64, atol: f64) -> bool {
    if a == b {
        return true;
    }
    // Unequal infinities would otherwise pass as `inf <= inf`.
    if a.is_infinite() || b.is_infinite() {
        return false;
    }
    (a - b).abs() <= atol + rtol * b.abs()
}

fn unravel(mut index: usize, shape: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; shape.len()];
    for (axis, &dim) in shape.iter().enumerate().rev() {
        if dim > 0 {
            coords[axis] = index % dim;
            index /= dim;
        }
    }
    coords
}

/// Compare `computed` against `reference` elementwise.
///
/// `rtol` must lie in `[MIN_RTOL, MAX_RTOL]`. Returns
/// [`VerifyError::Mismatch`] listing every element outside tolerance.
pub fn check_close(computed: &Tensor, reference: &Tensor, rtol: f64, atol: f64) -> Result<()> {
    if !(MIN_RTOL..=MAX_RTOL).contains(&rtol) {
        return Err(VerifyError::Configuration(format!(
            "rtol {rtol:e} outside [{MIN_RTOL:e}, {MAX_RTOL:e}]"
        )));
    }
    if atol.is_nan() || atol < 0.0 {
        return Err(VerifyError::Configuration(format!(
            "atol must be non-negative, got {atol:e}"
        )));
    }
    if computed.dims() != reference.dims() {
        return Err(VerifyError::Configuration(format!(
            "computed shape {:?} differs from reference shape {:?}",
            computed.dims(),
            reference.dims()
        )));
    }

    let shape = reference.dims().to_vec();
    let a = computed.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()?;
    let b = reference.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()?;

    let entries: Vec<MismatchEntry> = a
        .iter()
        .zip(&b)
        .enumerate()
        .filter(|&(_, (&x, &y))| !is_close(x, y, rtol, atol))
        .map(|(index, (&x, &y))| MismatchEntry {
            index,
            coords: unravel(index, &shape),
            computed: x,
            reference: y,
            residual: (x - y).abs(),
        })
        .collect();

    if entries.is_empty() {
        tracing::debug!(elements = b.len(), rtol, atol, "tensors match");
        return Ok(());
    }

    tracing::warn!(
        mismatches = entries.len(),
        elements = b.len(),
        rtol,
        atol,
        "tensors differ"
    );
    Err(NumericMismatch {
        shape,
        total: b.len(),
        rtol,
        atol,
        entries,
    }
    .into())
}

/// [`check_close`] on two persisted tensors.
pub fn check_files(
    computed_base: impl AsRef<Path>,
    reference_base: impl AsRef<Path>,
    rtol: f64,
    atol: f64,
) -> Result<()> {
    let computed = tensor_io::load(computed_base, &Device::Cpu)?;
    let reference = tensor_io::load(reference_base, &Device::Cpu)?;
    check_close(&computed, &reference, rtol, atol)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn t(values: &[f32], shape: (usize, usize)) -> Tensor {
        Tensor::from_vec(values.to_vec(), shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn identical_tensors_match() {
        let a = t(&[1.0, 2.0, 3.0, 4.0], (2, 2));
        check_close(&a, &a, 1e-4, DEFAULT_ATOL).unwrap();
    }

    #[test]
    fn relative_tolerance_scales_with_reference() {
        let reference = t(&[1000.0, 1.0], (1, 2));
        let computed = t(&[1000.5, 1.0], (1, 2));
        check_close(&computed, &reference, 1e-3, 0.0).unwrap();
        assert!(check_close(&computed, &reference, 1e-4, 0.0).is_err());
    }

    #[test]
    fn report_lists_coordinates_and_residuals() {
        let reference = t(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0], (2, 3));
        let computed = t(&[0.0, 1.0, 2.5, 3.0, 4.0, 4.0], (2, 3));

        let err = check_close(&computed, &reference, 1e-4, DEFAULT_ATOL).unwrap_err();
        let VerifyError::Mismatch(report) = err else {
            panic!("expected mismatch");
        };
        assert_eq!(report.indices(), vec![2, 5]);
        assert_eq!(report.entries[0].coords, vec![0, 2]);
        assert_eq!(report.entries[1].coords, vec![1, 2]);
        assert_eq!(report.entries[0].computed, 2.5);
        assert_eq!(report.entries[1].reference, 5.0);
        assert_eq!(report.max_residual(), 1.0);
        assert!(report.to_string().starts_with("2 of 6 elements differ"));
    }

    #[test]
    fn nan_never_matches() {
        let reference = t(&[f32::NAN, 1.0], (1, 2));
        let err = check_close(&reference, &reference, 1e-3, 1.0).unwrap_err();
        assert!(matches!(err, VerifyError::Mismatch(ref m) if m.indices() == vec![0]));
    }

    #[test]
    fn equal_infinities_match() {
        let reference = t(&[f32::INFINITY, f32::NEG_INFINITY, 2.0], (1, 3));
        check_close(&reference, &reference, 1e-3, DEFAULT_ATOL).unwrap();

        let flipped = t(&[f32::NEG_INFINITY, f32::NEG_INFINITY, 1e30], (1, 3));
        let err = check_close(&flipped, &reference, 1e-3, DEFAULT_ATOL).unwrap_err();
        assert!(matches!(err, VerifyError::Mismatch(ref m) if m.indices() == vec![0, 2]));
    }

    #[test]
    fn tolerance_bounds_enforced() {
        let a = t(&[1.0], (1, 1));
        for rtol in [1e-5, 1e-2, f64::NAN] {
            assert!(matches!(
                check_close(&a, &a, rtol, DEFAULT_ATOL),
                Err(VerifyError::Configuration(_))
            ));
        }
        assert!(matches!(
            check_close(&a, &a, 1e-4, -1.0),
            Err(VerifyError::Configuration(_))
        ));
    }

    #[test]
    fn shape_mismatch_is_configuration_error() {
        let a = t(&[1.0, 2.0], (1, 2));
        let b = t(&[1.0, 2.0], (2, 1));
        assert!(matches!(
            check_close(&a, &b, 1e-4, DEFAULT_ATOL),
            Err(VerifyError::Configuration(_))
        ));
    }

    #[test]
    fn files_are_compared() {
        let dir = tempdir().unwrap();
        let a = t(&[1.0, 2.0, 3.0, 4.0], (2, 2));
        tensor_io::save(dir.path().join("out"), &a).unwrap();
        tensor_io::save(dir.path().join("ref"), &a).unwrap();
        check_files(dir.path().join("out"), dir.path().join("ref"), 1e-3, DEFAULT_ATOL).unwrap();
    }

    #[test]
    fn unravel_row_major() {
        assert_eq!(unravel(0, &[2, 3, 4]), vec![0, 0, 0]);
        assert_eq!(unravel(23, &[2, 3, 4]), vec![1, 2, 3]);
        assert_eq!(unravel(5, &[6]), vec![5]);
    }
}
