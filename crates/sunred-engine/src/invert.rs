//! Negated block inversion.
//!
//! Every Schur-complement step needs `-YB⁻¹` for its eliminated block. The
//! 1x1 and 2x2 cases use closed forms; larger blocks run a Jordan sweep in
//! the fixed order `0..n` — the elimination order is chosen externally and
//! is never repivoted. A pivot whose magnitude falls below [`PIVOT_MIN`] is
//! replaced by the large reciprocal [`PIVOT_MAX`], silently regularizing a
//! near-singular block.

use nalgebra::DMatrix;
use sunred_core::DomainScalar;

/// Pivot magnitudes below this are treated as degenerate.
pub const PIVOT_MIN: f64 = 1e-20;

/// Reciprocal substituted for a degenerate pivot.
pub const PIVOT_MAX: f64 = 1e20;

/// Reciprocal of `pivot`, clamped for near-zero pivots.
fn clamped_recip<T: DomainScalar>(pivot: T) -> T {
    let magnitude = pivot.modulus();
    if magnitude < PIVOT_MIN {
        log::debug!("clamping degenerate pivot (|p| = {magnitude:.3e})");
        T::from_real(PIVOT_MAX)
    } else {
        T::one() / pivot
    }
}

/// Replace `m` by `-m⁻¹` in place.
pub fn neg_invert_in_place<T: DomainScalar>(m: &mut DMatrix<T>) {
    debug_assert_eq!(m.nrows(), m.ncols());
    match m.nrows() {
        0 => {}
        1 => {
            m[(0, 0)] = -clamped_recip(m[(0, 0)]);
        }
        2 => {
            let (a, b) = (m[(0, 0)], m[(0, 1)]);
            let (c, d) = (m[(1, 0)], m[(1, 1)]);
            let r = clamped_recip(a * d - b * c);
            m[(0, 0)] = -d * r;
            m[(0, 1)] = b * r;
            m[(1, 0)] = c * r;
            m[(1, 1)] = -a * r;
        }
        n => {
            // Jordan sweep over every index; sweeping all of 0..n leaves
            // -m⁻¹ in place.
            for k in 0..n {
                let p = clamped_recip(m[(k, k)]);
                for i in 0..n {
                    if i == k {
                        continue;
                    }
                    let mik = m[(i, k)];
                    for j in 0..n {
                        if j == k {
                            continue;
                        }
                        let t = mik * m[(k, j)] * p;
                        m[(i, j)] -= t;
                    }
                }
                for i in 0..n {
                    if i != k {
                        m[(i, k)] *= p;
                    }
                }
                for j in 0..n {
                    if j != k {
                        m[(k, j)] *= p;
                    }
                }
                m[(k, k)] = -p;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex;

    fn assert_close(actual: &DMatrix<f64>, expected: &DMatrix<f64>) {
        for i in 0..expected.nrows() {
            for j in 0..expected.ncols() {
                assert!(
                    (actual[(i, j)] - expected[(i, j)]).abs() < 1e-12,
                    "entry ({i}, {j}): {} vs {}",
                    actual[(i, j)],
                    expected[(i, j)]
                );
            }
        }
    }

    #[test]
    fn test_invert_1x1() {
        let mut m = DMatrix::from_row_slice(1, 1, &[4.0]);
        neg_invert_in_place(&mut m);
        assert_eq!(m[(0, 0)], -0.25);
    }

    #[test]
    fn test_invert_2x2() {
        let mut m = DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.0, 3.0]);
        let expected = -m.clone().try_inverse().unwrap();
        neg_invert_in_place(&mut m);
        assert_close(&m, &expected);
    }

    #[test]
    fn test_invert_general() {
        let mut m = DMatrix::from_row_slice(
            4,
            4,
            &[
                4.0, 1.0, 0.0, 2.0, //
                1.0, 5.0, 1.0, 0.0, //
                0.0, 1.0, 6.0, 1.0, //
                2.0, 0.0, 1.0, 7.0,
            ],
        );
        let expected = -m.clone().try_inverse().unwrap();
        neg_invert_in_place(&mut m);
        assert_close(&m, &expected);
    }

    #[test]
    fn test_invert_complex() {
        let a = Complex::new(2.0, 1.0);
        let b = Complex::new(0.0, -1.0);
        let c = Complex::new(1.0, 0.0);
        let d = Complex::new(3.0, 2.0);
        let mut m = DMatrix::from_row_slice(2, 2, &[a, b, c, d]);
        let expected = -m.clone().try_inverse().unwrap();
        neg_invert_in_place(&mut m);
        for i in 0..2 {
            for j in 0..2 {
                assert!((m[(i, j)] - expected[(i, j)]).norm() < 1e-12);
            }
        }
    }

    #[test]
    fn test_degenerate_pivot_is_clamped() {
        // A singular 1x1 block does not fail; it becomes a huge negative
        // reciprocal.
        let mut m = DMatrix::from_row_slice(1, 1, &[0.0]);
        neg_invert_in_place(&mut m);
        assert_eq!(m[(0, 0)], -PIVOT_MAX);
    }

    #[test]
    fn test_empty_block() {
        let mut m = DMatrix::<f64>::zeros(0, 0);
        neg_invert_in_place(&mut m);
        assert_eq!(m.nrows(), 0);
    }
}
