//! Shape and sanity checks for estimator inputs.
//!
//! The sweep functions trust their inputs; these checks run once, when an estimator is built.

use crate::errors::*;
use ndarray::{ArrayBase, ArrayView1, ArrayView2, Axis, Data, Dimension};

/// Fail unless `found == expected`
pub fn check_shape(name: &'static str, found: &[usize], expected: &[usize]) -> Result<()> {
    if found != expected {
        return Err(EstimatorError::ShapeMismatch {
            name,
            found: found.to_vec(),
            expected: expected.to_vec(),
        });
    }
    Ok(())
}

/// Fail if an axis length is zero
pub fn check_nonempty(name: &'static str, len: usize) -> Result<()> {
    if len == 0 {
        return Err(EstimatorError::Empty(name));
    }
    Ok(())
}

/// Fail on the first NaN or infinite bias energy
pub fn check_finite<S, D>(name: &'static str, bias: &ArrayBase<S, D>) -> Result<()>
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    match bias.iter().position(|v| !v.is_finite()) {
        Some(position) => Err(EstimatorError::NonFiniteBias {
            name,
            position,
            value: bias.iter().nth(position).copied().unwrap_or(f64::NAN),
        }),
        None => Ok(()),
    }
}

/// Fail if a frame's state index is not below `n_states`
pub fn check_state_indices(m_x: ArrayView1<'_, usize>, n_states: usize) -> Result<()> {
    match m_x.iter().enumerate().find(|&(_, &state)| state >= n_states) {
        Some((frame, &state)) => Err(EstimatorError::StateOutOfRange {
            frame,
            state,
            n_states,
        }),
        None => Ok(()),
    }
}

/// Fail unless every state's visit count summed over conditions equals the number of frames
/// assigned to it.
///
/// Assumes the state indices were already checked with [`check_state_indices`].
pub fn check_frame_counts(n_k_i: ArrayView2<'_, usize>, m_x: ArrayView1<'_, usize>) -> Result<()> {
    let mut visits = vec![0_usize; n_k_i.len_of(Axis(1))];
    for &state in m_x {
        visits[state] += 1;
    }

    for (state, (&frames, column)) in visits.iter().zip(n_k_i.gencolumns()).enumerate() {
        let counted: usize = column.iter().sum();
        if counted != frames {
            return Err(EstimatorError::FrameCountMismatch {
                state,
                frames,
                counted,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn shape_mismatch_is_reported() {
        assert!(check_shape("b_k_i", &[2, 3], &[2, 3]).is_ok());
        assert_eq!(
            check_shape("b_k_i", &[3, 2], &[2, 3]),
            Err(EstimatorError::ShapeMismatch {
                name: "b_k_i",
                found: vec![3, 2],
                expected: vec![2, 3]
            })
        );
    }

    #[test]
    fn non_finite_bias_is_reported() {
        let bias = array![[0.0, 1.0], [f64::INFINITY, 2.0]];
        match check_finite("b_k_i", &bias) {
            Err(EstimatorError::NonFiniteBias { position, value, .. }) => {
                assert_eq!(position, 2);
                assert_eq!(value, f64::INFINITY);
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(check_finite("b_k_i", &array![[0.0, -4.0]]).is_ok());
    }

    #[test]
    fn out_of_range_state_is_reported() {
        let m_x = array![0, 1, 3, 1];
        assert_eq!(
            check_state_indices(m_x.view(), 3),
            Err(EstimatorError::StateOutOfRange {
                frame: 2,
                state: 3,
                n_states: 3
            })
        );
        assert!(check_state_indices(m_x.view(), 4).is_ok());
    }

    #[test]
    fn frame_counts_must_match_trajectory() {
        let m_x = array![0, 1, 1, 2, 0, 0];
        let n_k_i = array![[1, 2, 0], [2, 0, 1]];
        assert!(check_frame_counts(n_k_i.view(), m_x.view()).is_ok());

        let n_k_i = array![[1, 2, 0], [1, 0, 1]];
        assert_eq!(
            check_frame_counts(n_k_i.view(), m_x.view()),
            Err(EstimatorError::FrameCountMismatch {
                state: 0,
                frames: 3,
                counted: 2
            })
        );
    }
}
