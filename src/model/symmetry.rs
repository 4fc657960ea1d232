// SPDX-License-Identifier: GPL-3.0-only

//! Temporal mirror-extension detection

use crate::tensor::Tensor5;
use ndarray::Axis;

/// Whether `sequence` (`N×T×C×H×W`) is its first half followed by that half reversed
///
/// Odd lengths are never mirror-extended. Equality is exact.
pub fn is_mirror_extended(sequence: &Tensor5) -> bool {
    let frames = sequence.len_of(Axis(1));
    if frames == 0 || frames % 2 != 0 {
        return false;
    }
    let half = frames / 2;
    (0..half).all(|t| {
        sequence.index_axis(Axis(1), t) == sequence.index_axis(Axis(1), frames - 1 - t)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequence(values: &[f32]) -> Tensor5 {
        Tensor5::from_shape_fn((1, values.len(), 1, 2, 2), |(_, t, _, y, x)| {
            values[t] + (y * 2 + x) as f32
        })
    }

    #[test]
    fn test_mirrored_sequence_detected() {
        assert!(is_mirror_extended(&sequence(&[1.0, 2.0, 3.0, 3.0, 2.0, 1.0])));
        assert!(is_mirror_extended(&sequence(&[4.0, 4.0])));
    }

    #[test]
    fn test_plain_sequences_rejected() {
        assert!(!is_mirror_extended(&sequence(&[1.0, 2.0, 3.0, 4.0])));
        // Odd lengths never qualify, even when palindromic
        assert!(!is_mirror_extended(&sequence(&[1.0, 2.0, 1.0])));
        assert!(!is_mirror_extended(&sequence(&[])));
    }

    #[test]
    fn test_zero_tolerance() {
        let mut seq = sequence(&[1.0, 2.0, 2.0, 1.0]);
        seq[[0, 3, 0, 1, 1]] += 1e-6;
        assert!(!is_mirror_extended(&seq));
    }
}
