/// Derives the side of the square token grid for a sequence length.
///
/// Token sequences of shape ``(B, N, C)`` carry an implicit ``H x W``
/// spatial factorization with ``H == W``; this recovers that side.
///
/// ## Parameters
///
/// - `seq_len`: The sequence length ``N``.
///
/// ## Returns
///
/// The side ``H == W`` such that ``H * W == N``.
///
/// ## Panics
///
/// If `seq_len` is not a perfect square.
#[must_use]
pub fn checked_square_side(seq_len: usize) -> usize {
    let side = (seq_len as f64).sqrt().round() as usize;
    assert_eq!(
        side * side,
        seq_len,
        "Sequence length {} is not a perfect square; expected N = H * W with H == W",
        seq_len
    );
    side
}

/// Output size along one dimension of a strided convolution.
#[inline(always)]
#[must_use]
pub fn conv_output_size(
    size: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
) -> usize {
    (size + 2 * padding - kernel) / stride + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_square_side() {
        assert_eq!(checked_square_side(1), 1);
        assert_eq!(checked_square_side(49), 7);
        assert_eq!(checked_square_side(3136), 56);
    }

    #[test]
    #[should_panic(expected = "Sequence length 50 is not a perfect square")]
    fn test_checked_square_side_rejects_non_square() {
        let _ = checked_square_side(50);
    }

    #[test]
    fn test_conv_output_size() {
        // Overlapping patch embedding: kernel 7, stride 4, padding 3.
        assert_eq!(conv_output_size(224, 7, 4, 3), 56);
        // Downsampling embedding: kernel 3, stride 2, padding 1.
        assert_eq!(conv_output_size(56, 3, 2, 1), 28);
        // Sequence reduction: kernel r, stride r, no padding.
        assert_eq!(conv_output_size(56, 4, 4, 0), 14);
    }
}
