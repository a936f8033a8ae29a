use std::fmt::Debug;

/// Asserts that two float slices match element-wise within a tolerance.
pub fn assert_close_to_vec<T>(
    actual: &[T],
    expected: &[T],
    tolerance: T,
) where
    T: num_traits::float::Float + Copy + Debug,
{
    let close = actual.len() == expected.len()
        && actual
            .iter()
            .zip(expected.iter())
            .all(|(&a, &e)| (a - e).abs() <= tolerance);

    if !close {
        panic!(
            "Expected (+/- {:?}):\n{:?}\nActual:\n{:?}",
            tolerance, expected, actual
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assert_close_to_vec() {
        assert_close_to_vec(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0], 0.01);
        assert_close_to_vec(&[1.0, 2.0, 3.1], &[1.0, 2.0, 3.0], 0.2);
    }

    #[test]
    #[should_panic]
    fn test_assert_close_to_vec_bad_values() {
        assert_close_to_vec(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.5], 0.01);
    }

    #[test]
    #[should_panic]
    fn test_assert_close_to_vec_different_lengths() {
        assert_close_to_vec(&[1.0, 2.0], &[1.0, 2.0, 3.0], 0.01);
    }
}
