use burn::prelude::{Backend, Tensor};
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};

/// Bilinear resize of a ``(B, C, H, W)`` tensor to a target resolution.
///
/// A no-op when the tensor already has the target resolution.
#[must_use]
pub fn resize_bilinear<B: Backend>(
    x: Tensor<B, 4>,
    output_size: [usize; 2],
) -> Tensor<B, 4> {
    let [_, _, h, w] = x.dims();
    if [h, w] == output_size {
        return x;
    }

    interpolate(
        x,
        output_size,
        InterpolateOptions::new(InterpolateMode::Bilinear),
    )
}

/// Evenly spaced values from `start` to `end`, inclusive.
///
/// With a single step, yields `[start]`.
#[must_use]
pub fn float_vec_linspace(
    start: f64,
    end: f64,
    steps: usize,
) -> Vec<f64> {
    match steps {
        0 => vec![],
        1 => vec![start],
        _ => {
            let delta = (end - start) / (steps - 1) as f64;
            (0..steps).map(|i| start + delta * i as f64).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::assert_close_to_vec;
    use burn::backend::NdArray;

    #[test]
    fn test_resize_bilinear_identity() {
        let device = Default::default();
        let x = Tensor::<NdArray, 4>::random(
            [1, 2, 4, 4],
            burn::tensor::Distribution::Uniform(0.0, 1.0),
            &device,
        );

        resize_bilinear(x.clone(), [4, 4])
            .to_data()
            .assert_eq(&x.to_data(), true);
    }

    #[test]
    fn test_resize_bilinear_upsample() {
        let device = Default::default();
        let x = Tensor::<NdArray, 4>::ones([2, 3, 4, 6], &device);

        let y = resize_bilinear(x, [8, 12]);
        assert_eq!(y.dims(), [2, 3, 8, 12]);
    }

    #[test]
    fn test_float_vec_linspace() {
        assert!(float_vec_linspace(0.0, 1.0, 0).is_empty());
        assert_close_to_vec(&float_vec_linspace(0.0, 1.0, 1), &[0.0], 1e-9);
        assert_close_to_vec(
            &float_vec_linspace(0.0, 0.1, 5),
            &[0.0, 0.025, 0.05, 0.075, 0.1],
            1e-9,
        );
    }
}
