use tch::{Kind, TchError, Tensor};

#[cfg(debug_assertions)]
pub fn validate_tensor(tensor: &Tensor, expected_dims: &[i64], name: &str) {
    let actual_dims = tensor.size();
    assert_eq!(
        actual_dims.len(),
        expected_dims.len(),
        "{} has {} dimensions, expected {}",
        name,
        actual_dims.len(),
        expected_dims.len()
    );

    for (i, (&actual, &expected)) in actual_dims.iter().zip(expected_dims.iter()).enumerate() {
        assert_eq!(
            actual,
            expected,
            "{} dimension {} is {}, expected {}",
            name,
            i,
            actual,
            expected
        );
    }
}

#[cfg(not(debug_assertions))]
pub fn validate_tensor(_tensor: &Tensor, _expected_dims: &[i64], _name: &str) {}

/// Euclidean norm along the last dimension, keeping that dimension.
pub fn last_dim_norm(xs: &Tensor) -> Tensor {
    // `norm` keeps a zero subgradient at the origin, a plain sqrt of squares does not
    xs.norm_scalaropt_dim(2, &[-1i64][..], true)
}

/// Normalizes vectors along the last dimension, clamping tiny norms to `eps`.
pub fn normalize_last_dim(xs: &Tensor, eps: f64) -> Tensor {
    xs / last_dim_norm(xs).clamp_min(eps)
}

/// Copies a tensor of any shape into a flat host vector.
pub fn to_vec_f32(xs: &Tensor) -> Result<Vec<f32>, TchError> {
    let flat = xs.detach().to_device(tch::Device::Cpu).to_kind(Kind::Float).contiguous().view(-1);
    Vec::<f32>::try_from(&flat)
}

/// Copies an integer tensor of any shape into a flat host vector.
pub fn to_vec_i64(xs: &Tensor) -> Result<Vec<i64>, TchError> {
    let flat = xs.detach().to_device(tch::Device::Cpu).to_kind(Kind::Int64).contiguous().view(-1);
    Vec::<i64>::try_from(&flat)
}
