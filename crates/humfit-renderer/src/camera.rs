use tch::{Device, Tensor};

/// A calibrated pinhole camera in photo pixel units.
///
/// World points map to the camera frame as `X_cam = R * X + T` (x right,
/// y down, z forward) and to the photo as `u = fx * x / z + px`,
/// `v = fy * y / z + py`, with pixel `(0, 0)` the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub rotation: [[f64; 3]; 3],
    pub translation: [f64; 3],
    pub focal_length: [f64; 2],
    pub principal_point: [f64; 2],
}

impl Camera {
    pub fn new(
        rotation: [[f64; 3]; 3],
        translation: [f64; 3],
        focal_length: [f64; 2],
        principal_point: [f64; 2],
    ) -> Self {
        Self { rotation, translation, focal_length, principal_point }
    }

    /// Camera at the origin looking down +z.
    pub fn identity(focal_length: [f64; 2], principal_point: [f64; 2]) -> Self {
        Self::new([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]], [0.0; 3], focal_length, principal_point)
    }

    /// Rotation matrix as a 3x3 float tensor.
    pub fn rotation_tensor(&self, device: Device) -> Tensor {
        let flat: Vec<f32> = self.rotation.iter().flatten().map(|&x| x as f32).collect();
        Tensor::from_slice(&flat).view([3, 3]).to_device(device)
    }

    pub fn translation_tensor(&self, device: Device) -> Tensor {
        let flat: Vec<f32> = self.translation.iter().map(|&x| x as f32).collect();
        Tensor::from_slice(&flat).to_device(device)
    }

    /// Transforms world points `(..., 3)` into the camera frame.
    pub fn world_to_view(&self, points: &Tensor) -> Tensor {
        let device = points.device();
        let r = self.rotation_tensor(device).to_kind(points.kind());
        let t = self.translation_tensor(device).to_kind(points.kind());
        points.matmul(&r.tr()) + t
    }

    /// Projects camera-frame points `(..., 3)` to photo pixels `(..., 2)`.
    ///
    /// Depths are clamped to `znear` so points behind the camera stay finite;
    /// callers discard them separately.
    pub fn view_to_photo(&self, view: &Tensor, znear: f64) -> Tensor {
        let z = view.select(-1, 2).clamp_min(znear);
        let u = view.select(-1, 0) / &z * self.focal_length[0] + self.principal_point[0];
        let v = view.select(-1, 1) / &z * self.focal_length[1] + self.principal_point[1];
        Tensor::stack(&[u, v], -1)
    }
}

/// Converts photo pixel coordinates to render-grid coordinates.
///
/// Render pixel `(i, j)` of an image sampled with stride `r` is centred at
/// photo `(j * r + 0.5, i * r + 0.5)`, i.e. at integer render coordinates.
pub fn photo_to_render(photo: &Tensor, rescale_factor: i64) -> Tensor {
    (photo - 0.5) / rescale_factor as f64
}
