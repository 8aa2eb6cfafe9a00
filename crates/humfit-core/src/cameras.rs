use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use humfit_renderer::camera::Camera;

use crate::config::DatasetLayout;
use crate::error::{FitError, Result};

/// Looks up the calibration of one camera of a capture rig.
pub trait CameraSource {
    /// Fails with [`FitError::MissingCamera`] when the rig has no such camera.
    fn camera(&self, subject: u32, index: usize) -> Result<Camera>;
}

/// One calibrated camera as stored in `cameras.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraRecord {
    pub rotation: [[f64; 3]; 3],
    pub translation: [f64; 3],
    pub focal_length: [f64; 2],
    pub principal_point: [f64; 2],
}

impl From<&Camera> for CameraRecord {
    fn from(camera: &Camera) -> Self {
        Self {
            rotation: camera.rotation,
            translation: camera.translation,
            focal_length: camera.focal_length,
            principal_point: camera.principal_point,
        }
    }
}

impl CameraRecord {
    fn to_camera(&self, index: usize) -> Result<Camera> {
        let invalid = |reason: String| FitError::InvalidCamera { index, reason };

        let [fx, fy] = self.focal_length;
        if !(fx.is_finite() && fy.is_finite() && fx != 0.0 && fy != 0.0) {
            return Err(invalid(format!("focal length {:?}", self.focal_length)));
        }
        let finite = self.rotation.iter().flatten().chain(&self.translation).chain(&self.principal_point).all(|x| x.is_finite());
        if !finite {
            return Err(invalid("non-finite extrinsics".to_string()));
        }
        let det = determinant(&self.rotation);
        if (det - 1.0).abs() > 1e-3 {
            return Err(invalid(format!("rotation has determinant {det:.6}")));
        }

        Ok(Camera::new(self.rotation, self.translation, self.focal_length, self.principal_point))
    }
}

fn determinant(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1]) - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// The calibrated cameras of one subject, keyed by camera index.
#[derive(Debug, Clone, Default)]
pub struct CameraRig {
    subject: u32,
    records: BTreeMap<usize, CameraRecord>,
}

impl CameraRig {
    pub fn new(subject: u32, records: BTreeMap<usize, CameraRecord>) -> Self {
        Self { subject, records }
    }

    /// Reads a JSON object mapping camera indices to [`CameraRecord`]s.
    pub fn open<P: AsRef<Path>>(path: P, subject: u32) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let raw: BTreeMap<String, CameraRecord> = serde_json::from_str(&text)?;
        let records = raw
            .into_iter()
            .map(|(key, record)| {
                let index = key.trim().parse::<usize>().map_err(|_| FitError::InvalidCamera {
                    index: usize::MAX,
                    reason: format!("camera key {key:?} is not an index"),
                })?;
                Ok((index, record))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        debug!("loaded {} cameras of subject {} from {}", records.len(), subject, path.as_ref().display());
        Ok(Self { subject, records })
    }

    /// Reads `cameras.json` of the subject in `layout`.
    pub fn from_layout(layout: &DatasetLayout) -> Result<Self> {
        Self::open(layout.cameras_path(), layout.subject)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let raw: BTreeMap<String, &CameraRecord> = self.records.iter().map(|(k, v)| (k.to_string(), v)).collect();
        fs::write(path, serde_json::to_string_pretty(&raw)?)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl CameraSource for CameraRig {
    fn camera(&self, subject: u32, index: usize) -> Result<Camera> {
        if subject != self.subject {
            return Err(FitError::MissingCamera { subject, index });
        }
        self.records
            .get(&index)
            .ok_or(FitError::MissingCamera { subject, index })?
            .to_camera(index)
    }
}
