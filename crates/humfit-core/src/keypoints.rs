use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::debug;
use tch::{Device, Kind, Tensor};

use humfit_smplx::body_models::BodyModel;
use humfit_utils::module::ModuleMT;

use crate::error::{FitError, Result};
use crate::params::BodyParams;

/// Rows of the detector's keypoint file used for fitting.
pub const OPENPOSE_KEYPOINTS: [i64; 24] = [0, 1, 2, 3, 4, 5, 6, 7, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24];

/// Body-model joints matching [`OPENPOSE_KEYPOINTS`] entry for entry.
/// 55 and up are the vertex-selected face and feet keypoints.
pub const SMPLX_KEYPOINTS: [i64; 24] = [55, 12, 17, 19, 21, 16, 18, 20, 2, 5, 8, 1, 4, 7, 56, 57, 58, 59, 60, 61, 62, 63, 64, 65];

/// Minimum number of rows in a keypoint file.
pub const NUM_DETECTOR_KEYPOINTS: usize = 25;

/// Ground-truth keypoints of one subject/pose.
#[derive(Debug)]
pub struct KeypointTarget {
    /// 24xC, C = min(columns, 3).
    pub positions: Tensor,
}

impl KeypointTarget {
    /// Reads a whitespace-separated keypoint file. Lines starting with `#` and
    /// blank lines are skipped.
    pub fn load<P: AsRef<Path>>(path: P, device: Device) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| match err.kind() {
            ErrorKind::NotFound => FitError::KeypointsNotFound { path: path.to_path_buf() },
            _ => err.into(),
        })?;
        let target = Self::parse(&text, path, device)?;
        debug!("loaded keypoints {:?} from {}", target.positions.size(), path.display());
        Ok(target)
    }

    fn parse(text: &str, path: &Path, device: Device) -> Result<Self> {
        let malformed = |reason: String| FitError::MalformedKeypoints { path: PathBuf::from(path), reason };

        let mut rows: Vec<Vec<f32>> = Vec::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let row = line
                .split_whitespace()
                .map(|t| t.parse::<f32>().map_err(|_| malformed(format!("line {}: {t:?} is not a number", number + 1))))
                .collect::<Result<Vec<_>>>()?;
            if let Some(first) = rows.first() {
                if first.len() != row.len() {
                    return Err(malformed(format!("line {} has {} columns, expected {}", number + 1, row.len(), first.len())));
                }
            }
            rows.push(row);
        }

        if rows.len() < NUM_DETECTOR_KEYPOINTS {
            return Err(malformed(format!("{} rows, need at least {}", rows.len(), NUM_DETECTOR_KEYPOINTS)));
        }
        let columns = rows[0].len();
        if columns < 2 {
            return Err(malformed(format!("{columns} columns, need at least 2")));
        }
        let used = columns.min(3);

        let flat: Vec<f32> = OPENPOSE_KEYPOINTS
            .iter()
            .flat_map(|&i| rows[i as usize][..used].to_vec())
            .collect();
        let positions = Tensor::from_slice(&flat).view([OPENPOSE_KEYPOINTS.len() as i64, used as i64]).to_device(device);
        Ok(Self { positions })
    }

    pub fn num_coords(&self) -> i64 {
        self.positions.size()[1]
    }

    /// Mean absolute error between the scaled selected joints and the target.
    ///
    /// `joints` is 1xJx3 with J covering every index of [`SMPLX_KEYPOINTS`].
    pub fn loss(&self, joints: &Tensor, scale: &Tensor) -> Result<Tensor> {
        let index = Tensor::from_slice(&SMPLX_KEYPOINTS).to_device(joints.device());
        let predicted = joints.get(0).f_index_select(0, &index)? * scale;
        let predicted = predicted.narrow(1, 0, self.num_coords());
        Ok((predicted - &self.positions).abs().mean(Kind::Float))
    }
}

/// Runs the body model on `params` and scores its keypoints against `target`.
/// Translation is not applied to the prediction.
pub fn keypoints_loss(model: &dyn BodyModel, params: &BodyParams, target: &KeypointTarget) -> Result<Tensor> {
    let output = model.forward_mt(params.body_pose_matrices(), false);
    target.loss(&output.joints, &params.scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(count: usize, columns: usize) -> String {
        (0..count)
            .map(|r| (0..columns).map(|c| format!("{}", r * 10 + c)).collect::<Vec<_>>().join(" "))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn parse(text: &str) -> Result<KeypointTarget> {
        KeypointTarget::parse(text, Path::new("keypoints.txt"), Device::Cpu)
    }

    #[test]
    fn test_selects_detector_rows_in_order() {
        let target = parse(&rows(25, 3)).unwrap();

        assert_eq!(target.positions.size(), &[24, 3]);
        // row 8 (mid hip) is skipped
        assert_eq!(target.positions.double_value(&[7, 0]), 70.0);
        assert_eq!(target.positions.double_value(&[8, 0]), 90.0);
        assert_eq!(target.positions.double_value(&[23, 2]), 242.0);
    }

    #[test]
    fn test_comments_and_blank_lines_are_ignored() {
        let text = format!("# x y z\n\n{}\n\n", rows(25, 3));
        assert_eq!(parse(&text).unwrap().positions.size(), &[24, 3]);
    }

    #[test]
    fn test_confidence_column_is_dropped() {
        let target = parse(&rows(25, 4)).unwrap();
        assert_eq!(target.num_coords(), 3);
    }

    #[test]
    fn test_two_columns_are_kept() {
        let target = parse(&rows(25, 2)).unwrap();
        assert_eq!(target.num_coords(), 2);
    }

    #[test]
    fn test_failure_modes() {
        assert!(matches!(parse(&rows(24, 3)), Err(FitError::MalformedKeypoints { .. })));
        assert!(matches!(parse(&rows(25, 1)), Err(FitError::MalformedKeypoints { .. })));
        assert!(matches!(parse(&format!("{}\n1 2", rows(25, 3))), Err(FitError::MalformedKeypoints { .. })));
        assert!(matches!(parse(&format!("a b c\n{}", rows(25, 3))), Err(FitError::MalformedKeypoints { .. })));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = KeypointTarget::load(dir.path().join("keypoints.txt"), Device::Cpu).unwrap_err();
        assert!(matches!(err, FitError::KeypointsNotFound { .. }));
    }

    #[test]
    fn test_loss_uses_scaled_joints() {
        let target = KeypointTarget { positions: Tensor::ones([24, 3], tch::kind::FLOAT_CPU) * 2.0 };
        let joints = Tensor::ones([1, 76, 3], tch::kind::FLOAT_CPU);

        let at_unit = target.loss(&joints, &Tensor::from_slice(&[1.0f32])).unwrap();
        let at_double = target.loss(&joints, &Tensor::from_slice(&[2.0f32])).unwrap();

        assert!((at_unit.double_value(&[]) - 1.0).abs() < 1e-6);
        assert!(at_double.double_value(&[]).abs() < 1e-6);
    }

    #[test]
    fn test_loss_rejects_too_few_joints() {
        let target = KeypointTarget { positions: Tensor::zeros([24, 3], tch::kind::FLOAT_CPU) };
        let joints = Tensor::zeros([1, 55, 3], tch::kind::FLOAT_CPU);
        assert!(target.loss(&joints, &Tensor::from_slice(&[1.0f32])).is_err());
    }
}
