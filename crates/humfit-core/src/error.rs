use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while preparing or running a fit.
#[derive(Error, Debug)]
pub enum FitError {
    #[error("subject {subject} has no camera with index {index}")]
    MissingCamera { subject: u32, index: usize },
    #[error("invalid camera {index}: {reason}")]
    InvalidCamera { index: usize, reason: String },
    #[error("no usable camera among {candidates} candidates")]
    NoCameras { candidates: usize },
    #[error("keypoint file {} not found", path.display())]
    KeypointsNotFound { path: PathBuf },
    #[error("malformed keypoint file {}: {reason}", path.display())]
    MalformedKeypoints { path: PathBuf, reason: String },
    #[error("displacement has {actual} entries, mesh has {expected} vertices")]
    DisplacementMismatch { expected: i64, actual: i64 },
    #[error("UV layout has {uv_faces} faces, mesh has {mesh_faces}")]
    UvLayoutMismatch { uv_faces: i64, mesh_faces: i64 },
    #[error("invalid OBJ file {} at line {line}: {reason}", path.display())]
    InvalidObj { path: PathBuf, line: usize, reason: String },
    #[error("invalid photo {}: {reason}", path.display())]
    InvalidPhoto { path: PathBuf, reason: String },
    #[error("invalid config value for {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },
    #[error("invalid initial fit: {0}")]
    InvalidInitialFit(String),
    #[error("tch error: {source}")]
    Tch {
        #[from]
        source: tch::TchError,
    },
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("image error: {source}")]
    Image {
        #[from]
        source: image::ImageError,
    },
    #[error("serde_json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("json5 error: {source}")]
    Json5 {
        #[from]
        source: json5::Error,
    },
}

pub type Result<T, E = FitError> = std::result::Result<T, E>;
