pub mod cameras;
pub mod config;
pub mod error;
pub mod fit;
pub mod keypoints;
pub mod mesh;
pub mod obj;
pub mod optim;
pub mod params;
pub mod photos;
mod progress;
pub mod transfer;
