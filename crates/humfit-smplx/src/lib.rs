pub mod body_models;
pub mod constants;
pub mod lbs;
pub mod model;
pub mod vertex_joints;
