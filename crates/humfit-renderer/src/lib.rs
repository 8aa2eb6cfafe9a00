pub mod camera;
pub mod mesh;
pub mod rasterizer;
pub mod render;
