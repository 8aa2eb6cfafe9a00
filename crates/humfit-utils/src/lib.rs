pub mod module;
pub mod tensor;
pub mod mesh_ops;
pub mod var_store;
