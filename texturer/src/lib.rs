// The library half of `texturer`; `main.rs` wraps it into an executable.

pub mod camera;
pub mod export_obj;
pub mod import_obj;
pub mod mesh;
pub mod scene;
pub mod texture;
pub mod texture_mesh;

pub use base;
