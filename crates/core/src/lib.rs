//! Core crate for the tilesr tiled super-resolution pipeline.

pub mod blend;
pub mod config;
pub mod error;
pub mod image;
pub mod logging;
pub mod pipeline;
pub mod postprocess;
pub mod protocol;
pub mod resize;
pub mod session;
pub mod tensor;
pub mod tile;
