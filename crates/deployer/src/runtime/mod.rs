//! Runtime — logging init, boot sequence, HTTP serving, shutdown.

pub mod boot;
pub mod serve;

pub use boot::{boot, init_logging_basic, init_logging_from_config};
pub use serve::serve;
