//! Generated-code analysis and adaptation

pub mod adapter;
pub mod capability;
pub mod template;

pub use adapter::{adapt, analyze, AdaptedCode, CodeAnalysis, CodeShape};
pub use capability::detect_streaming;
pub use template::inject;
