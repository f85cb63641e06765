pub mod audit;
pub mod backend;
pub mod cache;
pub mod docker;
pub mod manifest;
pub mod pipeline;
pub mod preflight;
pub mod recipe;
pub mod redact;
pub mod rewrite;
pub mod service;
pub mod source;

pub use audit::*;
pub use backend::*;
pub use cache::*;
pub use docker::*;
pub use manifest::*;
pub use pipeline::*;
pub use preflight::*;
pub use recipe::*;
pub use redact::*;
pub use rewrite::*;
pub use service::*;
pub use source::*;
