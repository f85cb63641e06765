pub mod config;
pub mod entrypoint;
pub mod error;
pub mod layer;
pub mod secret;

pub use config::*;
pub use entrypoint::*;
pub use error::*;
pub use layer::*;
pub use secret::*;
