pub mod backend;
pub mod fixtures;

pub use backend::*;
pub use fixtures::*;
