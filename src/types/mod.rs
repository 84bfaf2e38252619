mod models;
mod payload;
pub mod permission;

pub use models::*;
pub use payload::*;
