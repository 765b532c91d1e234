pub mod error;
pub mod health;
pub mod memory;

pub use error::ApiError;
