pub mod config;
pub mod digest;
pub mod error;

pub use config::*;
pub use digest::*;
pub use error::*;
