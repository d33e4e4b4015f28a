// Engine Module
// The driver-facing boundary the interceptor wraps

pub mod drivers;
pub mod error;
pub mod traits;
pub mod types;

pub use error::{EngineError, EngineResult};
pub use traits::QueryDriver;
pub use types::*;
