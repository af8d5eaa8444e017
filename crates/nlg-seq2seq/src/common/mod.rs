pub mod cancellation;
pub mod config;
pub mod masking;
pub mod sampling;

pub use cancellation::{CancellationHandle, CancellationToken};
pub use config::GenerationConfig;
pub use masking::*;
pub use sampling::*;
