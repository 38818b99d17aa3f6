//! Delayed notification delivery library modules.

pub mod config;
pub mod domain;
pub mod outbound;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use config::NotifierSettings;
pub use pipeline::{DeliveryPipeline, Role};
