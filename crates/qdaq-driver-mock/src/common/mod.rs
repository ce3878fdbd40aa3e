//! Common infrastructure for mock instruments.
//!
//! Provides reusable components for building simulated drivers:
//!
//! - **mode**: Operational modes (Instant, Realistic, Chaos)
//! - **timing**: Instrument-like response delays
//! - **errors**: Fault injection framework
//! - **rng**: Seeded random number generator

pub mod errors;
pub mod mode;
pub mod rng;
pub mod timing;

// Re-export commonly used types
pub use errors::{ErrorConfig, ErrorScenario};
pub use mode::MockMode;
pub use rng::MockRng;
pub use timing::TimingConfig;
