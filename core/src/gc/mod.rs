//! Retention, read pins and garbage collection

pub mod collector;
pub mod pins;
pub mod policy;

pub use collector::GcReport;
pub use pins::{PinKey, PinRegistry, ReadPin, StagedFiles};
pub use policy::RetentionPolicy;
