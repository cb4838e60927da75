pub mod estimator;
pub mod metrics;

pub use estimator::*;
pub use metrics::*;
