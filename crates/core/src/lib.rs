pub mod classifier;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod unit;

pub use classifier::UnitClassifier;
pub use config::Config;
pub use context::{derive_seed, ExecutionContext};
pub use error::*;
pub use executor::{Executor, UnitOutcome, Variables};
pub use unit::*;
