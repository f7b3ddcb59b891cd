pub mod config;
pub mod dashboard;
pub mod error;
pub mod geo;
pub mod incident;
pub mod node;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use error::{DispatchError, Result};
