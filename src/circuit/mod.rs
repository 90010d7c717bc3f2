//! ZK circuit definitions.

mod semaphore;

pub use semaphore::{SemaphoreCircuit, PUBLIC_INPUTS};
