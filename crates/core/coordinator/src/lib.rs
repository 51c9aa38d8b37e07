#[macro_use]
extern crate log;

mod coordinator;
mod error;

pub use coordinator::{Outcome, TaskCoordinator};
pub use error::Error;
