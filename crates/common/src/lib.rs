//! Common types shared by the TaskIQ auth crates

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
