//! Run several line-JSON tool adapters as child processes and share one
//! outward connection among them, or rotate through them one at a time.

pub mod config;
pub mod error;
pub mod framer;
pub mod logger;
pub mod message;
pub mod outward;
pub mod registry;
pub mod rotation;
pub mod router;
pub mod supervisor;
pub mod worker;

pub use error::MuxError;
pub use message::{Message, SERVER_TAG};
