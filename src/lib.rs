// Public API for integration tests and potential library usage

pub mod download;
pub mod error;
pub mod protocol;
pub mod state;
pub mod timer;
pub mod types;
pub mod ws;
