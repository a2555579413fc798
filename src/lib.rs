//! icebreak: reactive query cache for the icebreak live-event quiz client.

pub mod cache;
pub mod config;
pub mod infra;
pub mod simulate;

#[doc(hidden)]
pub mod __private {
    pub use serde_json;
}
