//! Cross-thread message types.

pub mod messages;

pub use messages::NewKeyFrame;
