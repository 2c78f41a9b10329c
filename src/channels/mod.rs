//! Channel abstraction for the relay's source and destination.

pub mod channel;
pub mod telegram;

pub use channel::*;
pub use telegram::TelegramChannel;
