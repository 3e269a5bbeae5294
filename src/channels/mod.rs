//! Chat transports that feed turns into the dispatcher.

pub mod telegram;

pub use telegram::TelegramChannel;
