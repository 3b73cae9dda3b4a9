//! Notification delivery to chat.

mod telegram;

pub use telegram::{TelegramConfig, TelegramNotifier, render_message};
