pub mod command_dispatcher;
pub mod event_reporter;
pub mod keyboard;
pub mod shutdown;
pub mod telegram_service;
