pub mod actors;
pub mod config;
pub mod logger;
pub mod models;
pub mod notifier;
pub mod session;
