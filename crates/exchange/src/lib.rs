pub mod remote;
pub mod services;

pub use remote::BinanceClient;
pub use services::SpotSession;
