pub mod spot_session;

pub use spot_session::SpotSession;
