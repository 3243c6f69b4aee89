use serde::{Deserialize, Serialize};

/// Point-in-time view of the trading session capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub asset: Option<String>,
    pub pair: Option<String>,
    pub last_pair: Option<String>,
    pub last_price: f64,
    pub buy_price: f64,
    pub sell_price: f64,
    pub stop_loss: f64,
    pub target_price: f64,
    pub is_buying: bool,
    pub is_selling: bool,
    pub is_trading: bool,
    pub is_resuming: bool,
}

impl SessionSnapshot {
    /// Percent move of the last price against the buy price.
    pub fn change_pct(&self) -> f64 {
        if self.buy_price == 0.0 {
            return 0.0;
        }
        (self.last_price / self.buy_price - 1.0) * 100.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    pub pair: String,
    /// Candle interval the strategy ticks on, e.g. "1m".
    pub interval: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopRequest {
    /// Cancel the order currently on the book.
    pub cancel: bool,
    pub user_stop: bool,
}

/// Lifecycle events published by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    TradeStart { pair: String, asset: String },
    TradeResume { pair: String, asset: String },
    TradeInfo(SessionSnapshot),
    PriceUpdate { asset: String, target: f64, buy_price: f64 },
    FilledOrder { pair: String, asset: String, price: f64 },
    Sold { pair: String, asset: String, price: f64 },
    CheckOrder(String),
    PersistenceTrigger { count: u32 },
    TradeInfoStop { asset: String },
    Ended { pair: String, user_stop: bool },
    Failed { pair: String, reason: String },
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TradeStart { .. } => "tradeStart",
            Self::TradeResume { .. } => "tradeResume",
            Self::TradeInfo(_) => "tradeInfo",
            Self::PriceUpdate { .. } => "priceUpdate",
            Self::FilledOrder { .. } => "filledOrder",
            Self::Sold { .. } => "traderSold",
            Self::CheckOrder(_) => "traderCheckOrder",
            Self::PersistenceTrigger { .. } => "traderPersistenceTrigger",
            Self::TradeInfoStop { .. } => "tradeInfoStop",
            Self::Ended { .. } => "traderEnded",
            Self::Failed { .. } => "traderFailed",
        }
    }
}
