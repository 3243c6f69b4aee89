use std::{
    io::ErrorKind,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{sync::broadcast, task::JoinHandle, time};
use tracing::{debug, info, warn};

use common::{
    config::StrategyConfig,
    models::{SessionEvent, SessionSnapshot, StartRequest, StopRequest, asset_of},
    session::{Session, SessionError},
};

use crate::remote::{BinanceClient, ExchangeError};

const EVENT_CAPACITY: usize = 256;
const MAX_PRICE_FAILURES: u32 = 10;

/// Market-order session on a Binance spot pair.
///
/// Buys with the configured quote amount, then watches the price on the
/// candle interval. Reaching the target trails both the target and the stop
/// upward; the stop sells once it has been hit on enough consecutive ticks.
pub struct SpotSession {
    inner: Arc<Inner>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    client: BinanceClient,
    strategy: StrategyConfig,
    quote_asset: String,
    events: broadcast::Sender<SessionEvent>,
    state: Mutex<TradeState>,
}

#[derive(Debug, Default)]
struct TradeState {
    view: SessionSnapshot,
    quantity: Option<String>,
    persistence: u32,
    stranded: Vec<OpenTrade>,
}

impl TradeState {
    fn open_trade(&self) -> Option<OpenTrade> {
        match (&self.view.pair, &self.view.asset, &self.quantity) {
            (Some(pair), Some(asset), Some(quantity)) => Some(OpenTrade {
                pair: pair.clone(),
                asset: asset.clone(),
                quantity: quantity.clone(),
                buy_price: self.view.buy_price,
                target_price: self.view.target_price,
                stop_loss: self.view.stop_loss,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    last_pair: Option<String>,
    open: Option<OpenTrade>,
    /// Positions whose watcher gave up; left for the operator to close.
    #[serde(default)]
    stranded: Vec<OpenTrade>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenTrade {
    pair: String,
    asset: String,
    quantity: String,
    buy_price: f64,
    target_price: f64,
    stop_loss: f64,
}

#[derive(Debug, PartialEq, Eq)]
enum Tick {
    Hold,
    Sell,
}

impl SpotSession {
    pub fn new(client: BinanceClient, strategy: StrategyConfig, quote_asset: &str) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                client,
                strategy,
                quote_asset: quote_asset.to_uppercase(),
                events,
                state: Mutex::new(TradeState::default()),
            }),
            watcher: Mutex::new(None),
        }
    }

    fn spawn_watcher(&self, pair: String, interval: &str) {
        let period = parse_interval(interval);
        let handle = tokio::spawn(self.inner.clone().watch(pair, period));
        let previous = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn abort_watcher(&self) {
        let handle = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

#[async_trait]
impl Session for SpotSession {
    async fn start_trading(&self, request: StartRequest) -> Result<(), SessionError> {
        let pair = request.pair.to_uppercase();

        let resumable = {
            let st = self.inner.state();
            match (&st.quantity, st.view.pair.as_deref()) {
                (Some(_), Some(open)) if open == pair && !st.view.is_trading => true,
                (Some(_), Some(open)) => return Err(SessionError::AlreadyTrading(open.to_string())),
                _ if st.view.is_trading => {
                    return Err(SessionError::AlreadyTrading(
                        st.view.pair.clone().unwrap_or_default(),
                    ));
                }
                _ => false,
            }
        };

        if resumable {
            let asset = {
                let mut st = self.inner.state();
                st.view.is_trading = true;
                st.view.is_resuming = false;
                st.view.asset.clone().unwrap_or_default()
            };
            info!("Resuming {} trade", pair);
            self.inner.emit(SessionEvent::TradeResume {
                pair: pair.clone(),
                asset,
            });
        } else {
            self.inner.buy(&pair).await?;
        }

        self.spawn_watcher(pair, &request.interval);
        Ok(())
    }

    async fn stop_trading(&self, request: StopRequest) -> Result<(), SessionError> {
        self.abort_watcher();

        let (pair, asset) = {
            let mut st = self.inner.state();
            let Some(pair) = st.view.pair.clone() else {
                return Err(SessionError::NotTrading);
            };
            st.view.is_trading = false;
            st.view.is_buying = false;
            st.view.is_selling = false;
            st.view.is_resuming = false;
            st.persistence = 0;
            (pair, st.view.asset.clone().unwrap_or_default())
        };

        if request.cancel {
            if let Err(e) = self.inner.client.cancel_open_orders(&pair).await {
                warn!("Cancelling orders on {} failed: {}", pair, e);
            }
        }

        info!("Trade on {} stopped (user stop: {})", pair, request.user_stop);
        self.inner.emit(SessionEvent::TradeInfoStop { asset });
        self.inner.emit(SessionEvent::Ended {
            pair,
            user_stop: request.user_stop,
        });
        Ok(())
    }

    async fn sell(&self, price: Option<f64>) -> Result<(), SessionError> {
        self.inner.sell_position(price).await?;
        self.abort_watcher();
        Ok(())
    }

    async fn is_last_trade_open(&self) -> Result<bool, SessionError> {
        let persisted = self.inner.load().await?;

        let mut st = self.inner.state();
        st.view.last_pair = persisted.last_pair;
        for trade in &persisted.stranded {
            warn!(
                "Position of {} {} on {} was abandoned and is still open",
                trade.quantity, trade.asset, trade.pair
            );
        }
        st.stranded = persisted.stranded;
        match persisted.open {
            Some(trade) => {
                info!("Found open trade on {}", trade.pair);
                st.view.pair = Some(trade.pair);
                st.view.asset = Some(trade.asset);
                st.view.buy_price = trade.buy_price;
                st.view.target_price = trade.target_price;
                st.view.sell_price = trade.target_price;
                st.view.stop_loss = trade.stop_loss;
                st.view.is_resuming = true;
                st.quantity = Some(trade.quantity);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        self.inner.state().view.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, TradeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        debug!("Session event: {}", event.kind());
        let _ = self.events.send(event);
    }

    async fn buy(&self, pair: &str) -> Result<(), SessionError> {
        let asset = asset_of(pair, &self.quote_asset).to_string();
        {
            let mut st = self.state();
            st.view.pair = Some(pair.to_string());
            st.view.asset = Some(asset.clone());
            st.view.is_buying = true;
            st.view.is_trading = true;
        }
        self.emit(SessionEvent::TradeStart {
            pair: pair.to_string(),
            asset: asset.clone(),
        });

        let (quantity, price) = match self.place_buy(pair).await {
            Ok(fill) => fill,
            Err(e) => {
                let mut st = self.state();
                st.view.pair = None;
                st.view.asset = None;
                st.view.is_buying = false;
                st.view.is_trading = false;
                return Err(e);
            }
        };

        {
            let mut st = self.state();
            st.quantity = Some(quantity);
            st.persistence = 0;
            st.view.is_buying = false;
            st.view.last_price = price;
            st.view.buy_price = price;
            st.view.target_price = price * self.strategy.take_profit;
            st.view.sell_price = st.view.target_price;
            st.view.stop_loss = price * self.strategy.stop_limit;
        }
        if let Err(e) = self.persist().await {
            warn!("Could not persist open trade on {}: {}", pair, e);
        }

        self.emit(SessionEvent::FilledOrder {
            pair: pair.to_string(),
            asset,
            price,
        });
        Ok(())
    }

    async fn place_buy(&self, pair: &str) -> Result<(String, f64), SessionError> {
        let mut order = self
            .client
            .market_buy_quote(pair, self.strategy.max_balance)
            .await
            .map_err(|e| rejected(pair, e))?;

        if !order.is_filled() {
            self.emit(SessionEvent::CheckOrder(format!(
                "Order {} on {} is {}, checking again.",
                order.order_id, pair, order.status
            )));
            order = self
                .client
                .get_order(pair, order.order_id)
                .await
                .map_err(|e| rejected(pair, e))?;

            if !order.is_filled() {
                if let Err(e) = self.client.cancel_open_orders(pair).await {
                    warn!("Cancelling unfilled order on {} failed: {}", pair, e);
                }
            }
        }

        let price = order.average_price().ok_or_else(|| SessionError::Rejected {
            pair: pair.to_string(),
            reason: format!("order {} not filled ({})", order.order_id, order.status),
        })?;
        Ok((order.executed_qty, price))
    }

    async fn sell_position(&self, reference: Option<f64>) -> Result<f64, SessionError> {
        let (pair, asset, quantity) = {
            let mut st = self.state();
            if !st.view.is_trading || st.view.is_selling || st.view.is_buying {
                return Err(SessionError::NotTrading);
            }
            let (Some(pair), Some(asset), Some(quantity)) = (
                st.view.pair.clone(),
                st.view.asset.clone(),
                st.quantity.clone(),
            ) else {
                return Err(SessionError::NotTrading);
            };
            st.view.is_selling = true;
            (pair, asset, quantity)
        };

        if let Some(price) = reference {
            info!("Selling {} {} (reference price {})", quantity, pair, price);
        }

        let order = match self.client.market_sell(&pair, &quantity).await {
            Ok(order) => order,
            Err(e) => {
                self.state().view.is_selling = false;
                return Err(rejected(&pair, e));
            }
        };

        let price = {
            let mut st = self.state();
            let price = order
                .average_price()
                .or(reference)
                .unwrap_or(st.view.last_price);
            st.view.sell_price = price;
            price
        };

        self.emit(SessionEvent::Sold {
            pair: pair.clone(),
            asset: asset.clone(),
            price,
        });
        self.close_position().await;
        Ok(price)
    }

    async fn close_position(&self) {
        let (pair, asset) = {
            let mut st = self.state();
            let pair = st.view.pair.take().unwrap_or_default();
            let asset = st.view.asset.take().unwrap_or_default();
            st.view = SessionSnapshot {
                last_pair: Some(pair.clone()),
                last_price: st.view.last_price,
                sell_price: st.view.sell_price,
                ..SessionSnapshot::default()
            };
            st.quantity = None;
            st.persistence = 0;
            (pair, asset)
        };

        if let Err(e) = self.persist().await {
            warn!("Could not persist closed trade on {}: {}", pair, e);
        }
        self.emit(SessionEvent::TradeInfoStop { asset });
        self.emit(SessionEvent::Ended {
            pair,
            user_stop: false,
        });
    }

    /// Gives up on the current trade so another pair can be started. The
    /// position stays recorded in the state file.
    async fn abandon(&self) -> Option<OpenTrade> {
        let trade = {
            let mut st = self.state();
            let trade = st.open_trade();
            if let Some(trade) = &trade {
                st.stranded.push(trade.clone());
            }
            st.view = SessionSnapshot {
                last_pair: st.view.pair.clone().or(st.view.last_pair.take()),
                last_price: st.view.last_price,
                ..SessionSnapshot::default()
            };
            st.quantity = None;
            st.persistence = 0;
            trade
        };

        if let Err(e) = self.persist().await {
            warn!("Could not persist abandoned trade: {}", e);
        }
        trade
    }

    async fn watch(self: Arc<Self>, pair: String, period: Duration) {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut failures = 0u32;

        loop {
            ticker.tick().await;

            let price = match self.client.get_price(&pair).await {
                Ok(price) => {
                    failures = 0;
                    price
                }
                Err(e) => {
                    failures += 1;
                    warn!("Price check on {} failed ({}/{}): {}", pair, failures, MAX_PRICE_FAILURES, e);
                    if failures >= MAX_PRICE_FAILURES {
                        let reason = match self.abandon().await {
                            Some(trade) => format!(
                                "price feed lost: {}; {} {} left open",
                                e, trade.quantity, trade.asset
                            ),
                            None => format!("price feed lost: {}", e),
                        };
                        self.emit(SessionEvent::Failed { pair, reason });
                        return;
                    }
                    continue;
                }
            };

            if self.on_price(price) == Tick::Sell {
                match self.sell_position(None).await {
                    Ok(_) => return,
                    Err(e) => self.emit(SessionEvent::CheckOrder(format!(
                        "Sell on {} failed: {}",
                        pair, e
                    ))),
                }
            }
        }
    }

    fn on_price(&self, price: f64) -> Tick {
        let mut events = Vec::new();

        let tick = {
            let mut guard = self.state();
            let TradeState {
                view, persistence, ..
            } = &mut *guard;
            view.last_price = price;

            let mut tick = Tick::Hold;
            if price >= view.target_price {
                view.stop_loss = view.stop_loss.max(price * self.strategy.trailing_stop);
                view.target_price = price * self.strategy.partial_take_profit;
                view.sell_price = view.target_price;
                *persistence = 0;
                events.push(SessionEvent::PriceUpdate {
                    asset: view.asset.clone().unwrap_or_default(),
                    target: view.target_price,
                    buy_price: view.buy_price,
                });
            } else if price <= view.stop_loss {
                *persistence += 1;
                events.push(SessionEvent::PersistenceTrigger {
                    count: *persistence,
                });
                if *persistence >= self.strategy.sell_persistence.max(1) {
                    tick = Tick::Sell;
                }
            } else {
                *persistence = 0;
            }

            events.insert(0, SessionEvent::TradeInfo(view.clone()));
            tick
        };

        for event in events {
            self.emit(event);
        }
        tick
    }

    async fn load(&self) -> Result<PersistedState, SessionError> {
        match tokio::fs::read(&self.strategy.state_file).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| SessionError::Persistence(e.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(PersistedState::default()),
            Err(e) => Err(SessionError::Persistence(e.to_string())),
        }
    }

    async fn persist(&self) -> Result<(), SessionError> {
        let persisted = {
            let st = self.state();
            PersistedState {
                last_pair: st.view.last_pair.clone(),
                open: st.open_trade(),
                stranded: st.stranded.clone(),
            }
        };

        let bytes = serde_json::to_vec_pretty(&persisted)
            .map_err(|e| SessionError::Persistence(e.to_string()))?;
        tokio::fs::write(&self.strategy.state_file, bytes)
            .await
            .map_err(|e| SessionError::Persistence(e.to_string()))
    }
}

fn rejected(pair: &str, e: ExchangeError) -> SessionError {
    match e {
        ExchangeError::Api { body, .. } => SessionError::Rejected {
            pair: pair.to_string(),
            reason: body,
        },
        other => SessionError::Exchange(other.to_string()),
    }
}

/// Parses candle intervals like "30s", "1m", "4h". Unknown values fall back to a minute.
pub fn parse_interval(interval: &str) -> Duration {
    const DEFAULT: Duration = Duration::from_secs(60);

    let Some(unit) = interval.chars().last() else {
        return DEFAULT;
    };
    let Ok(value) = interval[..interval.len() - unit.len_utf8()].parse::<u64>() else {
        return DEFAULT;
    };
    let value = value.max(1);
    match unit {
        's' => Duration::from_secs(value),
        'm' => Duration::from_secs(value * 60),
        'h' => Duration::from_secs(value * 3600),
        'd' => Duration::from_secs(value * 86_400),
        _ => DEFAULT,
    }
}
