use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use common::config::ExchangeConfig;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Binance answered {status}: {body}")]
    Api { status: u16, body: String },
    #[error("Unexpected response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderResponse {
    #[serde(rename = "orderId")]
    pub order_id: u64,
    pub symbol: String,
    pub status: String,
    #[serde(rename = "executedQty")]
    pub executed_qty: String,
    #[serde(rename = "cummulativeQuoteQty")]
    pub cummulative_quote_qty: String,
}

impl OrderResponse {
    pub fn is_filled(&self) -> bool {
        self.status == "FILLED"
    }

    /// Average fill price, if anything was executed.
    pub fn average_price(&self) -> Option<f64> {
        let qty = self.executed_qty.parse::<f64>().ok()?;
        let quote = self.cummulative_quote_qty.parse::<f64>().ok()?;
        (qty > 0.0).then(|| quote / qty)
    }
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: Url,
    api_key: String,
    secret_key: String,
}

impl BinanceClient {
    pub fn new(config: &ExchangeConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_url(&self, path: &str, params: &str) -> String {
        let timestamp = Utc::now().timestamp_millis();
        let params = if params.is_empty() {
            format!("timestamp={}", timestamp)
        } else {
            format!("{}&timestamp={}", params, timestamp)
        };
        let signature = self.sign(&params);
        format!(
            "{}{}?{}&signature={}",
            self.base_url.as_str().trim_end_matches('/'),
            path,
            params,
            signature
        )
    }

    async fn send_signed(
        &self,
        method: Method,
        path: &str,
        params: &str,
    ) -> Result<reqwest::Response, ExchangeError> {
        let url = self.signed_url(path, params);

        let resp = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await?;
            error!("Binance request {} failed: {}", path, body);
            return Err(ExchangeError::Api { status, body });
        }
        Ok(resp)
    }

    pub async fn get_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let url = format!(
            "{}/api/v3/ticker/price?symbol={}",
            self.base_url.as_str().trim_end_matches('/'),
            symbol.to_uppercase()
        );
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await?;
            return Err(ExchangeError::Api { status, body });
        }

        let ticker = resp.json::<TickerPrice>().await?;
        ticker
            .price
            .parse::<f64>()
            .map_err(|e| ExchangeError::Decode(format!("price {:?}: {}", ticker.price, e)))
    }

    /// Market buy spending `quote_qty` of the quote asset.
    pub async fn market_buy_quote(
        &self,
        symbol: &str,
        quote_qty: f64,
    ) -> Result<OrderResponse, ExchangeError> {
        let params = format!(
            "symbol={}&side={}&type=MARKET&quoteOrderQty={}",
            symbol.to_uppercase(),
            Side::Buy.as_str(),
            quote_qty
        );
        info!("Placing Order: BUY {} {} worth of quote", symbol, quote_qty);

        let resp = self.send_signed(Method::POST, "/api/v3/order", &params).await?;
        Ok(resp.json::<OrderResponse>().await?)
    }

    pub async fn market_sell(
        &self,
        symbol: &str,
        quantity: &str,
    ) -> Result<OrderResponse, ExchangeError> {
        let params = format!(
            "symbol={}&side={}&type=MARKET&quantity={}",
            symbol.to_uppercase(),
            Side::Sell.as_str(),
            quantity
        );
        info!("Placing Order: SELL {} {}", quantity, symbol);

        let resp = self.send_signed(Method::POST, "/api/v3/order", &params).await?;
        Ok(resp.json::<OrderResponse>().await?)
    }

    pub async fn get_order(
        &self,
        symbol: &str,
        order_id: u64,
    ) -> Result<OrderResponse, ExchangeError> {
        let params = format!("symbol={}&orderId={}", symbol.to_uppercase(), order_id);
        let resp = self.send_signed(Method::GET, "/api/v3/order", &params).await?;
        Ok(resp.json::<OrderResponse>().await?)
    }

    pub async fn cancel_open_orders(&self, symbol: &str) -> Result<(), ExchangeError> {
        let params = format!("symbol={}", symbol.to_uppercase());
        info!("Cancelling open orders on {}", symbol);
        self.send_signed(Method::DELETE, "/api/v3/openOrders", &params)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> BinanceClient {
        BinanceClient::new(&ExchangeConfig {
            api_key: "key".to_string(),
            secret_key: "secret".to_string(),
            base_url: "https://api.binance.com/".parse().unwrap(),
        })
    }

    #[test]
    fn test_signature_is_hex_sha256() {
        let sig = client().sign("symbol=ETHBTC&timestamp=1");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(sig, client().sign("symbol=ETHBTC&timestamp=1"));
    }

    #[test]
    fn test_signed_url_layout() {
        let url = client().signed_url("/api/v3/order", "symbol=ETHBTC");
        assert!(url.starts_with("https://api.binance.com/api/v3/order?symbol=ETHBTC&timestamp="));
        assert!(url.contains("&signature="));
    }

    #[test]
    fn test_average_price() {
        let order = OrderResponse {
            order_id: 1,
            symbol: "ETHBTC".to_string(),
            status: "FILLED".to_string(),
            executed_qty: "2.0".to_string(),
            cummulative_quote_qty: "0.1".to_string(),
        };
        assert!(order.is_filled());
        assert!((order.average_price().unwrap() - 0.05).abs() < 1e-12);

        let empty = OrderResponse {
            executed_qty: "0.0".to_string(),
            ..order
        };
        assert_eq!(empty.average_price(), None);
    }
}
