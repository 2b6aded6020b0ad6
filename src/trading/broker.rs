// =============================================================================
// Broker Adapter — paper-trading order routing
// =============================================================================
//
// The adapter contract the lifecycle manager executes against. The default
// implementation targets a paper-trading REST endpoint; a live-money adapter
// is explicitly out of scope. Symbol format translation (base asset to the
// broker's concatenated pair) is encapsulated here and nowhere else.
// =============================================================================

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::EngineError;
use crate::types::TradeSide;

/// Order types the broker accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "market"),
            Self::Limit => write!(f, "limit"),
        }
    }
}

/// Accepted time-in-force values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Gtc,
    Day,
}

impl std::fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gtc => write!(f, "gtc"),
            Self::Day => write!(f, "day"),
        }
    }
}

/// A new-order request in base-asset terms; the adapter translates symbols.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: TradeSide,
    pub qty: f64,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    /// Price hint for limit orders and paper fills.
    pub limit_price: Option<f64>,
}

/// Broker acknowledgement of an accepted order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub qty: f64,
    pub fill_price: f64,
    pub ts: DateTime<Utc>,
}

/// A position as the broker reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub qty: f64,
    pub avg_entry_price: f64,
}

/// Account snapshot; `equity`/`cash` may be absent from a fresh account.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountInfo {
    #[serde(default)]
    pub account_id: String,
    pub equity: Option<f64>,
    pub cash: Option<f64>,
}

impl AccountInfo {
    /// Balance the session starts from, when the adapter provides one.
    pub fn starting_balance(&self) -> Option<f64> {
        self.equity.or(self.cash)
    }
}

/// The adapter contract.
pub trait BrokerAdapter: Send + Sync {
    fn place_order(&self, request: OrderRequest) -> BoxFuture<'_, Result<OrderAck, EngineError>>;
    fn cancel(&self, order_id: &str) -> BoxFuture<'_, Result<(), EngineError>>;
    fn get_positions(&self) -> BoxFuture<'_, Result<Vec<BrokerPosition>, EngineError>>;
    fn get_account(&self) -> BoxFuture<'_, Result<AccountInfo, EngineError>>;
}

// ---------------------------------------------------------------------------
// Paper broker
// ---------------------------------------------------------------------------

/// REST client against the paper-trading brokerage.
pub struct PaperBroker {
    client: reqwest::Client,
    base_url: String,
}

impl PaperBroker {
    pub fn new(base_url: impl Into<String>, api_key: &str) -> Self {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Ok(value) = reqwest::header::HeaderValue::from_str(api_key) {
            headers.insert("APCA-API-KEY-ID", value);
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// Base asset to the broker's pair format, e.g. "BTC" -> "BTCUSD".
    fn translate_symbol(symbol: &str) -> String {
        if symbol.ends_with("USD") {
            symbol.to_string()
        } else {
            format!("{symbol}USD")
        }
    }

    fn transient(e: impl std::fmt::Display) -> EngineError {
        EngineError::Transient(e.to_string())
    }
}

impl BrokerAdapter for PaperBroker {
    fn place_order(&self, request: OrderRequest) -> BoxFuture<'_, Result<OrderAck, EngineError>> {
        async move {
            let url = format!("{}/v2/orders", self.base_url);
            let pair = Self::translate_symbol(&request.symbol);
            let body = serde_json::json!({
                "symbol": pair,
                "qty": request.qty.to_string(),
                "side": request.side.to_string().to_lowercase(),
                "type": request.order_type.to_string(),
                "time_in_force": request.time_in_force.to_string(),
                "limit_price": request.limit_price,
            });

            debug!(symbol = %pair, side = %request.side, qty = request.qty, "placing paper order");

            let resp = self
                .client
                .post(&url)
                .json(&body)
                .send()
                .await
                .context("paper order request failed")
                .map_err(Self::transient)?;

            let status = resp.status();
            let payload: serde_json::Value = resp
                .json()
                .await
                .context("failed to parse order response")
                .map_err(Self::transient)?;

            if !status.is_success() {
                warn!(status = %status, body = %payload, "paper order rejected");
                return Err(EngineError::Transient(format!(
                    "broker returned {status}: {payload}"
                )));
            }

            let order_id = payload["id"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let fill_price = payload["filled_avg_price"]
                .as_str()
                .and_then(|s| s.parse::<f64>().ok())
                .or_else(|| payload["filled_avg_price"].as_f64())
                .or(request.limit_price)
                .unwrap_or(0.0);

            Ok(OrderAck {
                order_id,
                symbol: request.symbol,
                side: request.side,
                qty: request.qty,
                fill_price,
                ts: Utc::now(),
            })
        }
        .boxed()
    }

    fn cancel(&self, order_id: &str) -> BoxFuture<'_, Result<(), EngineError>> {
        let order_id = order_id.to_string();
        async move {
            let url = format!("{}/v2/orders/{}", self.base_url, order_id);
            let resp = self
                .client
                .delete(&url)
                .send()
                .await
                .context("cancel request failed")
                .map_err(Self::transient)?;
            if !resp.status().is_success() {
                return Err(EngineError::Transient(format!(
                    "cancel returned {}",
                    resp.status()
                )));
            }
            Ok(())
        }
        .boxed()
    }

    fn get_positions(&self) -> BoxFuture<'_, Result<Vec<BrokerPosition>, EngineError>> {
        async move {
            let url = format!("{}/v2/positions", self.base_url);
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .context("positions request failed")
                .map_err(Self::transient)?;
            resp.json().await.map_err(Self::transient)
        }
        .boxed()
    }

    fn get_account(&self) -> BoxFuture<'_, Result<AccountInfo, EngineError>> {
        async move {
            let url = format!("{}/v2/account", self.base_url);
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .context("account request failed")
                .map_err(Self::transient)?;

            let payload: serde_json::Value = resp.json().await.map_err(Self::transient)?;

            // Balances arrive as decimal strings.
            let parse = |key: &str| {
                payload[key]
                    .as_str()
                    .and_then(|s| s.parse::<f64>().ok())
                    .or_else(|| payload[key].as_f64())
            };

            Ok(AccountInfo {
                account_id: payload["id"].as_str().unwrap_or_default().to_string(),
                equity: parse("equity"),
                cash: parse("cash"),
            })
        }
        .boxed()
    }
}
