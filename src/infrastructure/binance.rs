//! Binance USD-M Futures adapter for the `Exchange` port.
//!
//! Hedge mode only: every order carries `positionSide`, and LONG/SHORT
//! are tracked as independent positions on the venue. Orders flagged
//! `simulate` never reach the venue; they synthesize a fill at the
//! current mark price.

use std::collections::HashMap;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest_middleware::ClientWithMiddleware;
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::VenueError;
use crate::domain::order::{
    ExecutionReport, OpenOrder, Order, OrderSide, OrderStatus, OrderType, PositionSide, SymbolInfo,
};
use crate::domain::ports::Exchange;
use crate::infrastructure::http_client_factory::HttpClientFactory;

pub struct BinanceFuturesExchange {
    client: ClientWithMiddleware,
    api_key: String,
    api_secret: String,
    base_url: String,
    symbol_info: RwLock<HashMap<String, SymbolInfo>>,
}

impl BinanceFuturesExchange {
    pub fn new(api_key: String, api_secret: String, base_url: String) -> Self {
        Self {
            client: HttpClientFactory::create_client(30),
            api_key,
            api_secret,
            base_url,
            symbol_info: RwLock::new(HashMap::new()),
        }
    }

    /// Generate HMAC-SHA256 signature for signed endpoints
    fn sign_request(&self, query_string: &str) -> String {
        type HmacSha256 = Hmac<Sha256>;

        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_url(&self, path: &str, params: &[(&str, String)]) -> String {
        let query_string: String = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign_request(&query_string);
        format!(
            "{}{}?{}&signature={}",
            self.base_url, path, query_string, signature
        )
    }

    async fn read_response(
        &self,
        response: reqwest::Response,
    ) -> Result<serde_json::Value, VenueError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| VenueError::Connection(e.to_string()))?;

        if status.as_u16() == 429 {
            return Err(VenueError::RateLimited {
                retry_after_secs: 60,
            });
        }

        let json: serde_json::Value = serde_json::from_str(&body)
            .map_err(|_| VenueError::Protocol(format!("non-JSON response: {}", body)))?;

        if !status.is_success() {
            let code = json["code"].as_i64().unwrap_or(-1);
            let message = json["msg"].as_str().unwrap_or(&body).to_string();
            return Err(VenueError::Business { code, message });
        }

        Ok(json)
    }

    fn map_send_error(error: reqwest_middleware::Error) -> VenueError {
        match &error {
            reqwest_middleware::Error::Reqwest(e) if e.is_timeout() => VenueError::Timeout(30_000),
            _ => VenueError::Connection(error.to_string()),
        }
    }

    /// Binance futures order type plus whether a limit price is attached.
    fn venue_order_type(order: &Order) -> (&'static str, bool) {
        match order.order_type {
            OrderType::Market => ("MARKET", false),
            OrderType::Limit | OrderType::ConditionalLimit => ("LIMIT", true),
            OrderType::Stop | OrderType::ConditionalStop => ("STOP_MARKET", false),
            OrderType::StopLimit => ("STOP", true),
            OrderType::TakeProfit => ("TAKE_PROFIT_MARKET", false),
            OrderType::TakeProfitLimit => ("TAKE_PROFIT", true),
        }
    }

    fn map_status(raw: &str) -> OrderStatus {
        match raw {
            "NEW" => OrderStatus::Pending,
            "PARTIALLY_FILLED" => OrderStatus::Partial,
            "FILLED" => OrderStatus::Filled,
            "CANCELED" | "PENDING_CANCEL" => OrderStatus::Cancelled,
            "REJECTED" => OrderStatus::Rejected,
            "EXPIRED" => OrderStatus::Failed,
            _ => OrderStatus::Error,
        }
    }

    async fn simulate_fill(&self, order: &Order) -> Result<ExecutionReport, VenueError> {
        let price = self.get_symbol_price(&order.symbol).await?;
        info!(
            "Simulated {} {} {} @ {} (no venue call)",
            order.side, order.amount, order.symbol, price
        );
        Ok(ExecutionReport {
            status: OrderStatus::Filled,
            order_id: format!("sim-{}", Uuid::new_v4()),
            fill_price: Some(price),
            amount: Some(order.amount),
            commission: Some(Decimal::ZERO),
            error: None,
            simulated: true,
        })
    }

    async fn load_exchange_info(&self) -> Result<(), VenueError> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let json = self.read_response(response).await?;

        let mut parsed = HashMap::new();
        let symbols = json["symbols"].as_array().cloned().unwrap_or_default();
        for entry in symbols {
            if let Some(info) = parse_symbol_entry(&entry) {
                parsed.insert(info.symbol.clone(), info);
            }
        }

        info!("Loaded trading filters for {} symbols", parsed.len());
        *self.symbol_info.write().await = parsed;
        Ok(())
    }
}

fn parse_decimal(value: &serde_json::Value) -> Option<Decimal> {
    value.as_str().and_then(|s| s.parse().ok())
}

fn parse_symbol_entry(entry: &serde_json::Value) -> Option<SymbolInfo> {
    let symbol = entry["symbol"].as_str()?.to_string();
    let mut info = SymbolInfo {
        symbol,
        min_notional: Decimal::from(5),
        min_qty: Decimal::new(1, 3),
        step_size: Decimal::new(1, 3),
        tick_size: Decimal::new(1, 2),
        multiplier_up: Decimal::new(105, 2),
        multiplier_down: Decimal::new(95, 2),
    };

    for filter in entry["filters"].as_array()?.iter() {
        match filter["filterType"].as_str() {
            Some("MIN_NOTIONAL") => {
                if let Some(v) = parse_decimal(&filter["notional"]) {
                    info.min_notional = v;
                }
            }
            Some("LOT_SIZE") => {
                if let Some(v) = parse_decimal(&filter["minQty"]) {
                    info.min_qty = v;
                }
                if let Some(v) = parse_decimal(&filter["stepSize"]) {
                    info.step_size = v;
                }
            }
            Some("PRICE_FILTER") => {
                if let Some(v) = parse_decimal(&filter["tickSize"]) {
                    info.tick_size = v;
                }
            }
            Some("PERCENT_PRICE") => {
                if let Some(v) = parse_decimal(&filter["multiplierUp"]) {
                    info.multiplier_up = v;
                }
                if let Some(v) = parse_decimal(&filter["multiplierDown"]) {
                    info.multiplier_down = v;
                }
            }
            _ => {}
        }
    }

    Some(info)
}

#[async_trait]
impl Exchange for BinanceFuturesExchange {
    async fn execute(&self, order: &Order) -> Result<ExecutionReport, VenueError> {
        if order.simulate {
            return self.simulate_fill(order).await;
        }

        let (venue_type, needs_price) = Self::venue_order_type(order);
        let timestamp = chrono::Utc::now().timestamp_millis();

        let mut params = vec![
            ("symbol", order.symbol.clone()),
            ("side", order.side.to_string()),
            ("positionSide", order.position_side.to_string()),
            ("type", venue_type.to_string()),
            ("quantity", order.amount.to_string()),
            ("newClientOrderId", order.order_id.clone()),
            ("newOrderRespType", "RESULT".to_string()),
            ("timestamp", timestamp.to_string()),
        ];

        if needs_price {
            let price = order
                .target_price
                .ok_or_else(|| VenueError::Protocol("limit order without price".to_string()))?;
            params.push(("price", price.to_string()));
            params.push(("timeInForce", order.time_in_force.to_string()));
        }

        let stop_price = match order.order_type {
            OrderType::Stop | OrderType::StopLimit | OrderType::ConditionalStop => {
                order.stop_loss.or(order.target_price)
            }
            OrderType::TakeProfit | OrderType::TakeProfitLimit => {
                order.take_profit.or(order.target_price)
            }
            _ => None,
        };
        if let Some(stop_price) = stop_price {
            params.push(("stopPrice", stop_price.to_string()));
        }

        if order.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let url = self.signed_url("/fapi/v1/order", &params);
        let response = self
            .client
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let json = self.read_response(response).await?;

        let status = Self::map_status(json["status"].as_str().unwrap_or("NEW"));
        let order_id = json["orderId"]
            .as_i64()
            .map(|id| id.to_string())
            .unwrap_or_else(|| order.order_id.clone());
        let fill_price = parse_decimal(&json["avgPrice"]).filter(|p| *p > Decimal::ZERO);
        let filled_qty = parse_decimal(&json["executedQty"]).filter(|q| *q > Decimal::ZERO);

        debug!(
            "Venue accepted {} {} {}: status={}, id={}",
            order.side, order.amount, order.symbol, status, order_id
        );

        Ok(ExecutionReport {
            status,
            order_id,
            fill_price,
            amount: filled_qty.or(Some(order.amount)),
            commission: None,
            error: None,
            simulated: false,
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), VenueError> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let params = vec![
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
            ("timestamp", timestamp.to_string()),
        ];

        let url = self.signed_url("/fapi/v1/order", &params);
        let response = self
            .client
            .delete(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        self.read_response(response).await?;
        Ok(())
    }

    async fn batch_cancel(
        &self,
        symbol: &str,
        order_ids: &[String],
    ) -> Vec<Result<(), VenueError>> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let id_list = format!(
            "[{}]",
            order_ids
                .iter()
                .map(|id| id.as_str())
                .collect::<Vec<_>>()
                .join(",")
        );
        let params = vec![
            ("symbol", symbol.to_string()),
            ("orderIdList", id_list),
            ("timestamp", timestamp.to_string()),
        ];

        let url = self.signed_url("/fapi/v1/batchOrders", &params);
        let outcome = async {
            let response = self
                .client
                .delete(&url)
                .header("X-MBX-APIKEY", &self.api_key)
                .send()
                .await
                .map_err(Self::map_send_error)?;
            self.read_response(response).await
        }
        .await;

        match outcome {
            Ok(json) => {
                let entries = json.as_array().cloned().unwrap_or_default();
                order_ids
                    .iter()
                    .enumerate()
                    .map(|(i, _)| {
                        let entry = entries.get(i);
                        match entry.and_then(|e| e["code"].as_i64()) {
                            Some(code) => Err(VenueError::Business {
                                code,
                                message: entry
                                    .and_then(|e| e["msg"].as_str())
                                    .unwrap_or("batch cancel rejected")
                                    .to_string(),
                            }),
                            None => Ok(()),
                        }
                    })
                    .collect()
            }
            Err(e) => {
                warn!("Batch cancel failed for {}: {}", symbol, e);
                order_ids
                    .iter()
                    .map(|_| Err(VenueError::Connection(e.to_string())))
                    .collect()
            }
        }
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, VenueError> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let params = vec![
            ("symbol", symbol.to_string()),
            ("timestamp", timestamp.to_string()),
        ];

        let url = self.signed_url("/fapi/v1/openOrders", &params);
        let response = self
            .client
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let json = self.read_response(response).await?;

        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct VenueOrder {
            order_id: i64,
            #[serde(rename = "type")]
            order_type: String,
            side: String,
            position_side: String,
            #[serde(default)]
            stop_price: String,
            orig_qty: String,
            #[serde(default)]
            reduce_only: bool,
            status: String,
        }

        let venue_orders: Vec<VenueOrder> = serde_json::from_value(json)
            .map_err(|e| VenueError::Protocol(format!("openOrders decode: {}", e)))?;

        Ok(venue_orders
            .into_iter()
            .filter_map(|vo| {
                let order_type = match vo.order_type.as_str() {
                    "MARKET" => OrderType::Market,
                    "LIMIT" => OrderType::Limit,
                    "STOP_MARKET" | "STOP" => OrderType::Stop,
                    "TAKE_PROFIT_MARKET" | "TAKE_PROFIT" => OrderType::TakeProfit,
                    _ => return None,
                };
                let side = match vo.side.as_str() {
                    "BUY" => OrderSide::Buy,
                    "SELL" => OrderSide::Sell,
                    _ => return None,
                };
                let position_side = match vo.position_side.as_str() {
                    "LONG" => PositionSide::Long,
                    "SHORT" => PositionSide::Short,
                    _ => return None,
                };
                Some(OpenOrder {
                    order_id: vo.order_id.to_string(),
                    order_type,
                    side,
                    position_side,
                    stop_price: vo.stop_price.parse().ok(),
                    quantity: vo.orig_qty.parse().unwrap_or(Decimal::ZERO),
                    reduce_only: vo.reduce_only,
                    status: Self::map_status(&vo.status),
                })
            })
            .collect())
    }

    async fn get_symbol_price(&self, symbol: &str) -> Result<Decimal, VenueError> {
        let url = format!("{}/fapi/v1/ticker/price?symbol={}", self.base_url, symbol);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let json = self.read_response(response).await?;

        parse_decimal(&json["price"])
            .ok_or_else(|| VenueError::Protocol(format!("missing price for {}", symbol)))
    }

    async fn get_symbol_info(&self, symbol: &str) -> Result<SymbolInfo, VenueError> {
        if let Some(info) = self.symbol_info.read().await.get(symbol) {
            return Ok(info.clone());
        }

        self.load_exchange_info().await?;
        self.symbol_info
            .read()
            .await
            .get(symbol)
            .cloned()
            .ok_or_else(|| VenueError::Protocol(format!("unknown symbol {}", symbol)))
    }

    async fn change_leverage(&self, symbol: &str, leverage: u32) -> Result<(), VenueError> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let params = vec![
            ("symbol", symbol.to_string()),
            ("leverage", leverage.to_string()),
            ("timestamp", timestamp.to_string()),
        ];

        let url = self.signed_url("/fapi/v1/leverage", &params);
        let response = self
            .client
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        self.read_response(response).await?;
        Ok(())
    }

    async fn set_position_mode(&self, hedge: bool) -> Result<(), VenueError> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let params = vec![
            ("dualSidePosition", hedge.to_string()),
            ("timestamp", timestamp.to_string()),
        ];

        let url = self.signed_url("/fapi/v1/positionSide/dual", &params);
        let response = self
            .client
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        // Code -4059 means the mode is already what we asked for.
        match self.read_response(response).await {
            Ok(_) => Ok(()),
            Err(VenueError::Business { code: -4059, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn ping(&self) -> Result<(), VenueError> {
        let url = format!("{}/fapi/v1/ping", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        self.read_response(response).await?;
        Ok(())
    }
}
