use super::{ExchangeError, MarketData, RateBudget};
use crate::models::{normalize_price, Bar};
use crate::settings::ExchangeSettings;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const USED_WEIGHT_HEADER: &str = "x-mbx-used-weight-1m";
const INVALID_SYMBOL_CODE: i64 = -1121;
const DAILY_INTERVAL: &str = "1d";

/// Client for the Binance USDT-M futures REST API
///
/// Cloneable; all clones share the HTTP connection pool and the rate budget.
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
    kline_limit: u32,
    quote_asset: String,
    budget: Arc<RateBudget>,
}

// ============== Response Types ==============

/// [open_time, open, high, low, close, volume, close_time, quote_volume, trades,
///  taker_base_volume, taker_quote_volume, ignore]
#[derive(Debug, Deserialize)]
struct RawKline(
    i64,
    String,
    String,
    String,
    String,
    String,
    i64,
    String,
    i64,
    String,
    String,
    String,
);

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    #[serde(default)]
    quote_asset: String,
    #[serde(default)]
    contract_type: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: i64,
    msg: String,
}

// ============== Implementation ==============

impl BinanceClient {
    pub fn new(settings: &ExchangeSettings, budget: Arc<RateBudget>) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| ExchangeError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            kline_limit: settings.kline_limit,
            quote_asset: settings.quote_asset.clone(),
            budget,
        })
    }

    pub fn budget(&self) -> &Arc<RateBudget> {
        &self.budget
    }

    /// Request weight Binance charges for a klines call of the given limit
    pub fn kline_weight(limit: u32) -> u32 {
        match limit {
            0..=99 => 1,
            100..=499 => 2,
            500..=1000 => 5,
            _ => 10,
        }
    }

    /// Connectivity check against `/fapi/v1/ping`
    pub async fn ping(&self) -> Result<(), ExchangeError> {
        let _: serde_json::Value = self.get_json("/fapi/v1/ping", &[]).await?;
        Ok(())
    }

    /// Fetch one page of daily klines starting at `start_ms`
    async fn get_klines_page(&self, symbol: &str, start_ms: i64) -> Result<Vec<Bar>, ExchangeError> {
        let raw: Vec<RawKline> = self
            .get_json(
                "/fapi/v1/klines",
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", DAILY_INTERVAL.to_string()),
                    ("startTime", start_ms.to_string()),
                    ("limit", self.kline_limit.to_string()),
                ],
            )
            .await?;

        raw.into_iter().map(parse_kline).collect()
    }

    /// GET `path` and decode JSON, translating HTTP failures into `ExchangeError`
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).query(params).send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let used_weight = parse_used_weight(&headers);

        if status.is_success() {
            self.budget.record_response(used_weight, None);
            return response.json::<T>().await.map_err(|e| ExchangeError::Decode(e.to_string()));
        }

        let retry_after = parse_retry_after(&headers);
        let body = response.text().await.unwrap_or_default();

        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                self.budget.record_response(used_weight, retry_after);
                tracing::warn!("Rate limited (429) on {}, retry after {:?}", path, retry_after);
                Err(ExchangeError::RateLimited { retry_after })
            }
            StatusCode::IM_A_TEAPOT => {
                self.budget.record_response(used_weight, retry_after);
                tracing::error!("IP banned (418) on {}, retry after {:?}", path, retry_after);
                Err(ExchangeError::Banned { retry_after })
            }
            StatusCode::NOT_FOUND => Err(ExchangeError::NotFound(symbol_param(params))),
            s if s.is_server_error() => {
                self.budget.record_response(used_weight, None);
                Err(ExchangeError::Server { status: s.as_u16() })
            }
            s => {
                self.budget.record_response(used_weight, None);
                match serde_json::from_str::<ErrorBody>(&body) {
                    Ok(err) if err.code == INVALID_SYMBOL_CODE => {
                        Err(ExchangeError::NotFound(symbol_param(params)))
                    }
                    Ok(err) => Err(ExchangeError::Api {
                        status: s.as_u16(),
                        body: format!("{} ({})", err.msg, err.code),
                    }),
                    Err(_) => Err(ExchangeError::Api {
                        status: s.as_u16(),
                        body,
                    }),
                }
            }
        }
    }
}

#[async_trait]
impl MarketData for BinanceClient {
    /// Pages through `/fapi/v1/klines` until a short page comes back
    async fn get_daily_bars(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Bar>, ExchangeError> {
        let mut bars: Vec<Bar> = Vec::new();
        let mut start_ms = since.timestamp_millis();
        let page_weight = Self::kline_weight(self.kline_limit);

        loop {
            // The first page was reserved by the caller
            if !bars.is_empty() {
                self.budget.acquire(page_weight).await;
            }

            let page = self.get_klines_page(symbol, start_ms).await?;
            let page_len = page.len();

            if let Some(last) = page.last() {
                start_ms = last.open_time.timestamp_millis() + 1;
            }
            bars.extend(page);

            if page_len < self.kline_limit as usize {
                break;
            }
        }

        tracing::debug!("{}: fetched {} daily bars", symbol, bars.len());
        Ok(bars)
    }

    async fn get_latest_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let ticker: TickerPrice = self
            .get_json("/fapi/v1/ticker/price", &[("symbol", symbol.to_string())])
            .await?;

        parse_decimal(&ticker.price).map(normalize_price)
    }

    /// Trading perpetual contracts quoted in the configured asset
    async fn list_symbols(&self) -> Result<Vec<String>, ExchangeError> {
        let info: ExchangeInfo = self.get_json("/fapi/v1/exchangeInfo", &[]).await?;

        let symbols: Vec<String> = info
            .symbols
            .into_iter()
            .filter(|s| {
                s.quote_asset == self.quote_asset
                    && s.contract_type == "PERPETUAL"
                    && s.status == "TRADING"
            })
            .map(|s| s.symbol)
            .collect();

        tracing::info!("Found {} {} perpetual symbols", symbols.len(), self.quote_asset);
        Ok(symbols)
    }

    fn bars_weight(&self) -> u32 {
        Self::kline_weight(self.kline_limit)
    }
}

fn parse_kline(raw: RawKline) -> Result<Bar, ExchangeError> {
    let open_time = Utc
        .timestamp_millis_opt(raw.0)
        .single()
        .ok_or_else(|| ExchangeError::Decode(format!("Invalid open time: {}", raw.0)))?;

    Ok(Bar {
        open_time,
        open: parse_decimal(&raw.1)?,
        high: parse_decimal(&raw.2)?,
        low: parse_decimal(&raw.3)?,
        close: parse_decimal(&raw.4)?,
        volume: parse_decimal(&raw.5)?,
    })
}

fn parse_decimal(value: &str) -> Result<Decimal, ExchangeError> {
    Decimal::from_str(value).map_err(|e| ExchangeError::Decode(format!("{}: {}", value, e)))
}

fn parse_used_weight(headers: &HeaderMap) -> Option<u32> {
    headers
        .get(USED_WEIGHT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn symbol_param(params: &[(&str, String)]) -> String {
    params
        .iter()
        .find(|(k, _)| *k == "symbol")
        .map(|(_, v)| v.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use rust_decimal_macros::dec;

    fn client_for(server: &Server, kline_limit: u32) -> BinanceClient {
        let settings = ExchangeSettings {
            base_url: server.url(),
            request_timeout_secs: 5,
            kline_limit,
            ..ExchangeSettings::default()
        };
        let budget = Arc::new(RateBudget::from_settings(&settings));
        BinanceClient::new(&settings, budget).unwrap()
    }

    fn kline_json(open_ms: i64, high: &str, low: &str, close: &str, volume: &str) -> String {
        format!(
            r#"[{open_ms},"1.0","{high}","{low}","{close}","{volume}",{},"0",10,"0","0","0"]"#,
            open_ms + 86_399_999
        )
    }

    #[test]
    fn test_kline_weight_tiers() {
        assert_eq!(BinanceClient::kline_weight(99), 1);
        assert_eq!(BinanceClient::kline_weight(100), 2);
        assert_eq!(BinanceClient::kline_weight(500), 5);
        assert_eq!(BinanceClient::kline_weight(1000), 5);
        assert_eq!(BinanceClient::kline_weight(1500), 10);
    }

    #[tokio::test]
    async fn test_latest_price_records_used_weight() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/fapi/v1/ticker/price")
            .match_query(Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()))
            .with_status(200)
            .with_header("X-MBX-USED-WEIGHT-1M", "1234")
            .with_body(r#"{"symbol":"BTCUSDT","price":"64000.10","time":1700000000000}"#)
            .create_async()
            .await;

        let client = client_for(&server, 500);
        let price = client.get_latest_price("BTCUSDT").await.unwrap();

        assert_eq!(price, dec!(64000.10));
        assert_eq!(client.budget().consumed(), 1234);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_429_maps_to_rate_limited_with_retry_after() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/fapi/v1/ticker/price")
            .match_query(Matcher::Any)
            .with_status(429)
            .with_header("Retry-After", "12")
            .with_body(r#"{"code":-1003,"msg":"Too many requests"}"#)
            .create_async()
            .await;

        let client = client_for(&server, 500);
        let err = client.get_latest_price("BTCUSDT").await.unwrap_err();

        assert_eq!(
            err,
            ExchangeError::RateLimited {
                retry_after: Some(Duration::from_secs(12))
            }
        );
        assert!(client.budget().blocked_for().is_some());
    }

    #[tokio::test]
    async fn test_418_maps_to_banned() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/fapi/v1/ticker/price")
            .match_query(Matcher::Any)
            .with_status(418)
            .with_header("Retry-After", "120")
            .create_async()
            .await;

        let client = client_for(&server, 500);
        let err = client.get_latest_price("BTCUSDT").await.unwrap_err();

        assert!(matches!(err, ExchangeError::Banned { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_invalid_symbol_maps_to_not_found() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/fapi/v1/ticker/price")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"code":-1121,"msg":"Invalid symbol."}"#)
            .create_async()
            .await;

        let client = client_for(&server, 500);
        let err = client.get_latest_price("NOPEUSDT").await.unwrap_err();

        assert_eq!(err, ExchangeError::NotFound("NOPEUSDT".to_string()));
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/fapi/v1/ticker/price")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let client = client_for(&server, 500);
        let err = client.get_latest_price("BTCUSDT").await.unwrap_err();

        assert_eq!(err, ExchangeError::Server { status: 503 });
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_daily_bars_paginate_until_short_page() {
        let mut server = Server::new_async().await;
        let day = 86_400_000i64;
        let t0 = 1_704_067_200_000i64; // 2024-01-01

        let first_page = format!(
            "[{},{}]",
            kline_json(t0, "11", "9", "10", "100"),
            kline_json(t0 + day, "12", "10", "11", "200")
        );
        let second_page = format!("[{}]", kline_json(t0 + 2 * day, "13", "11", "12", "300"));

        let page1 = server
            .mock("GET", "/fapi/v1/klines")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("symbol".into(), "ETHUSDT".into()),
                Matcher::UrlEncoded("interval".into(), "1d".into()),
                Matcher::UrlEncoded("startTime".into(), t0.to_string()),
                Matcher::UrlEncoded("limit".into(), "2".into()),
            ]))
            .with_status(200)
            .with_body(first_page)
            .create_async()
            .await;
        let page2 = server
            .mock("GET", "/fapi/v1/klines")
            .match_query(Matcher::UrlEncoded(
                "startTime".into(),
                (t0 + day + 1).to_string(),
            ))
            .with_status(200)
            .with_body(second_page)
            .create_async()
            .await;

        let client = client_for(&server, 2);
        let since = Utc.timestamp_millis_opt(t0).single().unwrap();
        let bars = client.get_daily_bars("ETHUSDT", since).await.unwrap();

        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].close, dec!(10));
        assert_eq!(bars[2].volume, dec!(300));
        assert!(bars.windows(2).all(|w| w[0].open_time < w[1].open_time));
        page1.assert_async().await;
        page2.assert_async().await;
    }

    #[tokio::test]
    async fn test_list_symbols_filters_trading_usdt_perpetuals() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/fapi/v1/exchangeInfo")
            .with_status(200)
            .with_body(
                r#"{"symbols":[
                    {"symbol":"BTCUSDT","quoteAsset":"USDT","contractType":"PERPETUAL","status":"TRADING"},
                    {"symbol":"BTCUSDT_240628","quoteAsset":"USDT","contractType":"CURRENT_QUARTER","status":"TRADING"},
                    {"symbol":"ETHBUSD","quoteAsset":"BUSD","contractType":"PERPETUAL","status":"TRADING"},
                    {"symbol":"OLDUSDT","quoteAsset":"USDT","contractType":"PERPETUAL","status":"SETTLING"},
                    {"symbol":"SOLUSDT","quoteAsset":"USDT","contractType":"PERPETUAL","status":"TRADING"}
                ]}"#,
            )
            .create_async()
            .await;

        let client = client_for(&server, 500);
        let symbols = client.list_symbols().await.unwrap();

        assert_eq!(symbols, vec!["BTCUSDT", "SOLUSDT"]);
    }
}
