//! HTTP fallback quote source.
//!
//! `GET {base}/v1/quotes?symbols=A,B` with an optional `X-API-Key` header.
//! The response carries one daily quote per known symbol:
//!
//! ```json
//! {"quotes":[{"symbol":"AAPL","open":185.0,"high":188.1,"low":184.2,
//!             "close":187.25,"volume":51234567,"previous_close":186.0,
//!             "timestamp":1700000000000}]}
//! ```

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::application::ports::{FallbackError, FallbackSource};
use crate::domain::price::{PriceRecord, PriceRecordError, PriceSource};
use crate::domain::subscription::Symbol;
use crate::infrastructure::config::{FallbackSettings, Secret};

/// HTTP fallback source adapter.
///
/// Implements `FallbackSource` against a batch quote endpoint.
#[derive(Debug)]
pub struct HttpFallbackSource {
    client: reqwest::Client,
    base_url: String,
    api_key: Secret,
    timeout: Duration,
}

impl HttpFallbackSource {
    /// Create a new HTTP fallback source.
    ///
    /// # Errors
    ///
    /// Returns `FallbackError::Network` if the HTTP client cannot be built.
    pub fn new(settings: &FallbackSettings) -> Result<Self, FallbackError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| FallbackError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            timeout: settings.request_timeout,
        })
    }

    async fn fetch_response(&self, symbols: &[Symbol]) -> Result<QuotesResponse, FallbackError> {
        let url = format!("{}/v1/quotes", self.base_url);
        let mut request = self
            .client
            .get(&url)
            .query(&[("symbols", symbols.join(","))]);
        if !self.api_key.is_empty() {
            request = request.header("X-API-Key", self.api_key.expose());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FallbackError::Timeout(self.timeout)
            } else {
                FallbackError::Network(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(FallbackError::Http {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| FallbackError::Decode(e.to_string()))
    }
}

#[async_trait]
impl FallbackSource for HttpFallbackSource {
    async fn fetch_quotes(&self, symbols: &[Symbol]) -> Result<Vec<PriceRecord>, FallbackError> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }

        let response = self.fetch_response(symbols).await?;
        let records = response
            .quotes
            .into_iter()
            .filter_map(|quote| {
                let symbol = quote.symbol.clone();
                match quote.into_record() {
                    Ok(record) => Some(record),
                    Err(e) => {
                        tracing::warn!(symbol, error = %e, "Discarding invalid fallback quote");
                        None
                    }
                }
            })
            .collect();
        Ok(records)
    }
}

// API response types

#[derive(Debug, Deserialize)]
struct QuotesResponse {
    #[serde(default)]
    quotes: Vec<QuoteData>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    symbol: String,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    #[serde(default)]
    volume: u64,
    #[serde(default)]
    previous_close: Option<Decimal>,
    timestamp: i64,
}

impl QuoteData {
    /// Price is the close; change is measured against the previous close,
    /// or the open when the previous close is unknown.
    fn into_record(self) -> Result<PriceRecord, PriceRecordError> {
        let reference = self.previous_close.unwrap_or(self.open);
        let change = change_against(self.close, reference);
        if change.is_none() {
            tracing::debug!(symbol = %self.symbol, "Quote change overflows, omitting");
        }

        let record = PriceRecord::new(
            self.symbol,
            self.close,
            self.volume,
            self.timestamp,
            PriceSource::Fallback,
        )?
        .with_range(self.high, self.low);

        Ok(match change {
            Some((change, change_percent)) => record.with_change(change, change_percent),
            None => record,
        })
    }
}

/// Absolute and percent change of `price` against `reference`.
///
/// `None` if either does not fit in a `Decimal`.
fn change_against(price: Decimal, reference: Decimal) -> Option<(Decimal, Decimal)> {
    let change = price.checked_sub(reference)?;
    let change_percent = if reference.is_zero() {
        Decimal::ZERO
    } else {
        change
            .checked_div(reference)?
            .checked_mul(Decimal::ONE_HUNDRED)?
            .round_dp(4)
    };
    Some((change, change_percent))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn source(server: &MockServer, api_key: &str) -> HttpFallbackSource {
        let mut settings = FallbackSettings::new(format!("{}/", server.uri()));
        settings.api_key = Secret::new(api_key.to_string());
        settings.request_timeout = Duration::from_millis(500);
        HttpFallbackSource::new(&settings).unwrap()
    }

    #[tokio::test]
    async fn fetches_and_maps_quotes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/quotes"))
            .and(query_param("symbols", "AAPL,MSFT"))
            .and(header("X-API-Key", "key123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "quotes": [
                    {"symbol": "AAPL", "open": 185.0, "high": 188.0, "low": 184.0,
                     "close": 187.0, "volume": 1000, "previous_close": 170.0,
                     "timestamp": 1_700_000_000_000_i64},
                    {"symbol": "MSFT", "open": 400.0, "high": 410.0, "low": 395.0,
                     "close": 404.0, "volume": 500, "timestamp": 1_700_000_000_000_i64}
                ]
            })))
            .mount(&server)
            .await;

        let records = source(&server, "key123")
            .fetch_quotes(&["AAPL".to_string(), "MSFT".to_string()])
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        let aapl = &records[0];
        assert_eq!(aapl.price(), dec("187"));
        assert_eq!(aapl.source(), PriceSource::Fallback);
        assert_eq!(aapl.change(), Some(dec("17")));
        assert_eq!(aapl.change_percent(), Some(dec("10")));
        assert_eq!(aapl.high(), Some(dec("188")));

        let msft = &records[1];
        assert_eq!(msft.change(), Some(dec("4")));
        assert_eq!(msft.change_percent(), Some(dec("1")));
    }

    #[tokio::test]
    async fn overflowing_change_is_omitted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/quotes"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"quotes":[{"symbol":"HUGE","open":1,"high":10000000000000000000000,
                   "low":1,"close":10000000000000000000000,"volume":1,
                   "previous_close":0.00000001,"timestamp":1700000000000}]}"#,
            ))
            .mount(&server)
            .await;

        let records = source(&server, "")
            .fetch_quotes(&["HUGE".to_string()])
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert!(records[0].price() > dec("1000000000000000000000"));
        assert_eq!(records[0].change(), None);
        assert_eq!(records[0].change_percent(), None);
    }

    #[test]
    fn change_against_zero_reference() {
        assert_eq!(
            change_against(dec("5"), Decimal::ZERO),
            Some((dec("5"), Decimal::ZERO))
        );
        assert_eq!(change_against(Decimal::MAX, dec("-1")), None);
    }

    #[tokio::test]
    async fn non_success_status_is_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/quotes"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let err = source(&server, "")
            .fetch_quotes(&["AAPL".to_string()])
            .await
            .unwrap_err();
        assert_eq!(
            err,
            FallbackError::Http {
                status: 503,
                body: "down".to_string()
            }
        );
    }

    #[tokio::test]
    async fn malformed_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/quotes"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{not json"))
            .mount(&server)
            .await;

        let err = source(&server, "")
            .fetch_quotes(&["AAPL".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, FallbackError::Decode(_)));
    }

    #[tokio::test]
    async fn invalid_quotes_are_dropped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/quotes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "quotes": [
                    {"symbol": "ZERO", "open": 1.0, "high": 1.0, "low": 0.0,
                     "close": 0.0, "volume": 0, "timestamp": 1},
                    {"symbol": "OK", "open": 1.0, "high": 1.0, "low": 1.0,
                     "close": 1.0, "volume": 0, "timestamp": 1}
                ]
            })))
            .mount(&server)
            .await;

        let records = source(&server, "")
            .fetch_quotes(&["ZERO".to_string(), "OK".to_string()])
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].symbol(), "OK");
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"quotes": []}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let err = source(&server, "")
            .fetch_quotes(&["AAPL".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err, FallbackError::Timeout(Duration::from_millis(500)));
    }

    #[tokio::test]
    async fn empty_request_skips_network() {
        let server = MockServer::start().await;
        let records = source(&server, "").fetch_quotes(&[]).await.unwrap();
        assert!(records.is_empty());
        assert!(server.received_requests().await.unwrap().is_empty());
    }
}
