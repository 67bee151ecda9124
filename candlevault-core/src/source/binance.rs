//! Binance spot klines source.
//!
//! Queries `GET /api/v3/klines` with `symbol`, `interval`, `limit` and an
//! optional `startTime`. The response is an array of fixed-arity arrays,
//! oldest first; an empty array means there is nothing at or after
//! `startTime`.
//!
//! One HTTP attempt per `fetch`. Failures are classified into `SourceError`
//! variants and fed to the circuit breaker; the caller decides whether to
//! retry.

use super::circuit_breaker::CircuitBreaker;
use super::{CandleSource, FetchRequest, SourceError};
use crate::candle::RawCandle;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.binance.com";

/// Upstream cap on `limit`.
pub const MAX_LIMIT: u32 = 1000;

const KLINES_PATH: &str = "/api/v3/klines";

/// Fallback when a 429 carries no usable `Retry-After` header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Longest `Retry-After` honoured; matches the default breaker cooldown.
pub const MAX_RETRY_AFTER_SECS: u64 = 30 * 60;

/// Error bodies are echoed into `SourceError::HttpStatus`; keep them short.
const MAX_ERROR_BODY: usize = 256;

pub struct BinanceSource {
    client: reqwest::blocking::Client,
    base_url: String,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl BinanceSource {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, SourceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("candlevault/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SourceError::Client(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            circuit_breaker,
        })
    }

    pub fn klines_url(&self) -> String {
        format!("{}{KLINES_PATH}", self.base_url)
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    /// Query-string parameters for one request.
    pub fn query_params(req: &FetchRequest) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("symbol", req.symbol.clone()),
            ("interval", req.interval.clone()),
            ("limit", req.limit.min(MAX_LIMIT).to_string()),
        ];
        if let Some(since) = req.since {
            params.push(("startTime", since.to_string()));
        }
        params
    }

    /// Map a non-success status to a `SourceError`.
    pub fn classify_status(status: StatusCode, retry_after: Option<u64>, body: &str) -> SourceError {
        match status {
            StatusCode::TOO_MANY_REQUESTS => SourceError::RateLimited {
                retry_after_secs: retry_after
                    .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
                    .min(MAX_RETRY_AFTER_SECS),
            },
            StatusCode::IM_A_TEAPOT | StatusCode::FORBIDDEN => SourceError::Banned {
                status: status.as_u16(),
            },
            _ => SourceError::HttpStatus {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY).collect(),
            },
        }
    }

    /// Decode a 2xx body into raw candles.
    pub fn decode(body: &str) -> Result<Vec<RawCandle>, SourceError> {
        serde_json::from_str(body).map_err(|e| SourceError::MalformedPayload(e.to_string()))
    }

    fn record_outcome(&self, err: &SourceError) {
        match err {
            SourceError::Banned { .. } => self.circuit_breaker.trip(),
            e if e.is_transient() => self.circuit_breaker.record_failure(),
            _ => {}
        }
    }

    fn send(&self, req: &FetchRequest) -> Result<Vec<RawCandle>, SourceError> {
        let resp = self
            .client
            .get(self.klines_url())
            .query(&Self::query_params(req))
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    SourceError::Timeout(e.to_string())
                } else {
                    SourceError::Network(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let body = resp.text().unwrap_or_default();
            return Err(Self::classify_status(status, retry_after, &body));
        }

        let body = resp
            .text()
            .map_err(|e| SourceError::MalformedPayload(format!("read body: {e}")))?;
        Self::decode(&body)
    }
}

impl CandleSource for BinanceSource {
    fn name(&self) -> &str {
        "binance_spot"
    }

    fn fetch(&self, req: &FetchRequest) -> Result<Vec<RawCandle>, SourceError> {
        if !self.circuit_breaker.is_allowed() {
            return Err(SourceError::CircuitBreakerTripped);
        }

        debug!(
            symbol = %req.symbol,
            interval = %req.interval,
            limit = req.limit,
            since = ?req.since,
            "requesting klines"
        );

        match self.send(req) {
            Ok(batch) => {
                self.circuit_breaker.record_success();
                debug!(symbol = %req.symbol, candles = batch.len(), "klines received");
                Ok(batch)
            }
            Err(e) => {
                self.record_outcome(&e);
                warn!(symbol = %req.symbol, since = ?req.since, error = %e, "klines request failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn request(since: Option<i64>) -> FetchRequest {
        FetchRequest {
            symbol: "BTCUSDT".into(),
            interval: "1h".into(),
            limit: 1000,
            since,
        }
    }

    fn source(base_url: &str) -> BinanceSource {
        BinanceSource::new(
            base_url,
            Duration::from_secs(1),
            Arc::new(CircuitBreaker::default_upstream()),
        )
        .unwrap()
    }

    #[test]
    fn query_includes_start_time_only_when_present() {
        let without = BinanceSource::query_params(&request(None));
        assert!(without.iter().all(|(k, _)| *k != "startTime"));

        let with = BinanceSource::query_params(&request(Some(1677628800000)));
        assert!(with.contains(&("startTime", "1677628800000".to_string())));
        assert!(with.contains(&("symbol", "BTCUSDT".to_string())));
        assert!(with.contains(&("interval", "1h".to_string())));
    }

    #[test]
    fn limit_is_capped() {
        let mut req = request(None);
        req.limit = 5000;
        let params = BinanceSource::query_params(&req);
        assert!(params.contains(&("limit", "1000".to_string())));
    }

    #[test]
    fn url_joins_without_double_slash() {
        assert_eq!(
            source("https://api.binance.com/").klines_url(),
            "https://api.binance.com/api/v3/klines"
        );
    }

    #[test]
    fn status_classification() {
        let rate = BinanceSource::classify_status(StatusCode::TOO_MANY_REQUESTS, Some(12), "");
        assert_eq!(rate.retry_after_secs(), Some(12));

        let rate_default = BinanceSource::classify_status(StatusCode::TOO_MANY_REQUESTS, None, "");
        assert_eq!(rate_default.retry_after_secs(), Some(DEFAULT_RETRY_AFTER_SECS));

        let absurd = BinanceSource::classify_status(StatusCode::TOO_MANY_REQUESTS, Some(u64::MAX), "");
        assert_eq!(absurd.retry_after_secs(), Some(MAX_RETRY_AFTER_SECS));

        assert!(matches!(
            BinanceSource::classify_status(StatusCode::IM_A_TEAPOT, None, ""),
            SourceError::Banned { status: 418 }
        ));

        let bad_symbol = BinanceSource::classify_status(
            StatusCode::BAD_REQUEST,
            None,
            r#"{"code":-1121,"msg":"Invalid symbol."}"#,
        );
        assert!(!bad_symbol.is_transient());

        let outage = BinanceSource::classify_status(StatusCode::BAD_GATEWAY, None, "");
        assert!(outage.is_transient());
    }

    #[test]
    fn decode_accepts_empty_array() {
        assert!(BinanceSource::decode("[]").unwrap().is_empty());
    }

    #[test]
    fn decode_rejects_object_payload() {
        let err = BinanceSource::decode(r#"{"code":-1100,"msg":"Illegal characters"}"#).unwrap_err();
        assert!(matches!(err, SourceError::MalformedPayload(_)));
    }

    #[test]
    fn ban_trips_breaker_and_blocks_next_call() {
        let src = source("http://127.0.0.1:9");
        src.record_outcome(&SourceError::Banned { status: 418 });
        assert!(matches!(
            src.fetch(&request(None)),
            Err(SourceError::CircuitBreakerTripped)
        ));
    }

    /// Serve one canned HTTP response on a loopback port; returns the base URL.
    fn serve_once(status_line: &'static str, headers: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf);
            let response = format!(
                "HTTP/1.1 {status_line}\r\n{headers}Content-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
        });
        format!("http://{addr}")
    }

    #[test]
    fn rate_limited_response_carries_retry_after() {
        let base = serve_once("429 Too Many Requests", "Retry-After: 7\r\n", "");
        let src = source(&base);
        let err = src.send(&request(Some(1677628800000))).unwrap_err();
        assert!(matches!(err, SourceError::RateLimited { retry_after_secs: 7 }));
        assert!(err.is_transient());
    }

    #[test]
    fn empty_page_is_success() {
        let base = serve_once("200 OK", "", "[]");
        let src = source(&base);
        let batch = src.fetch(&request(Some(1677628800000))).unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn page_of_klines_is_decoded() {
        let base = serve_once(
            "200 OK",
            "",
            r#"[[1677628800000,"23147.35","23200.00","23100.00","23150.10","1234.5",1677632399999,"0",10,"0","0","0"]]"#,
        );
        let batch = source(&base).fetch(&request(None)).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].open_time().unwrap(), 1677628800000);
    }

    #[test]
    fn client_error_keeps_body_and_is_fatal() {
        let base = serve_once(
            "400 Bad Request",
            "",
            r#"{"code":-1121,"msg":"Invalid symbol."}"#,
        );
        let err = source(&base).send(&request(None)).unwrap_err();
        match &err {
            SourceError::HttpStatus { status, body } => {
                assert_eq!(*status, 400);
                assert!(body.contains("Invalid symbol"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!err.is_transient());
    }

    #[test]
    fn slow_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(2));
        });

        let src = BinanceSource::new(
            format!("http://{addr}"),
            Duration::from_millis(200),
            Arc::new(CircuitBreaker::default_upstream()),
        )
        .unwrap();
        let err = src.send(&request(None)).unwrap_err();
        assert!(matches!(err, SourceError::Timeout(_)), "got {err}");
    }

    #[test]
    fn refused_connection_is_network_error() {
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let src = source(&format!("http://{addr}"));
        let err = src.send(&request(None)).unwrap_err();
        assert!(matches!(err, SourceError::Network(_)), "got {err}");
        assert!(err.is_transient());
    }
}
