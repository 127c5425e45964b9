//! REST handlers for `/health` and `/history`.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::AppState;
use crate::history::{HistoryError, DEFAULT_LIMIT, MAX_LIMIT};
use crate::models::{normalize_symbol, Interval, Kline};
use crate::queue::QueueStats;

pub async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let queue = state.queue.stats().await.unwrap_or(QueueStats {
        waiting: 0,
        delayed: 0,
        failed: 0,
    });

    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().timestamp_millis(),
        "upstream": { "connected": state.feed.connected() },
        "broker": { "connected": state.broker.connected() },
        "queue": queue,
    }))
}

/// Raw query params; everything arrives as strings so validation errors can
/// say what was wrong instead of axum's generic rejection.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub symbol: Option<String>,
    pub interval: Option<String>,
    #[serde(rename = "startTime")]
    pub start_time: Option<String>,
    #[serde(rename = "endTime")]
    pub end_time: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, PartialEq)]
struct ValidatedQuery {
    symbol: String,
    interval: Interval,
    start_time: Option<i64>,
    end_time: Option<i64>,
    limit: usize,
}

fn validate_query(params: &HistoryQuery) -> Result<ValidatedQuery, String> {
    let symbol = params
        .symbol
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(normalize_symbol)
        .ok_or_else(|| "symbol is required".to_string())?;

    let interval = params
        .interval
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "interval is required".to_string())?
        .parse::<Interval>()
        .map_err(|_| {
            "interval must be one of 1m,3m,5m,15m,30m,1h,2h,4h,6h,8h,12h,1d,3d,1w,1M".to_string()
        })?;

    let parse_ms = |name: &str, value: &Option<String>| -> Result<Option<i64>, String> {
        match value.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => raw
                .parse::<i64>()
                .map(Some)
                .map_err(|_| format!("{name} must be a millisecond timestamp")),
            None => Ok(None),
        }
    };
    let start_time = parse_ms("startTime", &params.start_time)?;
    let end_time = parse_ms("endTime", &params.end_time)?;

    let limit = match params.limit.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => {
            let parsed: usize = raw
                .parse()
                .map_err(|_| "limit must be an integer".to_string())?;
            if parsed == 0 || parsed > MAX_LIMIT {
                return Err(format!("limit must be between 1 and {MAX_LIMIT}"));
            }
            parsed
        }
        None => DEFAULT_LIMIT,
    };

    Ok(ValidatedQuery {
        symbol,
        interval,
        start_time,
        end_time,
        limit,
    })
}

/// One candle in the history response; the row key is implied by the query.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRow {
    open_time: i64,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: String,
    close_time: i64,
    quote_volume: String,
    trades: i64,
    taker_buy_base_volume: String,
    taker_buy_quote_volume: String,
}

impl From<Kline> for HistoryRow {
    fn from(row: Kline) -> Self {
        HistoryRow {
            open_time: row.open_time,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
            close_time: row.close_time,
            quote_volume: row.quote_volume,
            trades: row.trades,
            taker_buy_base_volume: row.taker_buy_base_volume,
            taker_buy_quote_volume: row.taker_buy_quote_volume,
        }
    }
}

pub async fn get_history(
    Query(params): Query<HistoryQuery>,
    State(state): State<AppState>,
) -> Response {
    let query = match validate_query(&params) {
        Ok(query) => query,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, &message),
    };

    match state
        .history
        .get_historical_klines(
            &query.symbol,
            query.interval,
            query.start_time,
            query.end_time,
            query.limit,
        )
        .await
    {
        Ok(rows) => {
            let data: Vec<HistoryRow> = rows.into_iter().map(HistoryRow::from).collect();
            Json(json!({
                "success": true,
                "symbol": query.symbol,
                "interval": query.interval.as_str(),
                "count": data.len(),
                "data": data,
            }))
            .into_response()
        }
        Err(e) => error_response(history_status(&e), &e.to_string()),
    }
}

fn history_status(error: &HistoryError) -> StatusCode {
    match error {
        HistoryError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        HistoryError::SymbolNotFound => StatusCode::NOT_FOUND,
        HistoryError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
        HistoryError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
        HistoryError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": message })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(symbol: Option<&str>, interval: Option<&str>, limit: Option<&str>) -> HistoryQuery {
        HistoryQuery {
            symbol: symbol.map(Into::into),
            interval: interval.map(Into::into),
            start_time: None,
            end_time: None,
            limit: limit.map(Into::into),
        }
    }

    #[test]
    fn valid_query_normalizes_symbol() {
        let validated = validate_query(&query(Some("ethusdt"), Some("1h"), Some("100"))).unwrap();
        assert_eq!(validated.symbol, "ETHUSDT");
        assert_eq!(validated.interval, Interval::H1);
        assert_eq!(validated.limit, 100);
    }

    #[test]
    fn missing_symbol_is_rejected() {
        assert!(validate_query(&query(None, Some("1h"), None)).is_err());
        assert!(validate_query(&query(Some("  "), Some("1h"), None)).is_err());
    }

    #[test]
    fn bad_interval_is_rejected() {
        assert!(validate_query(&query(Some("BTCUSDT"), None, None)).is_err());
        assert!(validate_query(&query(Some("BTCUSDT"), Some("7m"), None)).is_err());
    }

    #[test]
    fn limit_bounds() {
        assert!(validate_query(&query(Some("BTCUSDT"), Some("1m"), Some("0"))).is_err());
        assert!(validate_query(&query(Some("BTCUSDT"), Some("1m"), Some("1001"))).is_err());
        assert!(validate_query(&query(Some("BTCUSDT"), Some("1m"), Some("abc"))).is_err());
        let validated = validate_query(&query(Some("BTCUSDT"), Some("1m"), None)).unwrap();
        assert_eq!(validated.limit, DEFAULT_LIMIT);
    }

    #[test]
    fn timestamps_must_parse() {
        let mut params = query(Some("BTCUSDT"), Some("1m"), None);
        params.start_time = Some("yesterday".into());
        assert!(validate_query(&params).is_err());

        params.start_time = Some("1700000000000".into());
        params.end_time = Some("1700000600000".into());
        let validated = validate_query(&params).unwrap();
        assert_eq!(validated.start_time, Some(1_700_000_000_000));
        assert_eq!(validated.end_time, Some(1_700_000_600_000));
    }

    #[test]
    fn history_row_drops_key_fields() {
        let row = Kline {
            symbol: "BTCUSDT".into(),
            interval: Interval::M1,
            open_time: 1,
            close_time: 2,
            open: "1".into(),
            high: "1".into(),
            low: "1".into(),
            close: "1".into(),
            volume: "1".into(),
            quote_volume: "1".into(),
            trades: 1,
            taker_buy_base_volume: "1".into(),
            taker_buy_quote_volume: "1".into(),
            is_closed: true,
        };
        let json = serde_json::to_value(HistoryRow::from(row)).unwrap();
        assert!(json.get("symbol").is_none());
        assert!(json.get("isClosed").is_none());
        assert_eq!(json["openTime"], 1);
        assert_eq!(json["closeTime"], 2);
    }

    #[test]
    fn error_status_mapping() {
        assert_eq!(
            history_status(&HistoryError::SymbolNotFound),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            history_status(&HistoryError::TooManyRequests),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            history_status(&HistoryError::UpstreamUnavailable("x".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            history_status(&HistoryError::Internal(anyhow::anyhow!("boom"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
