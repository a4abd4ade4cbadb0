//! 币安公共行情流客户端
//!
//! U本位合约走 `<symbol>@kline_<interval>` 推送K线，现货走 `<symbol>@aggTrade`
//! 推送归集成交。每条流一个连接、一个读取任务；连接断开后任务结束，
//! 下一次 `open_stream`（订阅对账时）会重新建立。

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, instrument, warn};

use super::{FeedError, FeedSink, MarketTransport, StreamRequest};
use crate::market::models::{Market, OhlcvBucket, Trade};
use crate::market::timeframe::Timeframe;

const FUTURES_WS_BASE: &str = "wss://fstream.binance.com/ws";
const FUTURES_REST_KLINES: &str = "https://fapi.binance.com/fapi/v1/klines";
const SPOT_WS_BASE: &str = "wss://stream.binance.com:9443/ws";
const SPOT_REST_KLINES: &str = "https://api.binance.com/api/v3/klines";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Deserialize)]
struct KlineEvent {
    #[serde(rename = "k")]
    kline: KlinePayload,
}

#[derive(Deserialize)]
struct KlinePayload {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
}

#[derive(Deserialize)]
struct AggTradeEvent {
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T")]
    trade_time: i64,
}

struct StreamHandle {
    market: Market,
    task: JoinHandle<()>,
}

pub struct BinanceTransport {
    ws_base: String,
    rest_klines: String,
    http: reqwest::Client,
    streams: Mutex<HashMap<String, StreamHandle>>,
}

impl BinanceTransport {
    fn new(ws_base: &str, rest_klines: &str) -> Result<Self, FeedError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| FeedError::Exchange(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            ws_base: ws_base.to_string(),
            rest_klines: rest_klines.to_string(),
            http,
            streams: Mutex::new(HashMap::new()),
        })
    }

    /// 按交易所标识创建，只支持币安的合约与现货
    pub fn for_exchange(exchange: &str) -> Result<Self, FeedError> {
        match exchange {
            "binance_futures" => Self::new(FUTURES_WS_BASE, FUTURES_REST_KLINES),
            "binance_spot" => Self::new(SPOT_WS_BASE, SPOT_REST_KLINES),
            other => Err(FeedError::UnsupportedExchange(other.to_string())),
        }
    }
}

fn stream_name(market: &Market, request: StreamRequest) -> String {
    let symbol = format!("{}{}", market.asset, market.currency).to_lowercase();
    match request {
        StreamRequest::Ohlcv(tf) => format!("{}@kline_{}", symbol, tf.label()),
        StreamRequest::Trades => format!("{}@aggTrade", symbol),
    }
}

fn parse_f64(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok()
}

fn parse_kline(text: &str) -> Option<OhlcvBucket> {
    let event: KlineEvent = serde_json::from_str(text).ok()?;
    let k = event.kline;
    Some(OhlcvBucket {
        time: k.open_time,
        open: parse_f64(&k.open)?,
        high: parse_f64(&k.high)?,
        low: parse_f64(&k.low)?,
        close: parse_f64(&k.close)?,
        volume: parse_f64(&k.volume)?,
    })
}

fn parse_agg_trade(text: &str) -> Option<Trade> {
    let event: AggTradeEvent = serde_json::from_str(text).ok()?;
    Some(Trade {
        price: parse_f64(&event.price)?,
        amount: parse_f64(&event.quantity)?,
        timestamp: event.trade_time,
    })
}

/// REST K线数组: [open_time, "o", "h", "l", "c", "v", ...]
fn parse_rest_kline(row: &[Value]) -> Option<OhlcvBucket> {
    let num = |i: usize| row.get(i).and_then(|v| v.as_str()).and_then(parse_f64);
    Some(OhlcvBucket {
        time: row.first()?.as_i64()?,
        open: num(1)?,
        high: num(2)?,
        low: num(3)?,
        close: num(4)?,
        volume: num(5)?,
    })
}

fn classify_http(e: reqwest::Error) -> FeedError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        FeedError::Network(e.to_string())
    } else {
        FeedError::Exchange(e.to_string())
    }
}

#[instrument(target = "行情适配", skip(ws, sink), fields(stream = %name))]
async fn run_stream(mut ws: WsStream, name: String, market: Market, request: StreamRequest, sink: FeedSink) {
    let symbol = market.symbol();
    info!(target: "行情适配", "行情流已连接");

    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Text(text)) => match request {
                StreamRequest::Ohlcv(tf) => match parse_kline(&text) {
                    Some(bucket) => sink.push_ohlcv(&symbol, tf, bucket).await,
                    None => debug!(target: "行情适配", %text, "无法解析的K线消息"),
                },
                StreamRequest::Trades => match parse_agg_trade(&text) {
                    Some(trade) => sink.push_trade(&symbol, trade).await,
                    None => debug!(target: "行情适配", %text, "无法解析的成交消息"),
                },
            },
            Ok(Message::Ping(data)) => {
                if let Err(e) = ws.send(Message::Pong(data)).await {
                    warn!(target: "行情适配", error = %e, "发送Pong失败");
                    break;
                }
            }
            Ok(Message::Close(frame)) => {
                info!(target: "行情适配", ?frame, "收到关闭消息");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(target: "行情适配", error = %e, "行情流读取失败");
                break;
            }
        }
    }

    warn!(target: "行情适配", "行情流已断开，等待下一次对账重连");
}

#[async_trait]
impl MarketTransport for BinanceTransport {
    async fn open_stream(&self, market: &Market, request: StreamRequest, sink: FeedSink) -> Result<(), FeedError> {
        let name = stream_name(market, request);
        let mut streams = self.streams.lock().await;
        if matches!(streams.get(&name), Some(h) if !h.task.is_finished()) {
            return Ok(());
        }

        let url = format!("{}/{}", self.ws_base, name);
        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| FeedError::Network(format!("connect timeout: {}", name)))?
            .map_err(|e| FeedError::Network(e.to_string()))?;

        let task = tokio::spawn(run_stream(ws, name.clone(), market.clone(), request, sink));
        streams.insert(
            name,
            StreamHandle {
                market: market.clone(),
                task,
            },
        );
        Ok(())
    }

    async fn fetch_candle(&self, market: &Market, tf: Timeframe) -> Result<OhlcvBucket, FeedError> {
        let symbol = format!("{}{}", market.asset, market.currency);
        let response = self
            .http
            .get(&self.rest_klines)
            .query(&[("symbol", symbol.as_str()), ("interval", tf.label()), ("limit", "1")])
            .send()
            .await
            .map_err(classify_http)?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(FeedError::Network(format!("http status {}", status)));
        }
        if !status.is_success() {
            return Err(FeedError::Exchange(format!("http status {}", status)));
        }

        let rows: Vec<Vec<Value>> = response.json().await.map_err(classify_http)?;
        rows.last()
            .and_then(|row| parse_rest_kline(row))
            .ok_or_else(|| FeedError::Exchange(format!("empty kline response for {}", symbol)))
    }

    async fn close_market(&self, market: &Market) {
        let mut streams = self.streams.lock().await;
        streams.retain(|_, handle| {
            if &handle.market == market {
                handle.task.abort();
                false
            } else {
                true
            }
        });
    }

    async fn close_all(&self) {
        let mut streams = self.streams.lock().await;
        for (_, handle) in streams.drain() {
            handle.task.abort();
        }
        info!(target: "行情适配", "全部行情流已关闭");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_names() {
        let m = Market::new("binance_futures", "btc", "usdt");
        assert_eq!(stream_name(&m, StreamRequest::Ohlcv(Timeframe::H4)), "btcusdt@kline_4h");
        assert_eq!(stream_name(&m, StreamRequest::Trades), "btcusdt@aggTrade");
    }

    #[test]
    fn test_parse_stream_messages() {
        let kline = r#"{"e":"kline","E":1709251230000,"s":"BTCUSDT","k":{"t":1709251200000,"T":1709251499999,"s":"BTCUSDT","i":"5m","o":"61000.1","c":"61010.5","h":"61020.0","l":"60990.0","v":"12.5","x":false}}"#;
        let bucket = parse_kline(kline).expect("K线消息应能解析");
        assert_eq!(bucket.time, 1_709_251_200_000);
        assert_eq!(bucket.close, 61010.5);
        assert_eq!(bucket.volume, 12.5);

        let trade = r#"{"e":"aggTrade","E":1709251230001,"s":"BTCUSDT","a":1,"p":"61001.0","q":"0.25","f":1,"l":2,"T":1709251230000,"m":true}"#;
        let trade = parse_agg_trade(trade).expect("成交消息应能解析");
        assert_eq!(trade.price, 61001.0);
        assert_eq!(trade.amount, 0.25);
        assert_eq!(trade.timestamp, 1_709_251_230_000);

        assert!(parse_kline(r#"{"result":null,"id":1}"#).is_none());
    }

    #[test]
    fn test_parse_rest_kline_row() {
        let row: Vec<Value> = serde_json::from_str(
            r#"[1709251200000,"1.0","2.0","0.5","1.5","100.0",1709251499999,"150.0",10,"50.0","75.0","0"]"#,
        )
        .unwrap();
        let bucket = parse_rest_kline(&row).unwrap();
        assert_eq!((bucket.open, bucket.high, bucket.low, bucket.close), (1.0, 2.0, 0.5, 1.5));
    }

    #[test]
    fn test_unsupported_exchange() {
        assert!(matches!(
            BinanceTransport::for_exchange("kraken"),
            Err(FeedError::UnsupportedExchange(_))
        ));
    }
}
