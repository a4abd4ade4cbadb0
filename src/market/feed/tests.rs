use super::memory::MemoryTransport;
use super::*;

const T0: i64 = 1_709_251_200_000;

fn bucket(time: i64, close: f64) -> OhlcvBucket {
    OhlcvBucket {
        time,
        open: close,
        high: close,
        low: close,
        close,
        volume: 1.0,
    }
}

#[test]
fn test_feed_kind_selection() {
    assert_eq!(feed_kind_for("binance_futures"), Ok(FeedKind::PushOhlcv));
    for exchange in ["bitfinex", "kraken", "kucoin", "huobipro", "binance_spot"] {
        assert_eq!(feed_kind_for(exchange), Ok(FeedKind::TradeTick));
    }
    assert_eq!(
        feed_kind_for("mtgox"),
        Err(FeedError::UnsupportedExchange("mtgox".to_string()))
    );
    assert!(FeedError::Network("reset".into()).is_retryable());
    assert!(!FeedError::Exchange("bad symbol".into()).is_retryable());
}

#[test]
fn test_create_feed_rejects_unknown_exchange() {
    let transport = Arc::new(MemoryTransport::new());
    assert!(create_feed("unknown", transport.clone()).is_err());
    let feed = create_feed("kraken", transport).expect("kraken 应受支持");
    assert_eq!(feed.kind(), FeedKind::TradeTick);
    assert_eq!(feed.exchange(), "kraken");
}

#[tokio::test]
async fn test_sink_replaces_same_bucket_and_bounds_cache() {
    let sink = FeedSink::new();
    for k in 0..15 {
        sink.push_ohlcv("BTC/USDT", Timeframe::M5, bucket(T0 + k * 300_000, k as f64)).await;
    }
    sink.push_ohlcv("BTC/USDT", Timeframe::M5, bucket(T0 + 14 * 300_000, 99.0)).await;

    let cached = sink.ohlcv("BTC/USDT", Timeframe::M5).await;
    assert_eq!(cached.len(), OHLCV_CACHE_LEN);
    assert_eq!(cached.last().unwrap().close, 99.0);
    assert!(sink.ohlcv("BTC/USDT", Timeframe::H1).await.is_empty());
}

#[tokio::test]
async fn test_sink_trade_slice_is_half_open() {
    let sink = FeedSink::new();
    for ts in [T0, T0 + 500, T0 + 1_000, T0 + 1_500] {
        sink.push_trade("ETH/USD", Trade { amount: 1.0, price: 1.0, timestamp: ts }).await;
    }
    let slice = sink.trades_between("ETH/USD", T0 + 500, T0 + 1_500).await;
    let times: Vec<i64> = slice.iter().map(|t| t.timestamp).collect();
    assert_eq!(times, vec![T0 + 500, T0 + 1_000]);

    // 超过保留时长的成交被淘汰
    sink.push_trade("ETH/USD", Trade { amount: 1.0, price: 2.0, timestamp: T0 + 11 * 60_000 }).await;
    assert_eq!(sink.trades_between("ETH/USD", 0, i64::MAX).await.len(), 1);
}

#[tokio::test]
async fn test_trade_tick_feed_reads_published_trades() {
    let transport = Arc::new(MemoryTransport::new());
    let feed = TradeTickFeed::new("bitfinex", transport.clone());
    let m = Market::new("bitfinex", "BTC", "USD");

    assert!(matches!(feed.watch_ohlcv(&m, Timeframe::M5).await, Err(FeedError::Exchange(_))));
    feed.watch_trades(&m).await.expect("订阅成交应成功");
    assert!(transport.is_open(&m, StreamRequest::Trades).await);

    transport.publish_trade(&m, Trade { amount: 2.0, price: 10.0, timestamp: T0 + 100 }).await;
    let trades = feed.trades_between(&m, T0, T0 + 1_000).await;
    assert_eq!(trades.len(), 1);

    feed.unwatch(&m).await;
    assert!(!transport.is_open(&m, StreamRequest::Trades).await);
    assert!(feed.trades_between(&m, T0, T0 + 1_000).await.is_empty());
}

#[tokio::test]
async fn test_push_feed_current_candle_and_failures() {
    let transport = Arc::new(MemoryTransport::new());
    let feed = PushOhlcvFeed::new("binance_futures", transport.clone());
    let m = Market::new("binance_futures", "BTC", "USDT");

    transport.set_candle(&m, Timeframe::H1, bucket(T0, 42.0)).await;
    let candle = feed.get_current_candle(&m, Timeframe::H1).await.unwrap();
    assert_eq!(candle.close, 42.0);
    assert_eq!(candle.kind, CandleKind::Loaded);
    assert_eq!(candle.timeframe, Timeframe::H1);

    transport.fail_next([FeedError::Network("timeout".into())]).await;
    assert!(matches!(feed.watch_ohlcv(&m, Timeframe::M5).await, Err(FeedError::Network(_))));
    feed.watch_ohlcv(&m, Timeframe::M5).await.unwrap();
    transport.publish_ohlcv(&m, Timeframe::M5, bucket(T0, 7.0)).await;
    assert_eq!(feed.ohlcv_buckets(&m, Timeframe::M5).await.len(), 1);
    assert_eq!(transport.open_calls().await, 2);
}
