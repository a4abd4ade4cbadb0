use serde::{Deserialize, Serialize};
use std::fmt;

use crate::market::timeframe::{self, Timeframe};

/// 一个交易所上的一个交易对
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Market {
    pub exchange: String,
    pub asset: String,
    pub currency: String,
}

impl Market {
    pub fn new(exchange: &str, asset: &str, currency: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            asset: asset.to_uppercase(),
            currency: currency.to_uppercase(),
        }
    }

    /// 订阅记录的主键: exchange.ASSET.CURRENCY
    pub fn id(&self) -> String {
        format!("{}.{}.{}", self.exchange, self.asset, self.currency)
    }

    /// 交易对符号: ASSET/CURRENCY
    pub fn symbol(&self) -> String {
        format!("{}/{}", self.asset, self.currency)
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.exchange, self.asset, self.currency)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandleKind {
    /// 有成交量的实时K线
    Created,
    /// 从存储或交易所加载
    Loaded,
    /// 无成交，沿用前收盘价
    Previous,
}

impl CandleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CandleKind::Created => "created",
            CandleKind::Loaded => "loaded",
            CandleKind::Previous => "previous",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(CandleKind::Created),
            "loaded" => Some(CandleKind::Loaded),
            "previous" => Some(CandleKind::Previous),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub exchange: String,
    pub asset: String,
    pub currency: String,
    pub timeframe: Timeframe,
    /// 开盘时间（毫秒），总是周期对齐
    pub time: i64,
    pub timestamp: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub kind: CandleKind,
}

impl Candle {
    /// 以前收盘价构造的平K线
    pub fn flat(market: &Market, timeframe: Timeframe, time: i64, price: f64) -> Self {
        Self {
            exchange: market.exchange.clone(),
            asset: market.asset.clone(),
            currency: market.currency.clone(),
            timeframe,
            time,
            timestamp: timeframe::iso(time),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
            kind: CandleKind::Previous,
        }
    }

    pub fn from_bucket(market: &Market, timeframe: Timeframe, bucket: &OhlcvBucket, kind: CandleKind) -> Self {
        Self {
            exchange: market.exchange.clone(),
            asset: market.asset.clone(),
            currency: market.currency.clone(),
            timeframe,
            time: bucket.time,
            timestamp: timeframe::iso(bucket.time),
            open: bucket.open,
            high: bucket.high,
            low: bucket.low,
            close: bucket.close,
            volume: bucket.volume,
            kind,
        }
    }

    pub fn market(&self) -> Market {
        Market {
            exchange: self.exchange.clone(),
            asset: self.asset.clone(),
            currency: self.currency.clone(),
        }
    }

    /// 用交易所的K线桶刷新 OHLCV
    pub fn refresh_from(&mut self, bucket: &OhlcvBucket) {
        self.open = bucket.open;
        self.high = bucket.high;
        self.low = bucket.low;
        self.close = bucket.close;
        self.volume = bucket.volume;
    }

    /// 收盘时确定类型：有量为 created，否则 previous
    pub fn finalize_kind(&mut self) {
        self.kind = if self.volume > 0.0 {
            CandleKind::Created
        } else {
            CandleKind::Previous
        };
    }
}

/// 交易所推送的OHLCV桶
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OhlcvBucket {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// 逐笔成交
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// 基础货币数量
    pub amount: f64,
    pub price: f64,
    pub timestamp: i64,
}
