//! 多周期K线聚合核心
//!
//! 每个 品种×周期 维护一根进行中的K线（working candle）和一个已收盘K线的滚动窗口。
//! 数据来源有两种形态：交易所推送的OHLCV桶，或逐笔成交。两种形态最终都汇入
//! 同一个 `rollover`，它负责收盘、补齐空缺周期并播种下一根K线，且对时间幂等。
//!
//! 本结构体不做任何I/O，由调用方（协调器）持有并在每个节拍驱动。

use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace, warn};

use crate::market::models::{Candle, CandleKind, Market, OhlcvBucket, Trade};
use crate::market::timeframe::{self, Timeframe};
use crate::soft_assert;


/// 持久化去重键: 品种 + 周期 + 开盘时间
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CandleKey {
    pub market_id: String,
    pub timeframe: Timeframe,
    pub time: i64,
}

impl CandleKey {
    pub fn of(candle: &Candle) -> Self {
        Self {
            market_id: format!("{}.{}.{}", candle.exchange, candle.asset, candle.currency),
            timeframe: candle.timeframe,
            time: candle.time,
        }
    }
}

/// 已收盘K线的有界滚动窗口，按时间严格递增
#[derive(Debug, Clone)]
pub struct CandleWindow {
    capacity: usize,
    candles: VecDeque<Candle>,
}

impl CandleWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            candles: VecDeque::with_capacity(capacity),
        }
    }

    /// 追加一根K线。同一时间的K线会被替换，更早的K线被拒绝。
    pub fn push(&mut self, candle: Candle) -> bool {
        match self.candles.back() {
            Some(last) if candle.time < last.time => {
                warn!(
                    target: "K线聚合",
                    log_type = "assertion",
                    last_time = last.time,
                    candle_time = candle.time,
                    timeframe = %candle.timeframe,
                    "拒绝写入比窗口末尾更早的K线"
                );
                return false;
            }
            Some(last) if candle.time == last.time => {
                self.candles.pop_back();
            }
            _ => {}
        }
        self.candles.push_back(candle);
        while self.candles.len() > self.capacity {
            self.candles.pop_front();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candle> {
        self.candles.iter()
    }

    /// 开盘时间不晚于 `cutoff` 的全部K线
    pub fn until(&self, cutoff: i64) -> Vec<Candle> {
        self.candles.iter().filter(|c| c.time <= cutoff).cloned().collect()
    }
}

#[derive(Debug, Default)]
struct MarketCandles {
    working: HashMap<Timeframe, Candle>,
    windows: HashMap<Timeframe, CandleWindow>,
    last_tick: Option<f64>,
}

pub struct CandleAggregator {
    timeframes: Vec<Timeframe>,
    window_size: usize,
    markets: HashMap<Market, MarketCandles>,
    /// 待落库K线，同键覆盖
    to_save: HashMap<CandleKey, Candle>,
    /// 本节拍内收盘的K线，按产生顺序
    closed: Vec<Candle>,
    /// 上一次逐笔成交切片的截止时间
    last_trade_date: Option<i64>,
}

impl CandleAggregator {
    pub fn new(timeframes: Vec<Timeframe>, window_size: usize) -> Self {
        Self {
            timeframes,
            window_size,
            markets: HashMap::new(),
            to_save: HashMap::new(),
            closed: Vec::new(),
            last_trade_date: None,
        }
    }

    pub fn timeframes(&self) -> &[Timeframe] {
        &self.timeframes
    }

    pub fn add_market(&mut self, market: &Market) {
        self.markets.entry(market.clone()).or_default();
    }

    pub fn remove_market(&mut self, market: &Market) {
        self.markets.remove(market);
        let id = market.id();
        self.to_save.retain(|key, _| key.market_id != id);
    }

    pub fn markets(&self) -> Vec<Market> {
        self.markets.keys().cloned().collect()
    }

    pub fn has_market(&self, market: &Market) -> bool {
        self.markets.contains_key(market)
    }

    pub fn working(&self, market: &Market, tf: Timeframe) -> Option<&Candle> {
        self.markets.get(market).and_then(|m| m.working.get(&tf))
    }

    pub fn window(&self, market: &Market, tf: Timeframe) -> Option<&CandleWindow> {
        self.markets.get(market).and_then(|m| m.windows.get(&tf))
    }

    /// 策略输入：截止到 `cutoff`（含）的已收盘K线
    pub fn window_until(&self, market: &Market, tf: Timeframe, cutoff: i64) -> Vec<Candle> {
        self.window(market, tf).map(|w| w.until(cutoff)).unwrap_or_default()
    }

    pub fn last_tick(&self, market: &Market) -> Option<f64> {
        self.markets.get(market).and_then(|m| m.last_tick)
    }

    /// 用存储中的历史K线初始化窗口
    pub fn load_history(&mut self, market: &Market, tf: Timeframe, mut candles: Vec<Candle>) {
        candles.sort_by_key(|c| c.time);
        let mut window = CandleWindow::new(self.window_size);
        for mut candle in candles {
            candle.kind = CandleKind::Loaded;
            window.push(candle);
        }
        debug!(target: "K线聚合", market = %market, timeframe = %tf, loaded = window.len(), "历史K线已载入窗口");
        self.markets.entry(market.clone()).or_default().windows.insert(tf, window);
    }

    /// 安装从交易所获取的当前K线，只接受不早于现有K线的数据
    pub fn seed_working(&mut self, candle: Candle) {
        let market = candle.market();
        let entry = self.markets.entry(market).or_default();
        match entry.working.get(&candle.timeframe) {
            Some(existing) if existing.time > candle.time => {
                trace!(target: "K线聚合", existing = existing.time, seed = candle.time, "忽略过期的种子K线");
            }
            _ => {
                entry.working.insert(candle.timeframe, candle);
            }
        }
    }

    /// 逐笔成交的本次切片区间 [from, to)
    pub fn trade_slice(&mut self, date: i64, default_lookback_ms: i64) -> (i64, i64) {
        let from = self.last_trade_date.unwrap_or(date - default_lookback_ms);
        self.last_trade_date = Some(date);
        (from, date)
    }

    /// 推送OHLCV形态：用交易所缓存的桶刷新或切换一个周期
    ///
    /// `buckets` 为该品种该周期在交易所缓存中的K线桶，任意顺序。
    pub fn apply_ohlcv(&mut self, market: &Market, date: i64, tf: Timeframe, buckets: &[OhlcvBucket]) {
        let boundary = timeframe::floor(date, tf);
        let current = buckets.iter().find(|b| b.time == boundary).copied();

        let working_time = self.working(market, tf).map(|c| c.time);
        match (working_time, current) {
            (None, _) => {
                // 首次：从不晚于当前边界的最新桶播种
                let seed = buckets
                    .iter()
                    .filter(|b| b.time <= boundary && timeframe::floor(b.time, tf) == b.time)
                    .max_by_key(|b| b.time);
                if let Some(bucket) = seed {
                    let candle = Candle::from_bucket(market, tf, bucket, CandleKind::Loaded);
                    self.markets.entry(market.clone()).or_default().working.insert(tf, candle);
                }
            }
            (Some(time), Some(bucket)) if bucket.time > time => {
                self.rollover(market, tf, bucket.time, buckets);
            }
            (Some(time), Some(bucket)) if bucket.time == time => {
                if let Some(w) = self.working_mut(market, tf) {
                    w.refresh_from(&bucket);
                }
            }
            _ => {}
        }

        if tf == self.tick_timeframe() {
            if let Some(close) = self.working(market, tf).map(|c| c.close) {
                self.update_last_tick(market, close);
            }
        }
    }

    /// 逐笔成交形态：把 [from, to) 内的成交折叠进所有周期
    pub fn apply_trades(&mut self, market: &Market, date: i64, trades: &[Trade]) {
        let mut batch: Vec<Trade> = trades.iter().filter(|t| t.timestamp < date).copied().collect();
        batch.sort_by_key(|t| t.timestamp);

        for tf in self.timeframes.clone() {
            for trade in &batch {
                let bucket = timeframe::floor(trade.timestamp, tf);
                let working_time = self.working(market, tf).map(|c| c.time);
                match working_time {
                    None => {
                        let mut seed = Candle::flat(market, tf, bucket, trade.price);
                        seed.kind = CandleKind::Created;
                        self.markets.entry(market.clone()).or_default().working.insert(tf, seed);
                    }
                    Some(time) if bucket > time => self.rollover(market, tf, bucket, &[]),
                    Some(time) if bucket < time => {
                        trace!(target: "K线聚合", market = %market, timeframe = %tf, bucket, working = time, "忽略陈旧成交");
                        continue;
                    }
                    _ => {}
                }
                if let Some(w) = self.working_mut(market, tf) {
                    fold_trade(w, trade);
                }
            }

            let boundary = timeframe::floor(date, tf);
            if matches!(self.working(market, tf), Some(w) if boundary > w.time) {
                self.rollover(market, tf, boundary, &[]);
            }
        }

        if let Some(last) = batch.last() {
            self.update_last_tick(market, last.price);
        }
    }

    /// 强制收盘：对 `date` 处到期（或因漏拍而过期）的所有周期执行切换
    pub fn close_due(&mut self, date: i64) {
        let due = timeframe::boundaries_at(date);
        let markets: Vec<Market> = self.markets.keys().cloned().collect();
        for tf in self.timeframes.clone() {
            let boundary = timeframe::floor(date, tf);
            for market in &markets {
                let Some(time) = self.working(market, tf).map(|c| c.time) else {
                    continue;
                };
                if boundary <= time {
                    continue;
                }
                if !due.contains(&tf) {
                    warn!(target: "K线聚合", market = %market, timeframe = %tf, working = time, date, "补齐错过的周期边界");
                }
                self.rollover(market, tf, boundary, &[]);
            }
        }
    }

    /// 行情变化时把进行中的K线放入落库队列
    pub fn queue_working(&mut self, market: &Market) {
        let Some(entry) = self.markets.get(market) else {
            return;
        };
        let candles: Vec<Candle> = entry.working.values().cloned().collect();
        for candle in candles {
            self.to_save.insert(CandleKey::of(&candle), candle);
        }
    }

    /// 取出本节拍收盘的K线
    pub fn take_closed(&mut self) -> Vec<Candle> {
        std::mem::take(&mut self.closed)
    }

    /// 取出全部待落库K线，按时间排序
    pub fn drain_pending(&mut self) -> Vec<Candle> {
        let mut pending: Vec<Candle> = self.to_save.drain().map(|(_, c)| c).collect();
        pending.sort_by(|a, b| a.time.cmp(&b.time).then(a.timeframe.cmp(&b.timeframe)));
        pending
    }

    pub fn pending_len(&self) -> usize {
        self.to_save.len()
    }

    /// 核心K线切换函数，终结当前K线、填充空缺周期并播种 `new_time` 的K线。
    ///
    /// 对时间幂等：`new_time` 不晚于当前K线时直接返回。`buckets` 为空时
    /// 空缺周期与新K线均以前收盘价平播种。
    fn rollover(&mut self, market: &Market, tf: Timeframe, new_time: i64, buckets: &[OhlcvBucket]) {
        let Some(mut current) = self.working(market, tf).cloned() else {
            return;
        };
        if new_time <= current.time {
            return;
        }

        if let Some(own) = buckets.iter().find(|b| b.time == current.time) {
            current.refresh_from(own);
        }

        loop {
            let next_time = current.time + tf.ms();
            let last_close = current.close;
            self.close_candle(current);

            let bucket = buckets.iter().find(|b| b.time == next_time);
            let next = match bucket {
                Some(b) => Candle::from_bucket(market, tf, b, CandleKind::Created),
                None => Candle::flat(market, tf, next_time, last_close),
            };

            if next_time >= new_time {
                trace!(target: "K线聚合", market = %market, timeframe = %tf, open_time = next_time, "播种新K线");
                self.markets.entry(market.clone()).or_default().working.insert(tf, next);
                break;
            }
            current = next;
        }
    }

    fn close_candle(&mut self, mut candle: Candle) {
        candle.finalize_kind();

        soft_assert!(
            candle.high >= candle.low && candle.high >= candle.close && candle.low <= candle.close,
            message = "K线数据完整性检查失败",
            time = candle.time,
            timeframe = candle.timeframe.minutes(),
        );

        let market = candle.market();
        let window_size = self.window_size;
        let entry = self.markets.entry(market).or_default();
        let accepted = entry
            .windows
            .entry(candle.timeframe)
            .or_insert_with(|| CandleWindow::new(window_size))
            .push(candle.clone());

        if accepted {
            trace!(
                target: "K线聚合",
                log_type = "candle_closed",
                asset = %candle.asset,
                currency = %candle.currency,
                timeframe = %candle.timeframe,
                time = candle.time,
                kind = candle.kind.as_str(),
                "K线收盘"
            );
            self.to_save.insert(CandleKey::of(&candle), candle.clone());
            self.closed.push(candle);
        }
    }

    fn working_mut(&mut self, market: &Market, tf: Timeframe) -> Option<&mut Candle> {
        self.markets.get_mut(market).and_then(|m| m.working.get_mut(&tf))
    }

    /// 最长周期的收盘价即为最新价
    fn tick_timeframe(&self) -> Timeframe {
        self.timeframes.iter().copied().max().unwrap_or(Timeframe::D1)
    }

    fn update_last_tick(&mut self, market: &Market, price: f64) {
        let changed = {
            let entry = self.markets.entry(market.clone()).or_default();
            let changed = entry.last_tick != Some(price);
            entry.last_tick = Some(price);
            changed
        };
        if changed {
            self.queue_working(market);
        }
    }
}

fn fold_trade(candle: &mut Candle, trade: &Trade) {
    if candle.volume == 0.0 {
        candle.open = trade.price;
        candle.high = trade.price;
        candle.low = trade.price;
    } else {
        candle.high = candle.high.max(trade.price);
        candle.low = candle.low.min(trade.price);
    }
    candle.close = trade.price;
    candle.volume += trade.amount;
    candle.kind = CandleKind::Created;
}
