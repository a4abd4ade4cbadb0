//! 持久化层
//!
//! `Store` 是协调器看到的全部持久化接口；`SqliteStore` 基于 r2d2 连接池，
//! 所有阻塞的 SQLite 调用都放进 `spawn_blocking`，并带上调用方的 span。

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;
use tokio::task;
use tracing::{debug, info};

use crate::common::{AppError, Result};
use crate::exwatcher::{Subscription, SubscriptionStatus};
use crate::market::models::{Candle, CandleKind, Market};
use crate::market::timeframe::Timeframe;
use crate::robot::models::{RobotPosition, RobotState, RobotStatus, SignalRecord};

pub type DbPool = Pool<SqliteConnectionManager>;

#[async_trait]
pub trait Store: Send + Sync {
    /// 按 (exchange, asset, currency, timeframe, time) 覆盖写入
    async fn upsert_candles(&self, candles: &[Candle]) -> Result<usize>;

    /// 时间不晚于 `until` 的最近 `limit` 根K线，按时间升序返回
    async fn load_candles(&self, market: &Market, tf: Timeframe, until: i64, limit: usize) -> Result<Vec<Candle>>;

    async fn upsert_subscription(&self, subscription: &Subscription) -> Result<()>;

    async fn load_subscriptions(&self, exchange: &str) -> Result<Vec<Subscription>>;

    async fn delete_subscription(&self, id: &str) -> Result<()>;

    /// 按 (robot_id, code) 覆盖写入
    async fn upsert_positions(&self, positions: &[RobotPosition]) -> Result<()>;

    /// 按信号 id 写入，重复写入忽略
    async fn save_signals(&self, signals: &[SignalRecord]) -> Result<()>;

    /// 机器人的全部信号，按K线时间升序
    async fn load_signals(&self, robot_id: &str) -> Result<Vec<SignalRecord>>;

    async fn save_robot_state(&self, state: &RobotState) -> Result<()>;

    async fn load_robot_state(&self, robot_id: &str) -> Result<Option<RobotState>>;

    /// 某个品种上状态为 started 的全部机器人
    async fn load_started_robots(&self, market: &Market) -> Result<Vec<RobotState>>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS candles (
    exchange  TEXT    NOT NULL,
    asset     TEXT    NOT NULL,
    currency  TEXT    NOT NULL,
    timeframe INTEGER NOT NULL,
    time      INTEGER NOT NULL,
    timestamp TEXT    NOT NULL,
    open      REAL    NOT NULL,
    high      REAL    NOT NULL,
    low       REAL    NOT NULL,
    close     REAL    NOT NULL,
    volume    REAL    NOT NULL,
    kind      TEXT    NOT NULL,
    PRIMARY KEY (exchange, asset, currency, timeframe, time)
);
CREATE TABLE IF NOT EXISTS exwatchers (
    id                TEXT PRIMARY KEY,
    exchange          TEXT NOT NULL,
    asset             TEXT NOT NULL,
    currency          TEXT NOT NULL,
    status            TEXT NOT NULL,
    importer_id       TEXT,
    import_started_at INTEGER,
    last_error        TEXT
);
CREATE TABLE IF NOT EXISTS robot_positions (
    id       TEXT    NOT NULL,
    robot_id TEXT    NOT NULL,
    code     TEXT    NOT NULL,
    status   TEXT    NOT NULL,
    payload  TEXT    NOT NULL,
    PRIMARY KEY (robot_id, code)
);
CREATE TABLE IF NOT EXISTS robot_signals (
    id          TEXT PRIMARY KEY,
    robot_id    TEXT    NOT NULL,
    type        TEXT    NOT NULL,
    action      TEXT    NOT NULL,
    order_type  TEXT    NOT NULL,
    price       REAL    NOT NULL,
    candle_time INTEGER NOT NULL,
    position_id TEXT    NOT NULL,
    payload     TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS robot_signals_robot_idx ON robot_signals (robot_id, candle_time);
CREATE TABLE IF NOT EXISTS robots (
    id        TEXT PRIMARY KEY,
    exchange  TEXT NOT NULL,
    asset     TEXT NOT NULL,
    currency  TEXT NOT NULL,
    timeframe INTEGER NOT NULL,
    status    TEXT NOT NULL,
    state     TEXT NOT NULL
);
";

pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    /// 打开（或创建）数据库文件
    pub fn open(db_path: &str, pool_size: u32) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )
        });
        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_timeout(Duration::from_secs(10))
            .build(manager)
            .map_err(|e| AppError::DatabaseError(format!("创建连接池失败: {}", e)))?;

        let store = Self { pool };
        store.init_schema()?;
        info!(target: "持久化", log_type = "low_freq", db_path, pool_size, "数据库已打开");
        Ok(store)
    }

    /// 单连接的内存数据库，测试使用
    pub fn in_memory() -> Result<Self> {
        let pool = Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())
            .map_err(|e| AppError::DatabaseError(format!("创建内存连接池失败: {}", e)))?;
        let store = Self { pool };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("获取数据库连接失败: {}", e)))?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// 在阻塞线程池上执行一段数据库操作，保留调用方的 span
    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        let parent_span = tracing::Span::current();
        task::spawn_blocking(move || {
            parent_span.in_scope(|| {
                let mut conn = pool
                    .get()
                    .map_err(|e| AppError::DatabaseError(format!("获取数据库连接失败: {}", e)))?;
                op(&mut conn)
            })
        })
        .await
        .map_err(|e| AppError::DatabaseError(format!("数据库任务执行失败: {}", e)))?
    }
}

fn subscription_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Subscription, String)> {
    let status: String = row.get(4)?;
    Ok((
        Subscription {
            id: row.get(0)?,
            exchange: row.get(1)?,
            asset: row.get(2)?,
            currency: row.get(3)?,
            status: SubscriptionStatus::Pending,
            importer_id: row.get(5)?,
            import_started_at: row.get(6)?,
            last_error: row.get(7)?,
        },
        status,
    ))
}

fn decode_state(raw: &str) -> Result<RobotState> {
    Ok(serde_json::from_str(raw)?)
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_candles(&self, candles: &[Candle]) -> Result<usize> {
        if candles.is_empty() {
            return Ok(0);
        }
        let candles = candles.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO candles (exchange, asset, currency, timeframe, time, timestamp, open, high, low, close, volume, kind)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     ON CONFLICT(exchange, asset, currency, timeframe, time) DO UPDATE SET
                        open = excluded.open, high = excluded.high, low = excluded.low,
                        close = excluded.close, volume = excluded.volume, kind = excluded.kind",
                )?;
                for c in &candles {
                    stmt.execute(params![
                        c.exchange,
                        c.asset,
                        c.currency,
                        c.timeframe.minutes(),
                        c.time,
                        c.timestamp,
                        c.open,
                        c.high,
                        c.low,
                        c.close,
                        c.volume,
                        c.kind.as_str(),
                    ])?;
                }
            }
            tx.commit()?;
            debug!(target: "持久化", count = candles.len(), "K线已写入");
            Ok(candles.len())
        })
        .await
    }

    async fn load_candles(&self, market: &Market, tf: Timeframe, until: i64, limit: usize) -> Result<Vec<Candle>> {
        let market = market.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT time, timestamp, open, high, low, close, volume, kind FROM candles
                 WHERE exchange = ?1 AND asset = ?2 AND currency = ?3 AND timeframe = ?4 AND time <= ?5
                 ORDER BY time DESC LIMIT ?6",
            )?;
            let rows = stmt.query_map(
                params![market.exchange, market.asset, market.currency, tf.minutes(), until, limit as i64],
                |row| {
                    let kind: String = row.get(7)?;
                    Ok(Candle {
                        exchange: market.exchange.clone(),
                        asset: market.asset.clone(),
                        currency: market.currency.clone(),
                        timeframe: tf,
                        time: row.get(0)?,
                        timestamp: row.get(1)?,
                        open: row.get(2)?,
                        high: row.get(3)?,
                        low: row.get(4)?,
                        close: row.get(5)?,
                        volume: row.get(6)?,
                        kind: CandleKind::parse(&kind).unwrap_or(CandleKind::Loaded),
                    })
                },
            )?;
            let mut candles = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            candles.reverse();
            Ok(candles)
        })
        .await
    }

    async fn upsert_subscription(&self, subscription: &Subscription) -> Result<()> {
        let s = subscription.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO exwatchers (id, exchange, asset, currency, status, importer_id, import_started_at, last_error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status, importer_id = excluded.importer_id,
                    import_started_at = excluded.import_started_at, last_error = excluded.last_error",
                params![
                    s.id,
                    s.exchange,
                    s.asset,
                    s.currency,
                    s.status.as_str(),
                    s.importer_id,
                    s.import_started_at,
                    s.last_error,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_subscriptions(&self, exchange: &str) -> Result<Vec<Subscription>> {
        let exchange = exchange.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, exchange, asset, currency, status, importer_id, import_started_at, last_error
                 FROM exwatchers WHERE exchange = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![exchange], subscription_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|(mut s, status)| {
                    s.status = SubscriptionStatus::parse(&status)
                        .ok_or_else(|| AppError::DataError(format!("未知的订阅状态: {}", status)))?;
                    Ok(s)
                })
                .collect()
        })
        .await
    }

    async fn delete_subscription(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM exwatchers WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    async fn upsert_positions(&self, positions: &[RobotPosition]) -> Result<()> {
        if positions.is_empty() {
            return Ok(());
        }
        let encoded = positions
            .iter()
            .map(|p| -> Result<(String, String, String, &'static str, String)> {
                Ok((p.id.clone(), p.robot_id.clone(), p.code.clone(), p.status.as_str(), serde_json::to_string(p)?))
            })
            .collect::<Result<Vec<_>>>()?;
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO robot_positions (id, robot_id, code, status, payload) VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(robot_id, code) DO UPDATE SET
                        id = excluded.id, status = excluded.status, payload = excluded.payload",
                )?;
                for (id, robot_id, code, status, payload) in &encoded {
                    stmt.execute(params![id, robot_id, code, status, payload])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn save_signals(&self, signals: &[SignalRecord]) -> Result<()> {
        if signals.is_empty() {
            return Ok(());
        }
        let encoded = signals
            .iter()
            .map(|r| -> Result<(SignalRecord, String)> { Ok((r.clone(), serde_json::to_string(r)?)) })
            .collect::<Result<Vec<_>>>()?;
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO robot_signals (id, robot_id, type, action, order_type, price, candle_time, position_id, payload)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(id) DO NOTHING",
                )?;
                for (record, payload) in &encoded {
                    let s = &record.signal;
                    stmt.execute(params![
                        s.id,
                        s.robot_id,
                        record.kind.as_str(),
                        s.action.as_str(),
                        s.order_type.as_str(),
                        s.price,
                        s.candle_time,
                        s.position_id,
                        payload,
                    ])?;
                }
            }
            tx.commit()?;
            debug!(target: "持久化", count = encoded.len(), "信号已写入");
            Ok(())
        })
        .await
    }

    async fn load_signals(&self, robot_id: &str) -> Result<Vec<SignalRecord>> {
        let robot_id = robot_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT payload FROM robot_signals WHERE robot_id = ?1 ORDER BY candle_time, rowid",
            )?;
            let raws = stmt
                .query_map(params![robot_id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            raws.iter().map(|raw| Ok(serde_json::from_str(raw)?)).collect()
        })
        .await
    }

    async fn save_robot_state(&self, state: &RobotState) -> Result<()> {
        let payload = serde_json::to_string(state)?;
        let (id, exchange, asset, currency) =
            (state.id.clone(), state.exchange.clone(), state.asset.clone(), state.currency.clone());
        let (timeframe, status) = (state.timeframe.minutes(), state.status.as_str());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO robots (id, exchange, asset, currency, timeframe, status, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET status = excluded.status, state = excluded.state",
                params![id, exchange, asset, currency, timeframe, status, payload],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_robot_state(&self, robot_id: &str) -> Result<Option<RobotState>> {
        let robot_id = robot_id.to_string();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row("SELECT state FROM robots WHERE id = ?1", params![robot_id], |row| row.get(0))
                .optional()?;
            raw.as_deref().map(decode_state).transpose()
        })
        .await
    }

    async fn load_started_robots(&self, market: &Market) -> Result<Vec<RobotState>> {
        let market = market.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT state FROM robots
                 WHERE exchange = ?1 AND asset = ?2 AND currency = ?3 AND status = ?4
                 ORDER BY id",
            )?;
            let raws = stmt
                .query_map(
                    params![market.exchange, market.asset, market.currency, RobotStatus::Started.as_str()],
                    |row| row.get::<_, String>(0),
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            raws.iter().map(|raw| decode_state(raw)).collect()
        })
        .await
    }
}
