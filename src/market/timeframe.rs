//! 周期边界对齐计算
//!
//! 所有时间均为 UTC 毫秒时间戳。支持的周期固定为
//! 5/15/30 分钟、1/2/4/8/12 小时与 1 天，均能整除一天，
//! 因此"分钟数 mod 周期"与"小时数 mod 周期小时"的日历对齐
//! 与按周期毫秒数取模完全等价。

use chrono::{SecondsFormat, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MINUTE_MS: i64 = 60_000;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;
pub const DAY_MS: i64 = 24 * HOUR_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum Timeframe {
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H8,
    H12,
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 9] = [
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H2,
        Timeframe::H4,
        Timeframe::H8,
        Timeframe::H12,
        Timeframe::D1,
    ];

    pub fn minutes(self) -> u32 {
        match self {
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::M30 => 30,
            Timeframe::H1 => 60,
            Timeframe::H2 => 120,
            Timeframe::H4 => 240,
            Timeframe::H8 => 480,
            Timeframe::H12 => 720,
            Timeframe::D1 => 1440,
        }
    }

    pub fn ms(self) -> i64 {
        self.minutes() as i64 * MINUTE_MS
    }

    /// 交易所通用的周期字符串
    pub fn label(self) -> &'static str {
        match self {
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::H8 => "8h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1d",
        }
    }

    pub fn from_minutes(minutes: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|tf| tf.minutes() == minutes)
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|tf| tf.label() == label)
    }
}

impl From<Timeframe> for u32 {
    fn from(tf: Timeframe) -> u32 {
        tf.minutes()
    }
}

impl TryFrom<u32> for Timeframe {
    type Error = String;

    fn try_from(minutes: u32) -> Result<Self, Self::Error> {
        Timeframe::from_minutes(minutes).ok_or_else(|| format!("unsupported timeframe: {}", minutes))
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// 不晚于 `t` 的最近一个周期边界
pub fn floor(t: i64, tf: Timeframe) -> i64 {
    t.div_euclid(tf.ms()) * tf.ms()
}

/// 不早于 `t` 的最近一个周期边界
pub fn ceil(t: i64, tf: Timeframe) -> i64 {
    let start = floor(t, tf);
    if start == t {
        t
    } else {
        start + tf.ms()
    }
}

/// 上一根已收盘K线的开盘时间
pub fn prev_since(t: i64, tf: Timeframe) -> i64 {
    floor(t, tf) - tf.ms()
}

/// 恰好在 `t` 处收盘的全部周期，升序
///
/// `t` 必须落在整分钟上，否则返回空。
pub fn boundaries_at(t: i64) -> Vec<Timeframe> {
    if t.rem_euclid(MINUTE_MS) != 0 {
        return Vec::new();
    }
    let Some(date) = Utc.timestamp_millis_opt(t).single() else {
        return Vec::new();
    };
    let (hour, minute) = (date.hour(), date.minute());

    Timeframe::ALL
        .iter()
        .copied()
        .filter(|tf| {
            let m = tf.minutes();
            if m < 60 {
                minute % m == 0
            } else if m < 1440 {
                minute == 0 && hour % (m / 60) == 0
            } else {
                minute == 0 && hour == 0
            }
        })
        .collect()
}

/// 毫秒时间戳转 RFC3339 字符串
pub fn iso(t: i64) -> String {
    Utc.timestamp_millis_opt(t)
        .single()
        .map(|d| d.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-03-01T00:00:00Z
    const DAY_START: i64 = 1_709_251_200_000;

    #[test]
    fn test_floor_ceil_agree_on_aligned() {
        for tf in Timeframe::ALL {
            for k in 0..50 {
                let t = DAY_START + k * tf.ms();
                assert_eq!(floor(t, tf), t, "对齐时间 floor 应不变: {}", tf);
                assert_eq!(ceil(t, tf), t, "对齐时间 ceil 应不变: {}", tf);
            }
            let t = DAY_START + 7 * MINUTE_MS + 13_000;
            let up = ceil(t, tf);
            assert_eq!(floor(up, tf), up);
            assert!(up > t && up - t <= tf.ms());
            assert!(floor(t, tf) <= t);
        }
    }

    #[test]
    fn test_floor_mid_candle() {
        let t = DAY_START + 3 * HOUR_MS + 17 * MINUTE_MS + 42_000;
        assert_eq!(floor(t, Timeframe::M5), DAY_START + 3 * HOUR_MS + 15 * MINUTE_MS);
        assert_eq!(floor(t, Timeframe::M30), DAY_START + 3 * HOUR_MS);
        assert_eq!(floor(t, Timeframe::H2), DAY_START + 2 * HOUR_MS);
        assert_eq!(floor(t, Timeframe::H4), DAY_START);
        assert_eq!(floor(t, Timeframe::D1), DAY_START);
        assert_eq!(prev_since(t, Timeframe::M5), DAY_START + 3 * HOUR_MS + 10 * MINUTE_MS);
    }

    #[test]
    fn test_boundaries_at_full_coincident_set() {
        assert_eq!(boundaries_at(DAY_START), Timeframe::ALL.to_vec());

        let t = DAY_START + 8 * HOUR_MS;
        assert_eq!(
            boundaries_at(t),
            vec![
                Timeframe::M5,
                Timeframe::M15,
                Timeframe::M30,
                Timeframe::H1,
                Timeframe::H2,
                Timeframe::H4,
                Timeframe::H8
            ]
        );

        let t = DAY_START + HOUR_MS + 45 * MINUTE_MS;
        assert_eq!(boundaries_at(t), vec![Timeframe::M5, Timeframe::M15]);

        assert!(boundaries_at(DAY_START + 7 * MINUTE_MS).is_empty());
        assert!(boundaries_at(DAY_START + 5 * MINUTE_MS + 1).is_empty());
    }

    #[test]
    fn test_boundaries_match_floor() {
        // 日历规则与取模规则逐分钟一致
        for k in 0..(2 * 24 * 60) {
            let t = DAY_START + k * MINUTE_MS;
            let expected: Vec<_> = Timeframe::ALL.iter().copied().filter(|tf| floor(t, *tf) == t).collect();
            assert_eq!(boundaries_at(t), expected, "t = {}", iso(t));
        }
    }

    #[test]
    fn test_labels_round_trip() {
        for tf in Timeframe::ALL {
            assert_eq!(Timeframe::from_label(tf.label()), Some(tf));
            assert_eq!(Timeframe::from_minutes(tf.minutes()), Some(tf));
        }
        assert_eq!(Timeframe::from_minutes(1), None);
        assert_eq!(serde_json::to_string(&Timeframe::H4).unwrap(), "240");
        assert_eq!(serde_json::from_str::<Timeframe>("1440").unwrap(), Timeframe::D1);
        assert!(serde_json::from_str::<Timeframe>("7").is_err());
    }

    #[test]
    fn test_iso() {
        assert_eq!(iso(DAY_START), "2024-03-01T00:00:00.000Z");
    }
}
