//! # ヘルスモニター
//!
//! ノードとディスクの稼働状態を定期プローブで追跡し、
//! 状態遷移をイベントとして購読者（ルーター・キャッシュエンジン）へ通知します。
//!
//! ## 状態遷移
//!
//! ```text
//!            失敗1回              連続失敗F回
//! Healthy ──────────→ Suspect ──────────────→ Unhealthy
//!    ↑                  │                         │
//!    └──── 成功1回 ─────┘                         │
//!    └──────────────── 連続成功S回 ───────────────┘
//! ```

mod monitor;

pub use monitor::{DiskProbe, HealthMonitor, NodeProbe, Probe};

use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

fn default_interval_ms() -> u64 { 2000 }
fn default_timeout_ms() -> u64 { 1000 }
fn default_failure_threshold() -> u32 { 3 }
fn default_success_threshold() -> u32 { 2 }

/// ヘルスチェック設定
#[derive(Deserialize, Clone, Debug)]
pub struct HealthConfig {
    /// プローブ間隔（ミリ秒）
    ///
    /// デフォルト: 2000
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// プローブのタイムアウト（ミリ秒）
    ///
    /// デフォルト: 1000
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Unhealthy へ遷移する連続失敗回数
    ///
    /// デフォルト: 3
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Unhealthy から復帰する連続成功回数
    ///
    /// デフォルト: 2
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            timeout_ms: default_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
        }
    }
}

/// 稼働状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HealthState {
    Healthy = 0,
    Suspect = 1,
    Unhealthy = 2,
}

impl HealthState {
    /// AtomicU8 から復元
    #[inline]
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => HealthState::Healthy,
            1 => HealthState::Suspect,
            _ => HealthState::Unhealthy,
        }
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// ルーティング・書き込み対象にできるか（Suspect は対象に含む）
    #[inline]
    pub fn is_available(self) -> bool {
        self != HealthState::Unhealthy
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Suspect => "suspect",
            HealthState::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// プローブ対象
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HealthTarget {
    /// ノードID
    Node(Arc<str>),
    /// ディスクID
    Disk(usize),
}

impl fmt::Display for HealthTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthTarget::Node(id) => write!(f, "node:{}", id),
            HealthTarget::Disk(id) => write!(f, "disk:{}", id),
        }
    }
}

/// 状態遷移イベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    pub target: HealthTarget,
    pub from: HealthState,
    pub to: HealthState,
}

/// 状態遷移の購読者
pub trait HealthSubscriber: Send + Sync {
    fn on_health_event(&self, event: &HealthEvent);
}

/// 1対象分の状態機械
#[derive(Debug, Clone)]
pub struct HealthTracker {
    state: HealthState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    failure_threshold: u32,
    success_threshold: u32,
}

impl HealthTracker {
    pub fn new(failure_threshold: u32, success_threshold: u32) -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
        }
    }

    pub fn from_config(config: &HealthConfig) -> Self {
        Self::new(config.failure_threshold, config.success_threshold)
    }

    #[inline]
    pub fn state(&self) -> HealthState {
        self.state
    }

    /// プローブ結果を記録
    ///
    /// 状態が変わった場合は `(from, to)` を返す
    pub fn record(&mut self, success: bool) -> Option<(HealthState, HealthState)> {
        let from = self.state;

        if success {
            self.consecutive_failures = 0;
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            self.state = match from {
                HealthState::Healthy | HealthState::Suspect => HealthState::Healthy,
                HealthState::Unhealthy if self.consecutive_successes >= self.success_threshold => {
                    HealthState::Healthy
                }
                HealthState::Unhealthy => HealthState::Unhealthy,
            };
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.state = if self.consecutive_failures >= self.failure_threshold {
                HealthState::Unhealthy
            } else {
                match from {
                    HealthState::Unhealthy => HealthState::Unhealthy,
                    _ => HealthState::Suspect,
                }
            };
        }

        (from != self.state).then_some((from, self.state))
    }
}
