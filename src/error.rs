//! # エラー定義
//!
//! ルーティング・キャッシュ・オリジン通信の各経路で発生するエラー型を提供します。
//!
//! | エラー | クライアントへの応答 |
//! |--------|----------------------|
//! | `NoHealthyNode` | 503 Service Unavailable |
//! | `OriginUnreachable` | 502 Bad Gateway |
//! | `OriginTimeout` | 504 Gateway Timeout |
//! | `InsufficientSpace` | （ログのみ、レスポンスはそのまま返す） |
//! | `CorruptEntry` | （ミス扱いで再取得） |

use std::fmt;
use std::io;

/// キャッシュ経路のエラー
#[derive(Debug)]
pub enum CacheError {
    /// 正常なノードが見つからない
    NoHealthyNode,
    /// オリジンへの接続失敗、または不正なレスポンス
    OriginUnreachable(String),
    /// オリジンフェッチのタイムアウト
    OriginTimeout,
    /// ディスク容量不足（エビクション後も空きが足りない）
    InsufficientSpace {
        needed: u64,
        available: u64,
    },
    /// メタデータとボディの不整合
    CorruptEntry(String),
    /// 待機者が全員離脱したためフェッチを中止
    Cancelled,
    /// I/O エラー
    Io(io::Error),
}

impl CacheError {
    /// クライアントに返すステータスコード
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NoHealthyNode => 503,
            Self::OriginTimeout => 504,
            Self::OriginUnreachable(_)
            | Self::InsufficientSpace { .. }
            | Self::CorruptEntry(_)
            | Self::Cancelled
            | Self::Io(_) => 502,
        }
    }

    /// ストレージ側のエラーか（キャッシュをスキップして継続できる）
    #[inline]
    pub fn is_storage_error(&self) -> bool {
        matches!(
            self,
            Self::InsufficientSpace { .. } | Self::CorruptEntry(_) | Self::Io(_)
        )
    }
}

impl Clone for CacheError {
    fn clone(&self) -> Self {
        match self {
            Self::NoHealthyNode => Self::NoHealthyNode,
            Self::OriginUnreachable(msg) => Self::OriginUnreachable(msg.clone()),
            Self::OriginTimeout => Self::OriginTimeout,
            Self::InsufficientSpace { needed, available } => Self::InsufficientSpace {
                needed: *needed,
                available: *available,
            },
            Self::CorruptEntry(msg) => Self::CorruptEntry(msg.clone()),
            Self::Cancelled => Self::Cancelled,
            // io::Error は Clone できないため種別とメッセージを引き継ぐ
            Self::Io(e) => Self::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoHealthyNode => write!(f, "no healthy node available"),
            Self::OriginUnreachable(msg) => write!(f, "origin unreachable: {}", msg),
            Self::OriginTimeout => write!(f, "origin fetch timed out"),
            Self::InsufficientSpace { needed, available } => write!(
                f,
                "insufficient space: needed {} bytes, available {} bytes",
                needed, available
            ),
            Self::CorruptEntry(msg) => write!(f, "corrupt cache entry: {}", msg),
            Self::Cancelled => write!(f, "fetch cancelled (no remaining waiters)"),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CacheError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
