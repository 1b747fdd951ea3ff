//! # shardcache
//!
//! monoio（io_uring）ベースの分散キャッシュリバースプロキシ。
//!
//! 1つのバイナリが設定の `role` に応じて次のどちらかとして動作します。
//!
//! - **router**: コンシステントハッシュでキャッシュキーをノードへ振り分け、
//!   ヘルスチェックで落ちたノードをリング上の次のノードへフェイルオーバーする
//! - **node**: 複数ディスクにオブジェクトを保存し、同一キーのミスを
//!   1回のオリジン取得にまとめる（シングルフライト）
//!
//! ```text
//! client ─▶ router ─┬─▶ node A ─┬─▶ disk0
//!                   │           └─▶ disk1 ──(miss)──▶ origin (S3)
//!                   └─▶ node B ...
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod metrics;
pub mod origin;
pub mod router;
pub mod server;
