//! # ノードキャッシュモジュール
//!
//! 1ノードに接続された複数ディスクへオブジェクトをキャッシュします。
//!
//! ## 特徴
//!
//! - **ディスクごとのインデックス**: DashMapによるロックフリーな並行アクセス
//! - **シングルフライト**: 同じキーへの同時ミスはオリジン取得1回にまとめる
//! - **ヘルス連動**: Unhealthy のディスクは読み書きの対象から外す
//! - **Range対応**: キャッシュ済みオブジェクトから部分レスポンスを返す
//!
//! ## アーキテクチャ
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  NodeCacheEngine                            │
//! │  ├─ InFlightTable (DashMap)                 │← 進行中のフェッチ
//! │  ├─ LocalDisk #0 ─ CacheIndex + ファイル    │
//! │  ├─ LocalDisk #1 ─ CacheIndex + ファイル    │
//! │  └─ Origin (HTTP/1.1 キープアライブ)        │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## 設定例
//!
//! ```toml
//! [cache]
//! default_ttl_secs = 3600
//! bypass_patterns = ["/api/*"]
//! range_policy = "full"
//! ```

mod config;
mod disk;
mod engine;
mod entry;
mod flight;
mod index;
mod key;
mod policy;
mod range;

pub use config::{CacheConfig, RangePolicy};
pub use disk::{put_body, BodyReader, DiskDescriptor, DiskStats, DiskStore, EvictionPolicy, LocalDisk, StagedWrite};
pub use engine::{CacheResponse, CacheStatus, EngineStats, FlightResult, Fetched, NodeCacheEngine, ResponseBody, SplicedBody};
pub(crate) use engine::relay_headers;
pub use entry::{CacheEntry, CacheEntryBuilder, EntryMeta, HeaderList};
pub use flight::{InFlightFetch, InFlightTable, Waiter};
pub use index::CacheIndex;
pub use key::{CacheKey, CacheableMethod};
pub use policy::{CacheControl, CachePolicy, VaryResult};
pub use range::{content_range, parse_content_range, unsatisfied_range, ByteRange, RangeResolution};
