//! キャッシュインデックス
//!
//! DashMapを使用したロックフリーなディスクごとのインデックスを提供します。
//! ファイルを開かずに存在確認ができ、起動時にはディスク走査から再構築されます。

use super::entry::CacheEntry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

/// キャッシュインデックス
///
/// キーのハッシュ値からエントリへのマッピングを管理します。
pub struct CacheIndex {
    /// キャッシュエントリのマップ（ハッシュ値 → エントリ）
    entries: DashMap<u64, IndexEntry>,
    /// 現在のエントリ数
    entry_count: AtomicUsize,
}

/// インデックスエントリ
struct IndexEntry {
    /// キャッシュエントリ
    entry: Arc<CacheEntry>,
    /// 最終アクセス時刻
    last_accessed: Instant,
    /// アクセス回数
    access_count: u64,
}

impl CacheIndex {
    /// 新しいインデックスを作成
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            entry_count: AtomicUsize::new(0),
        }
    }

    /// エントリを取得
    ///
    /// 有効期限は見ない。キー文字列の完全一致を確認する（ハッシュ衝突対策）
    pub fn get(&self, hash: u64, canonical: &str) -> Option<Arc<CacheEntry>> {
        let mut entry = self.entries.get_mut(&hash)?;

        if &*entry.entry.key != canonical {
            return None;
        }

        entry.last_accessed = Instant::now();
        entry.access_count += 1;

        Some(Arc::clone(&entry.entry))
    }

    /// キー確認なしで取得
    pub fn peek(&self, hash: u64) -> Option<Arc<CacheEntry>> {
        self.entries.get(&hash).map(|e| Arc::clone(&e.entry))
    }

    /// エントリを挿入または置換
    ///
    /// 置換された古いエントリを返す
    pub fn insert(&self, hash: u64, entry: Arc<CacheEntry>) -> Option<Arc<CacheEntry>> {
        let index_entry = IndexEntry {
            entry,
            last_accessed: Instant::now(),
            access_count: 0,
        };

        match self.entries.insert(hash, index_entry) {
            Some(old) => Some(old.entry),
            None => {
                self.entry_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// エントリを削除
    pub fn remove(&self, hash: u64) -> Option<Arc<CacheEntry>> {
        let (_, removed) = self.entries.remove(&hash)?;
        self.entry_count.fetch_sub(1, Ordering::Relaxed);
        Some(removed.entry)
    }

    /// 指定のエントリがまだ登録されている場合のみ削除
    ///
    /// 新しいエントリに置き換わった後の削除を防ぐ
    pub fn remove_if_same(&self, hash: u64, expected: &Arc<CacheEntry>) -> bool {
        let removed = self
            .entries
            .remove_if(&hash, |_, e| Arc::ptr_eq(&e.entry, expected))
            .is_some();
        if removed {
            self.entry_count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// エビクション候補を取得
    ///
    /// 有効期限が早い順、同じなら取得時刻が古い順に最大 `limit` 件
    pub fn eviction_candidates(&self, limit: usize) -> Vec<(u64, Arc<CacheEntry>)> {
        if limit == 0 {
            return Vec::new();
        }

        let mut all: Vec<(u64, Arc<CacheEntry>)> = self
            .entries
            .iter()
            .map(|e| (*e.key(), Arc::clone(&e.value().entry)))
            .collect();

        let order = |a: &(u64, Arc<CacheEntry>), b: &(u64, Arc<CacheEntry>)| {
            (a.1.expires_at, a.1.fetched_at).cmp(&(b.1.expires_at, b.1.fetched_at))
        };

        if all.len() > limit {
            all.select_nth_unstable_by(limit - 1, order);
            all.truncate(limit);
        }
        all.sort_by(order);
        all
    }

    /// 期限切れエントリを列挙
    pub fn expired(&self, now: SystemTime) -> Vec<(u64, Arc<CacheEntry>)> {
        self.entries
            .iter()
            .filter(|e| !e.value().entry.is_fresh_at(now))
            .map(|e| (*e.key(), Arc::clone(&e.value().entry)))
            .collect()
    }

    /// エントリのアクセス回数
    pub fn access_count(&self, hash: u64) -> u64 {
        self.entries.get(&hash).map(|e| e.access_count).unwrap_or(0)
    }

    /// 現在のエントリ数
    #[inline]
    pub fn len(&self) -> usize {
        self.entry_count.load(Ordering::Relaxed)
    }

    /// インデックスが空かどうか
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 全エントリを削除
    pub fn clear(&self) {
        self.entries.clear();
        self.entry_count.store(0, Ordering::Relaxed);
    }
}

impl Default for CacheIndex {
    fn default() -> Self {
        Self::new()
    }
}
