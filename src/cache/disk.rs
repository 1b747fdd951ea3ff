//! ディスクストア
//!
//! 1ディスク（マウントポイント）分のキャッシュファイルを管理します。
//!
//! ## レイアウト
//!
//! ```text
//! <mount>/
//! ├── tmp/<hash16>.<seq>.tmp        ← ステージング（fsync後にrename）
//! └── <hh>/<hh>/<hash16>.cache      ← ハッシュ上位2バイトで2階層
//! ```
//!
//! ## ファイル形式
//!
//! ```text
//! +--------+---------+----------+----------+----------+----------------+------+
//! | "SHCE" | version | reserved | meta_len | reserved | xxh3(meta)     | meta | body
//! | 4B     | u16     | u16      | u32      | u32      | u64            |      |
//! +--------+---------+----------+----------+----------+----------------+------+
//! ```
//!
//! ## I/O
//!
//! - ボディの読み書きと fsync: monoio::fs（io_uring）
//! - ヘッダー検証・ディレクトリ作成・rename・削除: 同期呼び出し（小さく頻度も低い）
//! - 起動時のインデックス再構築: 同期呼び出し（ワーカー起動前）

use super::config::CacheConfig;
use super::entry::{CacheEntry, EntryMeta};
use super::index::CacheIndex;
use super::key::{path_components, CacheKey};
use crate::error::CacheError;
use crate::health::HealthState;
use ftlog::{debug, info, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use xxhash_rust::xxh3::xxh3_64;

/// ファイル先頭のマジック
pub const MAGIC: [u8; 4] = *b"SHCE";
/// ファイル形式バージョン
pub const FORMAT_VERSION: u16 = 1;
/// 固定ヘッダー長
pub const HEADER_LEN: u64 = 24;
/// ボディ読み出しのチャンクサイズ
const READ_CHUNK: usize = 64 * 1024;
/// ステージングディレクトリ名
const TMP_DIR: &str = "tmp";

/// エビクション方針
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// 期限切れエントリのみ削除
    ExpiredOnly,
    /// `needed` バイトの空きができるまで、最大 `budget` 件を期限順に削除
    FreeBytes { needed: u64, budget: usize },
}

/// ディスクの概要
#[derive(Debug, Clone)]
pub struct DiskDescriptor {
    pub id: usize,
    pub mount_path: PathBuf,
    pub capacity: u64,
    pub used: u64,
    pub health: HealthState,
}

/// ディスク統計
#[derive(Debug, Clone)]
pub struct DiskStats {
    pub descriptor: DiskDescriptor,
    pub entries: usize,
    pub evictions: u64,
    pub writes: u64,
    pub reads: u64,
    pub corrupt: u64,
}

/// ディスクストアのインターフェース
///
/// ノードキャッシュエンジンはディスクをこのトレイト経由でのみ扱う
pub trait DiskStore: Send + Sync {
    /// ディスクID
    fn id(&self) -> usize;

    /// 容量・使用量・状態
    fn descriptor(&self) -> DiskDescriptor;

    /// 有効期限内のエントリを取得
    fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>>;

    /// ストリーミング書き込みを開始（容量を予約）
    fn begin_put(&self, key: &CacheKey, meta: EntryMeta, expected_body: u64) -> Result<StagedWrite, CacheError>;

    /// `finish` 済みのステージングファイルを rename してインデックスへ登録
    ///
    /// 失敗しても `staged` は呼び出し側に残る（一時ファイルの内容は読み出せる）
    fn commit(&self, staged: &mut StagedWrite) -> Result<Arc<CacheEntry>, CacheError>;

    /// エビクションを実行し、解放したバイト数を返す
    fn evict(&self, policy: EvictionPolicy) -> u64;

    /// エントリを削除
    fn remove(&self, key: &CacheKey) -> bool;

    /// ボディの指定範囲を読み出すリーダーを開く
    fn open_body(&self, entry: &Arc<CacheEntry>, start: u64, len: u64) -> Result<BodyReader, CacheError>;

    fn health_state(&self) -> HealthState;

    fn set_health_state(&self, state: HealthState);

    /// 小さなファイルの書き込み・読み戻し・削除で動作確認
    ///
    /// 同期呼び出し（ヘルスモニターがブロッキングプールで実行する）
    fn probe(&self) -> io::Result<()>;

    fn stats(&self) -> DiskStats;
}

/// メモリ上のボディをまとめて書き込む
///
/// ボディはエラー時も含めて返す
pub async fn put_body(
    disk: &dyn DiskStore,
    key: &CacheKey,
    meta: EntryMeta,
    body: Vec<u8>,
) -> (Result<Arc<CacheEntry>, CacheError>, Vec<u8>) {
    let mut staged = match disk.begin_put(key, meta, body.len() as u64) {
        Ok(s) => s,
        Err(e) => return (Err(e), body),
    };
    let (res, body) = staged.write_chunk(body).await;
    if let Err(e) = res {
        return (Err(e), body);
    }
    if let Err(e) = staged.finish().await {
        return (Err(e), body);
    }
    (disk.commit(&mut staged), body)
}

// ====================
// ファイルヘッダー
// ====================

fn encode_header(meta_len: u32, checksum: u64) -> [u8; HEADER_LEN as usize] {
    let mut h = [0u8; HEADER_LEN as usize];
    h[0..4].copy_from_slice(&MAGIC);
    h[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    h[8..12].copy_from_slice(&meta_len.to_le_bytes());
    h[16..24].copy_from_slice(&checksum.to_le_bytes());
    h
}

fn decode_header(h: &[u8; HEADER_LEN as usize]) -> Result<(u32, u64), CacheError> {
    if h[0..4] != MAGIC {
        return Err(CacheError::CorruptEntry("bad magic".into()));
    }
    let version = u16::from_le_bytes([h[4], h[5]]);
    if version != FORMAT_VERSION {
        return Err(CacheError::CorruptEntry(format!("unsupported version {}", version)));
    }
    let meta_len = u32::from_le_bytes([h[8], h[9], h[10], h[11]]);
    let mut c = [0u8; 8];
    c.copy_from_slice(&h[16..24]);
    Ok((meta_len, u64::from_le_bytes(c)))
}

/// キャッシュファイルのメタデータ部分だけを読み込む
fn read_entry_file(path: &Path, disk_id: usize) -> Result<CacheEntry, CacheError> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();

    let mut header = [0u8; HEADER_LEN as usize];
    file.read_exact(&mut header)
        .map_err(|_| CacheError::CorruptEntry("header truncated".into()))?;
    let (meta_len, checksum) = decode_header(&header)?;

    if HEADER_LEN + meta_len as u64 > file_len {
        return Err(CacheError::CorruptEntry("metadata exceeds file".into()));
    }

    let mut blob = vec![0u8; meta_len as usize];
    file.read_exact(&mut blob)
        .map_err(|_| CacheError::CorruptEntry("metadata truncated".into()))?;
    if xxh3_64(&blob) != checksum {
        return Err(CacheError::CorruptEntry("checksum mismatch".into()));
    }

    let meta = EntryMeta::decode(&blob)?;
    let body_offset = HEADER_LEN + meta_len as u64;
    if body_offset + meta.body_size != file_len {
        return Err(CacheError::CorruptEntry(format!(
            "file length {} != {}",
            file_len,
            body_offset + meta.body_size
        )));
    }

    Ok(meta.into_entry(disk_id, path.to_path_buf(), body_offset, checksum))
}

// ====================
// ページキャッシュ制御
// ====================

#[derive(Clone, Copy)]
enum Advice {
    Sequential,
    DontNeed,
}

#[cfg(target_os = "linux")]
fn fadvise(fd: RawFd, offset: u64, len: u64, advice: Advice) {
    let advice = match advice {
        Advice::Sequential => libc::POSIX_FADV_SEQUENTIAL,
        Advice::DontNeed => libc::POSIX_FADV_DONTNEED,
    };
    // SAFETY: 有効なファイルディスクリプタに対するヒントのみで、メモリには触れない
    let ret = unsafe {
        libc::posix_fadvise(
            fd,
            offset as libc::off_t,
            len as libc::off_t,
            advice,
        )
    };
    if ret != 0 {
        debug!("posix_fadvise failed: {}", ret);
    }
}

#[cfg(not(target_os = "linux"))]
fn fadvise(_fd: RawFd, _offset: u64, _len: u64, _advice: Advice) {}

/// 使用量カウンタからの減算（アンダーフローしない）
#[inline]
fn release(used: &AtomicU64, bytes: u64) {
    let _ = used.fetch_update(Ordering::AcqRel, Ordering::Acquire, |u| {
        Some(u.saturating_sub(bytes))
    });
}

// ====================
// ステージング書き込み
// ====================

/// 書き込み途中のキャッシュファイル
///
/// `commit` されずに破棄された場合、一時ファイルを削除して予約容量を返却する
pub struct StagedWrite {
    hash: u64,
    disk_id: usize,
    meta: EntryMeta,
    meta_len: usize,
    file: monoio::fs::File,
    written: u64,
    large: bool,
    /// `finish` で確定したメタデータのチェックサム
    checksum: Option<u64>,
    staging: Staging,
}

/// 一時ファイルと予約容量の後始末
struct Staging {
    tmp_path: PathBuf,
    reserved: u64,
    used: Arc<AtomicU64>,
    committed: bool,
}

impl Drop for Staging {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.tmp_path);
        }
        if self.reserved > 0 {
            release(&self.used, self.reserved);
            self.reserved = 0;
        }
    }
}

impl StagedWrite {
    #[inline]
    fn body_offset(&self) -> u64 {
        HEADER_LEN + self.meta_len as u64
    }

    /// ボディの一部を追記（バッファは返却する）
    pub async fn write_chunk(&mut self, data: Vec<u8>) -> (Result<(), CacheError>, Vec<u8>) {
        if self.checksum.is_some() {
            let err = io::Error::new(io::ErrorKind::Other, "staged write already finished");
            return (Err(err.into()), data);
        }
        let len = data.len() as u64;
        let (res, data) = self.file.write_all_at(data, self.body_offset() + self.written).await;
        match res {
            Ok(()) => {
                self.written += len;
                (Ok(()), data)
            }
            Err(e) => (Err(e.into()), data),
        }
    }

    /// ヘッダーとメタデータを書き込み fsync する
    pub async fn finish(&mut self) -> Result<(), CacheError> {
        self.meta.body_size = self.written;
        let blob = self.meta.encode();
        if blob.len() != self.meta_len {
            return Err(CacheError::CorruptEntry("metadata length changed".into()));
        }
        let checksum = xxh3_64(&blob);

        let mut head = Vec::with_capacity(HEADER_LEN as usize + blob.len());
        head.extend_from_slice(&encode_header(blob.len() as u32, checksum));
        head.extend_from_slice(&blob);
        let (res, _) = self.file.write_all_at(head, 0).await;
        res?;
        self.file.sync_all().await?;

        if self.large {
            fadvise(self.file.as_raw_fd(), 0, self.body_offset() + self.written, Advice::DontNeed);
        }
        self.checksum = Some(checksum);
        Ok(())
    }

    /// 書き込み済みのボディサイズ
    #[inline]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// ステージングファイルのパス
    #[inline]
    pub fn tmp_path(&self) -> &Path {
        &self.staging.tmp_path
    }

    /// 書き込み済みのボディを読み出すリーダーに変換する
    ///
    /// 一時ファイルは削除されるが、開いたままのファイルから最後まで読める
    pub fn into_reader(self) -> BodyReader {
        let start = self.body_offset();
        BodyReader {
            file: self.file,
            pos: start,
            remaining: self.written,
            start,
            len: self.written,
            large: self.large,
        }
    }
}

// ====================
// ボディ読み出し
// ====================

/// キャッシュファイルのボディを範囲指定で読み出すリーダー
pub struct BodyReader {
    file: monoio::fs::File,
    pos: u64,
    remaining: u64,
    start: u64,
    len: u64,
    large: bool,
}

impl BodyReader {
    /// 残りバイト数
    #[inline]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// 次のチャンクを `buf` に読み込む（読み終わったら `None`）
    pub async fn next_chunk(&mut self, mut buf: Vec<u8>) -> io::Result<Option<Vec<u8>>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        buf.clear();
        if buf.capacity() == 0 {
            buf.reserve(READ_CHUNK);
        }

        let (res, mut buf) = self.file.read_at(buf, self.pos).await;
        let n = match res? {
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "cache file ended before body",
                ))
            }
            n => (n as u64).min(self.remaining),
        };
        buf.truncate(n as usize);
        self.pos += n;
        self.remaining -= n;
        Ok(Some(buf))
    }

    /// 残りをすべて読み込む
    pub async fn read_to_vec(mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.remaining as usize);
        while let Some(chunk) = self.next_chunk(Vec::new()).await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

impl Drop for BodyReader {
    fn drop(&mut self) {
        if self.large {
            fadvise(self.file.as_raw_fd(), self.start, self.len, Advice::DontNeed);
        }
    }
}

// ====================
// ローカルディスク実装
// ====================

/// ローカルファイルシステム上のディスクストア
pub struct LocalDisk {
    id: usize,
    root: PathBuf,
    tmp_dir: PathBuf,
    capacity: u64,
    large_object_threshold: u64,
    eviction_budget: usize,
    index: CacheIndex,
    /// 確定済みファイル + 予約中の書き込みの合計
    used: Arc<AtomicU64>,
    health: AtomicU8,
    /// rename + インデックス更新と、削除を直列化する
    write_lock: Mutex<()>,
    seq: AtomicU64,
    evictions: AtomicU64,
    writes: AtomicU64,
    reads: AtomicU64,
    corrupt: AtomicU64,
}

impl LocalDisk {
    /// ディスクを開き、既存のキャッシュファイルからインデックスを再構築する
    pub fn open(
        id: usize,
        root: impl Into<PathBuf>,
        capacity: u64,
        config: &CacheConfig,
    ) -> io::Result<Self> {
        let root = root.into();
        let tmp_dir = root.join(TMP_DIR);
        fs::create_dir_all(&tmp_dir)?;

        let disk = Self {
            id,
            root,
            tmp_dir,
            capacity,
            large_object_threshold: config.large_object_threshold,
            eviction_budget: config.eviction_budget,
            index: CacheIndex::new(),
            used: Arc::new(AtomicU64::new(0)),
            health: AtomicU8::new(HealthState::Healthy.as_u8()),
            write_lock: Mutex::new(()),
            seq: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            corrupt: AtomicU64::new(0),
        };

        let (loaded, removed) = disk.rebuild_index()?;
        info!(
            "[Disk {}] {} opened: {} entries, {} bytes used, {} corrupt files removed",
            id,
            disk.root.display(),
            loaded,
            disk.used.load(Ordering::Relaxed),
            removed
        );

        // 容量を縮小して再起動した場合
        if disk.used.load(Ordering::Relaxed) > capacity {
            let freed = disk.evict(EvictionPolicy::FreeBytes { needed: 0, budget: usize::MAX });
            warn!("[Disk {}] over capacity at startup, evicted {} bytes", id, freed);
        }

        Ok(disk)
    }

    /// マウントパス
    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 空き容量（予約中の書き込みを除く）
    #[inline]
    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.used.load(Ordering::Acquire))
    }

    /// ハッシュ値からファイルパスを生成
    pub fn entry_path(&self, hash: u64) -> PathBuf {
        let (dir1, dir2, filename) = path_components(hash);
        self.root.join(dir1).join(dir2).join(filename)
    }

    /// 起動時の走査
    ///
    /// 戻り値: (読み込んだエントリ数, 削除した破損ファイル数)
    fn rebuild_index(&self) -> io::Result<(usize, usize)> {
        // 前回のプロセスが残したステージングファイルを削除
        for entry in fs::read_dir(&self.tmp_dir)? {
            let _ = fs::remove_file(entry?.path());
        }

        let mut loaded = 0;
        let mut removed = 0;

        for level1 in fs::read_dir(&self.root)? {
            let level1 = level1?;
            if !is_hex_dir(&level1) {
                continue;
            }
            for level2 in fs::read_dir(level1.path())? {
                let level2 = level2?;
                if !is_hex_dir(&level2) {
                    continue;
                }
                for file in fs::read_dir(level2.path())? {
                    let path = file?.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("cache") {
                        continue;
                    }

                    let hash = path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .and_then(|s| u64::from_str_radix(s, 16).ok());

                    let result = match hash {
                        Some(hash) => read_entry_file(&path, self.id).and_then(|entry| {
                            if xxh3_64(entry.key.as_bytes()) == hash {
                                Ok((hash, entry))
                            } else {
                                Err(CacheError::CorruptEntry("key does not match file name".into()))
                            }
                        }),
                        None => Err(CacheError::CorruptEntry("unexpected file name".into())),
                    };

                    match result {
                        Ok((hash, entry)) => {
                            self.used.fetch_add(entry.file_size(), Ordering::AcqRel);
                            self.index.insert(hash, Arc::new(entry));
                            loaded += 1;
                        }
                        Err(e) => {
                            warn!("[Disk {}] removing {}: {}", self.id, path.display(), e);
                            let _ = fs::remove_file(&path);
                            self.corrupt.fetch_add(1, Ordering::Relaxed);
                            removed += 1;
                        }
                    }
                }
            }
        }

        Ok((loaded, removed))
    }

    /// 容量を予約（不足していればエビクションを試みる）
    fn reserve(&self, bytes: u64) -> Result<(), CacheError> {
        if bytes > self.capacity {
            return Err(CacheError::InsufficientSpace {
                needed: bytes,
                available: self.available(),
            });
        }
        if self.try_reserve(bytes) {
            return Ok(());
        }

        let freed = self.evict(EvictionPolicy::FreeBytes {
            needed: bytes,
            budget: self.eviction_budget,
        });
        debug!("[Disk {}] evicted {} bytes to make room for {}", self.id, freed, bytes);

        if self.try_reserve(bytes) {
            Ok(())
        } else {
            Err(CacheError::InsufficientSpace {
                needed: bytes,
                available: self.available(),
            })
        }
    }

    fn try_reserve(&self, bytes: u64) -> bool {
        let capacity = self.capacity;
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |u| {
                (u + bytes <= capacity).then_some(u + bytes)
            })
            .is_ok()
    }

    /// インデックスとファイルからエントリを削除
    ///
    /// すでに別のエントリに置き換わっている場合は何もしない
    fn remove_entry(&self, hash: u64, entry: &Arc<CacheEntry>) -> bool {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        if !self.index.remove_if_same(hash, entry) {
            return false;
        }
        match fs::remove_file(&entry.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("[Disk {}] failed to remove {}: {}", self.id, entry.path.display(), e),
        }
        release(&self.used, entry.file_size());
        true
    }

    /// 破損エントリを破棄
    fn discard_corrupt(&self, entry: &Arc<CacheEntry>, reason: &str) -> CacheError {
        let hash = xxh3_64(entry.key.as_bytes());
        if self.remove_entry(hash, entry) {
            self.corrupt.fetch_add(1, Ordering::Relaxed);
            warn!("[Disk {}] corrupt entry {} removed: {}", self.id, entry.key, reason);
        }
        CacheError::CorruptEntry(reason.to_string())
    }
}

fn is_hex_dir(entry: &fs::DirEntry) -> bool {
    let name = entry.file_name();
    let name = name.to_string_lossy();
    name.len() == 2
        && name.bytes().all(|b| b.is_ascii_hexdigit())
        && entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
}

impl DiskStore for LocalDisk {
    fn id(&self) -> usize {
        self.id
    }

    fn descriptor(&self) -> DiskDescriptor {
        DiskDescriptor {
            id: self.id,
            mount_path: self.root.clone(),
            capacity: self.capacity,
            used: self.used.load(Ordering::Acquire),
            health: self.health_state(),
        }
    }

    fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.index
            .get(key.hash_value(), key.canonical())
            .filter(|entry| entry.is_fresh())
    }

    fn begin_put(&self, key: &CacheKey, meta: EntryMeta, expected_body: u64) -> Result<StagedWrite, CacheError> {
        let meta_len = meta.encode().len();
        let reserve = HEADER_LEN + meta_len as u64 + expected_body;

        self.reserve(reserve)?;

        let hash = key.hash_value();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let tmp_path = self.tmp_dir.join(format!("{:016x}.{}.tmp", hash, seq));

        // ヘッダーは finish で書き込む（それまではマジック不一致で無効）
        let file = match OpenOptions::new().write(true).read(true).create_new(true).open(&tmp_path) {
            Ok(f) => f,
            Err(e) => {
                release(&self.used, reserve);
                return Err(e.into());
            }
        };
        let file = match monoio::fs::File::from_std(file) {
            Ok(f) => f,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                release(&self.used, reserve);
                return Err(e.into());
            }
        };

        Ok(StagedWrite {
            hash,
            disk_id: self.id,
            meta,
            meta_len,
            file,
            written: 0,
            large: expected_body >= self.large_object_threshold,
            checksum: None,
            staging: Staging {
                tmp_path,
                reserved: reserve,
                used: Arc::clone(&self.used),
                committed: false,
            },
        })
    }

    fn commit(&self, staged: &mut StagedWrite) -> Result<Arc<CacheEntry>, CacheError> {
        let checksum = staged.checksum.ok_or_else(|| {
            CacheError::Io(io::Error::new(io::ErrorKind::Other, "staged write not finished"))
        })?;
        if staged.staging.committed {
            return Err(CacheError::Io(io::Error::new(io::ErrorKind::Other, "staged write already committed")));
        }

        let body_offset = staged.body_offset();
        let file_size = body_offset + staged.written;

        let final_path = self.entry_path(staged.hash);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let entry = Arc::new(staged.meta.clone().into_entry(
            staged.disk_id,
            final_path.clone(),
            body_offset,
            checksum,
        ));

        {
            let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

            let staging = &mut staged.staging;
            fs::rename(&staging.tmp_path, &final_path)?;
            // rename済みなので Drop で一時ファイルを消さない
            staging.committed = true;

            // 予約分を実サイズに置き換える
            if file_size > staging.reserved {
                self.used.fetch_add(file_size - staging.reserved, Ordering::AcqRel);
            } else {
                release(&self.used, staging.reserved - file_size);
            }
            staging.reserved = 0;

            if let Some(old) = self.index.insert(staged.hash, Arc::clone(&entry)) {
                release(&self.used, old.file_size());
            }
        }

        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!("[Disk {}] stored {} ({} bytes)", self.id, entry.key, file_size);
        Ok(entry)
    }

    fn evict(&self, policy: EvictionPolicy) -> u64 {
        let mut freed = 0u64;
        let mut count = 0u64;

        match policy {
            EvictionPolicy::ExpiredOnly => {
                for (hash, entry) in self.index.expired(SystemTime::now()) {
                    if self.remove_entry(hash, &entry) {
                        freed += entry.file_size();
                        count += 1;
                    }
                }
            }
            EvictionPolicy::FreeBytes { needed, budget } => {
                for (hash, entry) in self.index.eviction_candidates(budget) {
                    if self.used.load(Ordering::Acquire) + needed <= self.capacity {
                        break;
                    }
                    if self.remove_entry(hash, &entry) {
                        freed += entry.file_size();
                        count += 1;
                    }
                }
            }
        }

        if count > 0 {
            self.evictions.fetch_add(count, Ordering::Relaxed);
            debug!("[Disk {}] evicted {} entries ({} bytes)", self.id, count, freed);
        }
        freed
    }

    fn remove(&self, key: &CacheKey) -> bool {
        match self.index.get(key.hash_value(), key.canonical()) {
            Some(entry) => self.remove_entry(key.hash_value(), &entry),
            None => false,
        }
    }

    fn open_body(&self, entry: &Arc<CacheEntry>, start: u64, len: u64) -> Result<BodyReader, CacheError> {
        if start.saturating_add(len) > entry.body_size {
            return Err(CacheError::CorruptEntry("range outside body".into()));
        }

        let file = match File::open(&entry.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(self.discard_corrupt(entry, "file missing"));
            }
            Err(e) => return Err(e.into()),
        };

        let mut header = [0u8; HEADER_LEN as usize];
        if file.read_exact_at(&mut header, 0).is_err() {
            return Err(self.discard_corrupt(entry, "header truncated"));
        }
        let (meta_len, checksum) = match decode_header(&header) {
            Ok(v) => v,
            Err(e) => return Err(self.discard_corrupt(entry, &e.to_string())),
        };
        if checksum != entry.checksum || HEADER_LEN + meta_len as u64 != entry.body_offset {
            // 更新で置き換わった場合は新しいエントリを消さない
            return Err(self.discard_corrupt(entry, "file replaced or metadata changed"));
        }
        let file_len = file.metadata()?.len();
        if file_len != entry.file_size() {
            return Err(self.discard_corrupt(entry, "file length mismatch"));
        }

        let large = entry.body_size >= self.large_object_threshold;
        if large {
            fadvise(file.as_raw_fd(), entry.body_offset + start, len, Advice::Sequential);
        }

        self.reads.fetch_add(1, Ordering::Relaxed);

        Ok(BodyReader {
            file: monoio::fs::File::from_std(file)?,
            pos: entry.body_offset + start,
            remaining: len,
            start: entry.body_offset + start,
            len,
            large,
        })
    }

    fn health_state(&self) -> HealthState {
        HealthState::from_u8(self.health.load(Ordering::Acquire))
    }

    fn set_health_state(&self, state: HealthState) {
        self.health.store(state.as_u8(), Ordering::Release);
    }

    fn probe(&self) -> io::Result<()> {
        let path = self.tmp_dir.join(format!(".probe-{}", self.id));
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let payload = format!("probe {} {}", self.id, stamp);

        let result = (|| {
            let mut file = File::create(&path)?;
            file.write_all(payload.as_bytes())?;
            file.sync_all()?;
            drop(file);

            let read_back = fs::read(&path)?;
            if read_back != payload.as_bytes() {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "probe read-back mismatch"));
            }
            Ok(())
        })();

        let _ = fs::remove_file(&path);
        result
    }

    fn stats(&self) -> DiskStats {
        DiskStats {
            descriptor: self.descriptor(),
            entries: self.index.len(),
            evictions: self.evictions.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            corrupt: self.corrupt.load(Ordering::Relaxed),
        }
    }
}
