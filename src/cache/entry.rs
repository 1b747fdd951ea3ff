//! キャッシュエントリ
//!
//! ディスク上のキャッシュファイルに対応するメタデータと、
//! そのシリアライズ形式（メタデータブロブ）を定義します。
//!
//! ## メタデータブロブ（リトルエンディアン）
//!
//! ```text
//! status(u16) fetched_at_ms(u64) expires_at_ms(u64) body_size(u64)
//! key_len(u32) key
//! etag_len(u16) etag            ← 0 ならETagなし
//! header_count(u32) { name_len(u16) name value_len(u32) value }*
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::CacheError;

/// ヘッダーのリスト（名前-値ペア）
pub type HeaderList = Vec<(Box<[u8]>, Box<[u8]>)>;

/// キャッシュエントリ
///
/// インデックスに載るのはこの構造体だけで、ボディはディスク上に残ります。
/// 生成後は不変で、更新は新しいファイルとエントリへの置き換えで行います。
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// 正規化済みキャッシュキー
    pub key: Box<str>,
    /// レスポンスステータスコード
    pub status_code: u16,
    /// 保存されたレスポンスヘッダー（認証系・hop-by-hopを除く）
    pub headers: Arc<[(Box<[u8]>, Box<[u8]>)]>,
    /// 格納先ディスクID
    pub disk_id: usize,
    /// キャッシュファイルのパス
    pub path: PathBuf,
    /// ファイル先頭からボディまでのオフセット
    pub body_offset: u64,
    /// ボディサイズ
    pub body_size: u64,
    /// オリジンから取得した時刻
    pub fetched_at: SystemTime,
    /// 有効期限
    pub expires_at: SystemTime,
    /// ETag（条件付きリクエスト用）
    pub etag: Option<Box<str>>,
    /// メタデータブロブのチェックサム（ファイル置換の検出用）
    pub checksum: u64,
}

impl CacheEntry {
    /// 指定時刻で有効期限内か（`now > expires_at` で期限切れ）
    #[inline]
    pub fn is_fresh_at(&self, now: SystemTime) -> bool {
        now <= self.expires_at
    }

    /// 現在時刻で有効期限内か
    #[inline]
    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(SystemTime::now())
    }

    /// Ageヘッダー用の経過秒数
    #[inline]
    pub fn age_secs(&self, now: SystemTime) -> u64 {
        now.duration_since(self.fetched_at)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// ファイル全体のサイズ（ヘッダー + メタデータ + ボディ）
    #[inline]
    pub fn file_size(&self) -> u64 {
        self.body_offset + self.body_size
    }

    /// ヘッダー値を取得（大文字小文字を区別しない）
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_ref())
    }
}

/// ディスクへ書き込むメタデータ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    pub key: Box<str>,
    pub status_code: u16,
    pub headers: HeaderList,
    pub fetched_at: SystemTime,
    pub expires_at: SystemTime,
    pub body_size: u64,
    pub etag: Option<Box<str>>,
}

impl EntryMeta {
    /// メタデータブロブへシリアライズ
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.key.len() + self.headers.len() * 48);
        out.extend_from_slice(&self.status_code.to_le_bytes());
        out.extend_from_slice(&to_millis(self.fetched_at).to_le_bytes());
        out.extend_from_slice(&to_millis(self.expires_at).to_le_bytes());
        out.extend_from_slice(&self.body_size.to_le_bytes());

        out.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        out.extend_from_slice(self.key.as_bytes());

        let etag = self.etag.as_deref().unwrap_or("");
        out.extend_from_slice(&(etag.len() as u16).to_le_bytes());
        out.extend_from_slice(etag.as_bytes());

        out.extend_from_slice(&(self.headers.len() as u32).to_le_bytes());
        for (name, value) in &self.headers {
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(name);
            out.extend_from_slice(&(value.len() as u32).to_le_bytes());
            out.extend_from_slice(value);
        }
        out
    }

    /// メタデータブロブからデシリアライズ
    pub fn decode(blob: &[u8]) -> Result<Self, CacheError> {
        let mut r = Reader { buf: blob, pos: 0 };

        let status_code = r.u16()?;
        let fetched_at = from_millis(r.u64()?);
        let expires_at = from_millis(r.u64()?);
        let body_size = r.u64()?;

        let key_len = r.u32()? as usize;
        let key = r.str(key_len)?;

        let etag_len = r.u16()? as usize;
        let etag = if etag_len == 0 { None } else { Some(r.str(etag_len)?) };

        let count = r.u32()? as usize;
        let mut headers = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            let name_len = r.u16()? as usize;
            let name: Box<[u8]> = r.bytes(name_len)?.into();
            let value_len = r.u32()? as usize;
            let value: Box<[u8]> = r.bytes(value_len)?.into();
            headers.push((name, value));
        }

        if r.pos != blob.len() {
            return Err(CacheError::CorruptEntry("trailing bytes in metadata".into()));
        }

        Ok(Self {
            key,
            status_code,
            headers,
            fetched_at,
            expires_at,
            body_size,
            etag,
        })
    }

    /// ディスク上の位置を付与してエントリへ変換
    pub fn into_entry(
        self,
        disk_id: usize,
        path: PathBuf,
        body_offset: u64,
        checksum: u64,
    ) -> CacheEntry {
        CacheEntry {
            key: self.key,
            status_code: self.status_code,
            headers: self.headers.into(),
            disk_id,
            path,
            body_offset,
            body_size: self.body_size,
            fetched_at: self.fetched_at,
            expires_at: self.expires_at,
            etag: self.etag,
            checksum,
        }
    }
}

/// ブロブ読み取り用カーソル
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, len: usize) -> Result<&'a [u8], CacheError> {
        let end = self.pos.checked_add(len).filter(|&e| e <= self.buf.len());
        match end {
            Some(end) => {
                let out = &self.buf[self.pos..end];
                self.pos = end;
                Ok(out)
            }
            None => Err(CacheError::CorruptEntry("metadata truncated".into())),
        }
    }

    fn u16(&mut self) -> Result<u16, CacheError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CacheError> {
        let mut a = [0u8; 4];
        a.copy_from_slice(self.bytes(4)?);
        Ok(u32::from_le_bytes(a))
    }

    fn u64(&mut self) -> Result<u64, CacheError> {
        let mut a = [0u8; 8];
        a.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_le_bytes(a))
    }

    fn str(&mut self, len: usize) -> Result<Box<str>, CacheError> {
        let b = self.bytes(len)?;
        std::str::from_utf8(b)
            .map(Into::into)
            .map_err(|_| CacheError::CorruptEntry("metadata is not utf-8".into()))
    }
}

#[inline]
fn to_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[inline]
fn from_millis(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

/// キャッシュエントリビルダー
///
/// オリジンレスポンスから `EntryMeta` を組み立てます。
///
/// # 使用例
/// ```rust,ignore
/// let meta = CacheEntryBuilder::new(200)
///     .header(b"content-type", b"video/mp4")
///     .ttl(3600)
///     .body_size(1024)
///     .build("GET example.com/a.mp4");
/// ```
pub struct CacheEntryBuilder {
    status_code: u16,
    headers: HeaderList,
    ttl_secs: u64,
    body_size: u64,
    fetched_at: SystemTime,
}

impl CacheEntryBuilder {
    /// 新しいビルダーを作成
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: Vec::new(),
            ttl_secs: 24 * 60 * 60,
            body_size: 0,
            fetched_at: SystemTime::now(),
        }
    }

    /// ヘッダーを追加
    pub fn header(mut self, name: &[u8], value: &[u8]) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// ヘッダーリストを設定
    pub fn headers(mut self, headers: HeaderList) -> Self {
        self.headers = headers;
        self
    }

    /// TTLを設定
    pub fn ttl(mut self, secs: u64) -> Self {
        self.ttl_secs = secs;
        self
    }

    /// ボディサイズを設定
    pub fn body_size(mut self, size: u64) -> Self {
        self.body_size = size;
        self
    }

    /// 取得時刻を設定
    pub fn fetched_at(mut self, at: SystemTime) -> Self {
        self.fetched_at = at;
        self
    }

    /// メタデータとしてビルド
    pub fn build(self, key: &str) -> EntryMeta {
        let etag = self
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(b"etag"))
            .and_then(|(_, value)| std::str::from_utf8(value).ok())
            .map(Into::into);

        // ディスク上はミリ秒精度で保存されるため揃えておく
        let fetched_at = from_millis(to_millis(self.fetched_at));

        EntryMeta {
            key: key.into(),
            status_code: self.status_code,
            headers: self.headers,
            fetched_at,
            expires_at: fetched_at + Duration::from_secs(self.ttl_secs),
            body_size: self.body_size,
            etag,
        }
    }
}
