//! キャッシュキー
//!
//! リクエストのメソッド・ホスト・パス・クエリを正規化し、
//! ルーター（リング位置）とノード（ディスク選択・ファイルパス）の両方で
//! 同じ64bitハッシュを使えるようにします。

use std::fmt;
use std::hash::{Hash, Hasher};
use xxhash_rust::xxh3::xxh3_64;

/// キャッシュキーから除外する署名系クエリパラメータ
///
/// 署名付きURL（S3 presigned URL）はリクエストごとに値が変わるため、
/// 含めると同一オブジェクトが別キーになってしまう
const SIGNATURE_PARAMS: &[&str] = &[
    "x-amz-algorithm",
    "x-amz-credential",
    "x-amz-date",
    "x-amz-expires",
    "x-amz-signedheaders",
    "x-amz-signature",
    "x-amz-security-token",
];

/// キャッシュ可能なHTTPメソッド
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheableMethod {
    Get,
    Head,
}

impl CacheableMethod {
    /// バイト列からパース
    pub fn from_bytes(method: &[u8]) -> Option<Self> {
        if method.eq_ignore_ascii_case(b"GET") {
            Some(CacheableMethod::Get)
        } else if method.eq_ignore_ascii_case(b"HEAD") {
            Some(CacheableMethod::Head)
        } else {
            None
        }
    }

    /// 文字列として取得
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheableMethod::Get => "GET",
            CacheableMethod::Head => "HEAD",
        }
    }
}

/// キャッシュキー
///
/// 生成後は不変。ハッシュ値は正規形（`canonical()`）から事前計算されます。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheKey {
    /// HTTPメソッド（HEADはGETのエントリを参照するため常にGET）
    method: CacheableMethod,
    /// 正規化済みホスト名
    host: Box<str>,
    /// 正規化済みパス（クエリ含む場合あり）
    path: Box<str>,
    /// 範囲付きキーの範囲指定（"requested" ポリシー時のみ）
    range: Option<Box<str>>,
    /// 正規形の文字列
    canonical: Box<str>,
    /// 事前計算されたハッシュ値
    hash: u64,
}

impl CacheKey {
    /// 新しいキャッシュキーを作成
    ///
    /// `host` / `path` は正規化済みであることを前提とします。
    pub fn new(
        method: CacheableMethod,
        host: &str,
        path: &str,
        range: Option<&str>,
    ) -> Self {
        let canonical = Self::build_canonical(method, host, path, range);
        let hash = xxh3_64(canonical.as_bytes());

        Self {
            method,
            host: host.into(),
            path: path.into(),
            range: range.map(Into::into),
            canonical: canonical.into_boxed_str(),
            hash,
        }
    }

    /// リクエスト情報からキャッシュキーを生成
    ///
    /// # Arguments
    ///
    /// * `method` - HTTPメソッド（GET/HEAD以外は `None`）
    /// * `host` - Hostヘッダー
    /// * `path` - リクエストパス（クエリを除く）
    /// * `query` - クエリ文字列
    /// * `include_query` - クエリパラメータを含めるか
    pub fn from_request(
        method: &[u8],
        host: &str,
        path: &str,
        query: Option<&str>,
        include_query: bool,
    ) -> Option<Self> {
        // HEADはGETで保存されたエントリを参照する
        CacheableMethod::from_bytes(method)?;

        let host = normalize_host(host);
        let path = if path.is_empty() { "/" } else { path };

        let full_path = match query.filter(|_| include_query).map(normalize_query) {
            Some(q) if !q.is_empty() => format!("{}?{}", path, q),
            _ => path.to_string(),
        };

        Some(Self::new(CacheableMethod::Get, &host, &full_path, None))
    }

    /// 範囲付きキーを作成（"requested" ポリシー用）
    pub fn with_range(&self, range: &str) -> Self {
        Self::new(self.method, &self.host, &self.path, Some(range))
    }

    /// 範囲指定を除いたキー
    pub fn without_range(&self) -> Self {
        if self.range.is_none() {
            return self.clone();
        }
        Self::new(self.method, &self.host, &self.path, None)
    }

    fn build_canonical(
        method: CacheableMethod,
        host: &str,
        path: &str,
        range: Option<&str>,
    ) -> String {
        let mut s = String::with_capacity(host.len() + path.len() + 32);
        s.push_str(method.as_str());
        s.push(' ');
        s.push_str(host);
        s.push_str(path);
        if let Some(range) = range {
            s.push_str("#range=");
            s.push_str(range);
        }
        s
    }

    /// メソッドを取得
    #[inline]
    pub fn method(&self) -> CacheableMethod {
        self.method
    }

    /// ホスト名を取得
    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// パスを取得
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// 範囲指定を取得
    #[inline]
    pub fn range(&self) -> Option<&str> {
        self.range.as_deref()
    }

    /// 正規形（ディスク上のメタデータにも保存される）
    #[inline]
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// ハッシュ値を取得
    #[inline]
    pub fn hash_value(&self) -> u64 {
        self.hash
    }
}

/// ハッシュ値から `<hh>/<hh>/<hash16>.cache` の各部分を生成
pub(crate) fn path_components(hash: u64) -> (String, String, String) {
    let dir1 = format!("{:02x}", (hash >> 56) as u8);
    let dir2 = format!("{:02x}", (hash >> 48) as u8);
    let filename = format!("{:016x}.cache", hash);
    (dir1, dir2, filename)
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // 事前計算されたハッシュ値を使用
        state.write_u64(self.hash);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// ホスト名の正規化（小文字化、デフォルトポート除去）
fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = host.strip_suffix(":80").unwrap_or(host);
    host.to_ascii_lowercase()
}

/// クエリの正規化（署名パラメータ除去、ソート）
fn normalize_query(query: &str) -> String {
    let mut params: Vec<&str> = query
        .split('&')
        .filter(|p| !p.is_empty())
        .filter(|p| {
            let name = p.split('=').next().unwrap_or("");
            !SIGNATURE_PARAMS.iter().any(|s| s.eq_ignore_ascii_case(name))
        })
        .collect();
    params.sort_unstable();
    params.join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_creation() {
        let key = CacheKey::new(
            CacheableMethod::Get,
            "example.com",
            "/videos/a.mp4",
            None,
        );

        assert_eq!(key.method(), CacheableMethod::Get);
        assert_eq!(key.host(), "example.com");
        assert_eq!(key.path(), "/videos/a.mp4");
        assert!(key.range().is_none());
        assert_eq!(key.canonical(), "GET example.com/videos/a.mp4");
    }

    #[test]
    fn test_cache_key_from_request() {
        let key = CacheKey::from_request(
            b"GET",
            "example.com",
            "/bucket/obj",
            Some("versionId=3&acl"),
            true,
        ).unwrap();

        // パラメータはソートされる
        assert_eq!(key.path(), "/bucket/obj?acl&versionId=3");
    }

    #[test]
    fn test_cache_key_from_request_without_query() {
        let key = CacheKey::from_request(
            b"GET",
            "example.com",
            "/bucket/obj",
            Some("versionId=3"),
            false, // クエリを含めない
        ).unwrap();

        assert_eq!(key.path(), "/bucket/obj");
    }

    #[test]
    fn test_signature_params_are_ignored() {
        let a = CacheKey::from_request(
            b"GET",
            "bucket.example.com",
            "/obj.bin",
            Some("X-Amz-Algorithm=AWS4-HMAC-SHA256&X-Amz-Date=20240101T000000Z&X-Amz-Signature=abc"),
            true,
        ).unwrap();
        let b = CacheKey::from_request(
            b"GET",
            "bucket.example.com",
            "/obj.bin",
            Some("x-amz-signature=def&X-Amz-Expires=60"),
            true,
        ).unwrap();

        assert_eq!(a.path(), "/obj.bin");
        assert_eq!(a.hash_value(), b.hash_value());
    }

    #[test]
    fn test_host_normalization() {
        let a = CacheKey::from_request(b"GET", "Example.COM:80", "/x", None, true).unwrap();
        let b = CacheKey::from_request(b"GET", "example.com", "/x", None, true).unwrap();
        let c = CacheKey::from_request(b"GET", "example.com:8080", "/x", None, true).unwrap();

        assert_eq!(a, b);
        assert_ne!(a.hash_value(), c.hash_value());
    }

    #[test]
    fn test_head_shares_get_key() {
        let get = CacheKey::from_request(b"GET", "h", "/a", None, true).unwrap();
        let head = CacheKey::from_request(b"HEAD", "h", "/a", None, true).unwrap();
        assert_eq!(get.hash_value(), head.hash_value());
    }

    #[test]
    fn test_cache_key_hash_difference() {
        let key1 = CacheKey::new(CacheableMethod::Get, "example.com", "/a", None);
        let key2 = CacheKey::new(CacheableMethod::Get, "example.com", "/b", None);

        assert_ne!(key1.hash_value(), key2.hash_value());
    }

    #[test]
    fn test_range_qualified_key() {
        let key = CacheKey::new(CacheableMethod::Get, "h", "/a", None);
        let ranged = key.with_range("bytes=0-99");

        assert_ne!(key.hash_value(), ranged.hash_value());
        assert_eq!(ranged.range(), Some("bytes=0-99"));
        assert_eq!(ranged.without_range(), key);
    }

    #[test]
    fn test_path_components() {
        let key = CacheKey::new(CacheableMethod::Get, "example.com", "/a", None);

        let (dir1, dir2, filename) = path_components(key.hash_value());
        assert_eq!(dir1.len(), 2);
        assert_eq!(dir2.len(), 2);
        assert_eq!(filename, format!("{:016x}.cache", key.hash_value()));
        assert!(filename.starts_with(&dir1));
    }

    #[test]
    fn test_invalid_method() {
        let key = CacheKey::from_request(b"POST", "example.com", "/a", None, true);
        assert!(key.is_none());
    }
}
