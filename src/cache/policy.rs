//! キャッシュポリシー
//!
//! Cache-Controlヘッダーの解析、キャッシュ可否判定、
//! 保存してはいけないヘッダーの除外を行います。

use super::entry::HeaderList;

/// 保存しない認証・署名系ヘッダー
///
/// オリジンへのリクエストにはそのまま転送するが、メタデータには残さない
const AUTH_HEADERS: &[&[u8]] = &[
    b"authorization",
    b"proxy-authorization",
    b"x-amz-security-token",
    b"x-amz-date",
    b"x-amz-content-sha256",
    b"set-cookie",
];

/// Hop-by-hopヘッダー
const HOP_BY_HOP_HEADERS: &[&[u8]] = &[
    b"connection",
    b"keep-alive",
    b"transfer-encoding",
    b"proxy-connection",
    b"te",
    b"trailer",
    b"upgrade",
];

/// Varyヘッダー解析結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaryResult {
    /// Varyヘッダーが存在しない
    NotPresent,
    /// Vary: * でキャッシュ不可
    Uncacheable,
    /// Varyヘッダーで指定されたヘッダー名のリスト
    Headers(Vec<String>),
}

impl VaryResult {
    /// キャッシュ可能かどうか
    #[inline]
    pub fn is_cacheable(&self) -> bool {
        !matches!(self, VaryResult::Uncacheable)
    }
}

/// Cache-Control ディレクティブ
#[derive(Debug, Clone, Default)]
pub struct CacheControl {
    /// max-age（秒）
    pub max_age: Option<u64>,
    /// s-maxage（秒、プロキシ用）
    pub s_maxage: Option<u64>,
    /// no-cache フラグ
    pub no_cache: bool,
    /// no-store フラグ
    pub no_store: bool,
    /// private フラグ
    pub private: bool,
    /// public フラグ
    pub public: bool,
}

impl CacheControl {
    /// Cache-Controlヘッダー値をパース
    pub fn parse(value: &[u8]) -> Self {
        let mut cc = Self::default();

        let value_str = match std::str::from_utf8(value) {
            Ok(s) => s,
            Err(_) => return cc,
        };

        for directive in value_str.split(',') {
            let directive = directive.trim().to_lowercase();

            if directive == "no-cache" {
                cc.no_cache = true;
            } else if directive == "no-store" {
                cc.no_store = true;
            } else if directive == "private" {
                cc.private = true;
            } else if directive == "public" {
                cc.public = true;
            } else if let Some(value) = directive.strip_prefix("max-age=") {
                cc.max_age = value.trim_matches('"').parse().ok();
            } else if let Some(value) = directive.strip_prefix("s-maxage=") {
                cc.s_maxage = value.trim_matches('"').parse().ok();
            }
        }

        cc
    }

    /// プロキシでキャッシュ可能かどうか
    pub fn is_cacheable(&self) -> bool {
        // no-store / private はプロキシでキャッシュ不可
        !(self.no_store || self.private)
    }

    /// プロキシ用のTTL（秒）を取得
    ///
    /// 優先順位: s-maxage > max-age > デフォルト
    pub fn effective_ttl(&self, default_ttl: u64) -> u64 {
        self.s_maxage
            .or(self.max_age)
            .unwrap_or(default_ttl)
    }
}

/// キャッシュポリシー
///
/// リクエストとレスポンスからキャッシュ可否を判定します。
pub struct CachePolicy;

impl CachePolicy {
    /// レスポンスがキャッシュ可能かどうかを判定
    ///
    /// # Arguments
    ///
    /// * `status_code` - HTTPステータスコード
    /// * `response_headers` - レスポンスヘッダー
    /// * `cacheable_statuses` - キャッシュ可能なステータスコードのリスト
    /// * `default_ttl` - デフォルトTTL
    /// * `respect_vary` - Vary: * を保存不可として扱うか
    ///
    /// # Returns
    ///
    /// キャッシュ可能な場合はTTL（秒）を返す
    pub fn check_response(
        status_code: u16,
        response_headers: &[(Box<[u8]>, Box<[u8]>)],
        cacheable_statuses: &[u16],
        default_ttl: u64,
        respect_vary: bool,
    ) -> Option<u64> {
        // ステータスコードチェック
        if !cacheable_statuses.contains(&status_code) {
            return None;
        }

        // Cache-Controlヘッダーを取得
        let cache_control = response_headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(b"cache-control"))
            .map(|(_, value)| CacheControl::parse(value))
            .unwrap_or_default();

        if !cache_control.is_cacheable() {
            return None;
        }

        if respect_vary && !Self::parse_vary_ex(response_headers).is_cacheable() {
            return None;
        }

        let ttl = cache_control.effective_ttl(default_ttl);

        // TTLが0の場合はキャッシュしない
        if ttl == 0 {
            return None;
        }

        Some(ttl)
    }

    /// Varyヘッダーを解析
    ///
    /// 戻り値:
    /// - `VaryResult::NotPresent` - Varyヘッダーなし
    /// - `VaryResult::Uncacheable` - Vary: * でキャッシュ不可
    /// - `VaryResult::Headers(vec)` - Varyヘッダーのリスト
    pub fn parse_vary_ex(response_headers: &[(Box<[u8]>, Box<[u8]>)]) -> VaryResult {
        let vary_header = response_headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(b"vary"))
            .map(|(_, value)| value);

        let vary_header = match vary_header {
            Some(h) => h,
            None => return VaryResult::NotPresent,
        };

        let vary_str = match std::str::from_utf8(vary_header) {
            Ok(s) => s,
            Err(_) => return VaryResult::NotPresent,
        };

        // Vary: * はキャッシュ不可
        if vary_str.split(',').any(|s| s.trim() == "*") {
            return VaryResult::Uncacheable;
        }

        let headers: Vec<String> = vary_str
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        VaryResult::Headers(headers)
    }

    /// リクエストがキャッシュをバイパスすべきかチェック
    ///
    /// Pragma: no-cache や Cache-Control: no-cache / no-store をチェック
    pub fn request_bypasses_cache(request_headers: &[(Box<[u8]>, Box<[u8]>)]) -> bool {
        for (name, value) in request_headers {
            if name.eq_ignore_ascii_case(b"cache-control") {
                let cc = CacheControl::parse(value);
                if cc.no_cache || cc.no_store {
                    return true;
                }
            } else if name.eq_ignore_ascii_case(b"pragma")
                && value.eq_ignore_ascii_case(b"no-cache")
            {
                return true;
            }
        }
        false
    }

    /// If-None-Match ヘッダーを取得
    pub fn get_if_none_match(request_headers: &[(Box<[u8]>, Box<[u8]>)]) -> Option<&[u8]> {
        request_headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(b"if-none-match"))
            .map(|(_, value)| value.as_ref())
    }

    /// If-None-Match がETagにマッチするか
    ///
    /// `*` と弱いETag（`W/`）を考慮したカンマ区切りの比較
    pub fn etag_matches(if_none_match: &[u8], etag: &str) -> bool {
        let strip = |s: &[u8]| -> Vec<u8> {
            let s = trim_ascii(s);
            s.strip_prefix(b"W/").unwrap_or(s).to_vec()
        };
        let target = strip(etag.as_bytes());

        if_none_match
            .split(|&b| b == b',')
            .map(trim_ascii)
            .any(|candidate| candidate == b"*" || strip(candidate) == target)
    }

    /// 認証・署名系ヘッダーか
    #[inline]
    pub fn is_auth_header(name: &[u8]) -> bool {
        AUTH_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
    }

    /// Hop-by-hopヘッダーか
    #[inline]
    pub fn is_hop_by_hop(name: &[u8]) -> bool {
        HOP_BY_HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
    }

    /// メタデータへ保存できるヘッダーだけを抽出
    ///
    /// Content-Length はボディサイズから再生成するため保存しない
    pub fn storable_headers(response_headers: &[(Box<[u8]>, Box<[u8]>)]) -> HeaderList {
        response_headers
            .iter()
            .filter(|(name, _)| {
                !Self::is_auth_header(name)
                    && !Self::is_hop_by_hop(name)
                    && !name.eq_ignore_ascii_case(b"content-length")
            })
            .cloned()
            .collect()
    }
}

#[inline]
fn trim_ascii(s: &[u8]) -> &[u8] {
    let start = s.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(s.len());
    let end = s.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |p| p + 1);
    &s[start..end]
}
