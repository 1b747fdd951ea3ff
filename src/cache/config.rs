//! キャッシュ設定

use serde::Deserialize;

/// デフォルト値関数
fn default_ttl() -> u64 { 24 * 60 * 60 } // 24時間
fn default_cacheable_methods() -> Vec<String> {
    vec!["GET".to_string(), "HEAD".to_string()]
}
fn default_cacheable_statuses() -> Vec<u16> {
    vec![200, 206, 301, 302]
}
fn default_large_object_threshold() -> u64 { 10 * 1024 * 1024 } // 10MiB
fn default_eviction_budget() -> usize { 64 }
fn default_sweep_interval() -> u64 { 60 }
fn default_true() -> bool { true }

/// Range付きリクエストがミスしたときの取得方針
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RangePolicy {
    /// オブジェクト全体を取得・保存し、要求範囲を切り出して返す
    #[default]
    Full,
    /// 要求範囲だけをオリジンへ転送し、範囲付きキーで保存する
    Requested,
}

/// キャッシュ設定
#[derive(Deserialize, Clone, Debug)]
pub struct CacheConfig {
    /// デフォルトTTL（秒）
    ///
    /// Cache-Control（s-maxage / max-age）がない場合に使用
    ///
    /// デフォルト: 86400秒（24時間）
    #[serde(default = "default_ttl")]
    pub default_ttl_secs: u64,

    /// キャッシュ対象HTTPメソッド
    ///
    /// デフォルト: ["GET", "HEAD"]
    #[serde(default = "default_cacheable_methods")]
    pub methods: Vec<String>,

    /// キャッシュ対象ステータスコード
    ///
    /// デフォルト: [200, 206, 301, 302]
    #[serde(default = "default_cacheable_statuses")]
    pub cacheable_statuses: Vec<u16>,

    /// キャッシュ除外パスパターン（globパターン）
    ///
    /// 例: ["/api/user/*", "/api/session"]
    #[serde(default)]
    pub bypass_patterns: Vec<String>,

    /// キャッシュキーにクエリパラメータを含めるか
    ///
    /// 署名パラメータ（X-Amz-*）は常に除外されます
    ///
    /// デフォルト: true
    #[serde(default = "default_true")]
    pub include_query: bool,

    /// Vary: * のレスポンスを保存しない
    ///
    /// デフォルト: true
    #[serde(default = "default_true")]
    pub respect_vary: bool,

    /// 大きいオブジェクトとして扱う閾値（バイト）
    ///
    /// これ以上のボディはメモリに載せずステージングファイルへ直接書き込む
    ///
    /// デフォルト: 10MiB
    #[serde(default = "default_large_object_threshold")]
    pub large_object_threshold: u64,

    /// 1回の書き込みで追い出せるエントリ数の上限
    ///
    /// デフォルト: 64
    #[serde(default = "default_eviction_budget")]
    pub eviction_budget: usize,

    /// Rangeミス時の取得方針（"full" / "requested"）
    ///
    /// デフォルト: "full"
    #[serde(default)]
    pub range_policy: RangePolicy,

    /// 期限切れエントリ掃除の間隔（秒）
    ///
    /// 0で無効
    ///
    /// デフォルト: 60秒
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl(),
            methods: default_cacheable_methods(),
            cacheable_statuses: default_cacheable_statuses(),
            bypass_patterns: Vec::new(),
            include_query: true,
            respect_vary: true,
            large_object_threshold: default_large_object_threshold(),
            eviction_budget: default_eviction_budget(),
            range_policy: RangePolicy::Full,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl CacheConfig {
    /// メソッドがキャッシュ対象かチェック
    #[inline]
    pub fn is_cacheable_method(&self, method: &[u8]) -> bool {
        self.methods.iter().any(|m| m.as_bytes().eq_ignore_ascii_case(method))
    }

    /// ステータスコードがキャッシュ対象かチェック
    #[inline]
    pub fn is_cacheable_status(&self, status: u16) -> bool {
        self.cacheable_statuses.contains(&status)
    }

    /// パスがバイパスパターンにマッチするかチェック
    pub fn should_bypass(&self, path: &str) -> bool {
        for pattern in &self.bypass_patterns {
            if let Ok(glob) = glob::Pattern::new(pattern) {
                if glob.matches(path) {
                    return true;
                }
            }
        }
        false
    }

    /// ボディサイズが大きいオブジェクト経路の対象か
    #[inline]
    pub fn is_large_object(&self, size: u64) -> bool {
        size >= self.large_object_threshold
    }
}
