//! # オリジン
//!
//! キャッシュミス時の取得先（S3 等のオブジェクトストレージ）へのインターフェースです。
//! ノードキャッシュエンジンは `Origin` トレイト経由でのみオリジンと通信します。

use crate::error::CacheError;
use crate::http::{encode_request, ClientBody, Headers, HttpClient, Target};
use std::io;
use std::time::Duration;

/// オリジンへのリクエスト
#[derive(Debug, Clone)]
pub struct OriginRequest {
    pub method: Box<str>,
    /// パス（クエリ含む、署名パラメータもそのまま）
    pub target: Box<str>,
    pub headers: Headers,
    /// リクエストボディ（受信したフレーミングのまま）
    pub body: Vec<u8>,
}

impl OriginRequest {
    pub fn new(method: &str, target: &str, headers: Headers) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            headers,
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    #[inline]
    pub fn is_head(&self) -> bool {
        self.method.eq_ignore_ascii_case("HEAD")
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        crate::http::find_header(&self.headers, name)
    }
}

/// オリジンのレスポンス（ボディはストリーム）
pub struct OriginResponse<B> {
    pub status: u16,
    pub headers: Headers,
    /// Content-Length（不明なら `None`）
    pub content_length: Option<u64>,
    pub body: B,
}

/// レスポンスボディのストリーム
pub trait OriginBody {
    /// 次のデータ（終端なら `None`）
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, CacheError>;
}

/// オリジン
pub trait Origin: Send + Sync + 'static {
    type Body: OriginBody + 'static;

    async fn send(&self, request: &OriginRequest) -> Result<OriginResponse<Self::Body>, CacheError>;
}

impl<T: Origin> Origin for std::sync::Arc<T> {
    type Body = T::Body;

    async fn send(&self, request: &OriginRequest) -> Result<OriginResponse<T::Body>, CacheError> {
        (**self).send(request).await
    }
}

/// I/O エラーをオリジンエラーへ変換
pub fn origin_error(e: io::Error) -> CacheError {
    match e.kind() {
        io::ErrorKind::TimedOut => CacheError::OriginTimeout,
        _ => CacheError::OriginUnreachable(e.to_string()),
    }
}

// ====================
// HTTP オリジン
// ====================

/// HTTP/1.1 オリジン
#[derive(Debug, Clone)]
pub struct HttpOrigin {
    target: Target,
    client: HttpClient,
}

impl HttpOrigin {
    pub fn new(target: Target, connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            target,
            client: HttpClient::new(connect_timeout, read_timeout),
        }
    }

    /// URL（`http://host:port/prefix`）から作成
    pub fn from_url(url: &str, connect_timeout: Duration, read_timeout: Duration) -> Option<Self> {
        Target::parse(url).map(|t| Self::new(t, connect_timeout, read_timeout))
    }

    pub fn target(&self) -> &Target {
        &self.target
    }
}

/// HTTP オリジンのボディ
pub struct HttpOriginBody(ClientBody);

impl From<ClientBody> for HttpOriginBody {
    fn from(body: ClientBody) -> Self {
        Self(body)
    }
}

impl OriginBody for HttpOriginBody {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, CacheError> {
        self.0.next_chunk().await.map_err(origin_error)
    }
}

impl Origin for HttpOrigin {
    type Body = HttpOriginBody;

    async fn send(&self, request: &OriginRequest) -> Result<OriginResponse<HttpOriginBody>, CacheError> {
        let path = self.target.request_path(&request.target);
        let raw = encode_request(
            &request.method,
            &path,
            &self.target.host_header(),
            &request.headers,
            &request.body,
        );

        let (head, body) = self
            .client
            .send(&self.target, &raw, request.is_head())
            .await
            .map_err(origin_error)?;

        Ok(OriginResponse {
            status: head.status,
            content_length: if request.is_head() { head.content_length } else { body.remaining_hint() },
            headers: head.headers,
            body: HttpOriginBody(body),
        })
    }
}

/// ボディを最後まで読み込む
pub async fn collect_body<B: OriginBody>(body: &mut B) -> Result<Vec<u8>, CacheError> {
    let mut out = Vec::new();
    while let Some(chunk) = body.next_chunk().await? {
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

// ====================
// テスト用モックオリジン
// ====================
