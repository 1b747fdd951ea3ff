//! HTTP/1.1 クライアント
//!
//! オリジンおよびキャッシュノードへのリクエストに使用します。
//! スレッドローカルなコネクションプールで接続を再利用し、
//! プールから取り出した接続が既に切れていた場合は新規接続で1回だけ再送します。

use super::{
    buf_get, buf_put, is_chunked_encoding, is_valid_header_name, is_valid_header_value,
    trim_ascii, ChunkedDecoder, Headers, CONNECT_TIMEOUT, READ_TIMEOUT, WRITE_TIMEOUT,
};
use ftlog::{debug, warn};
use httparse::Status;
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use monoio::time::timeout;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::time::{Duration, Instant};

/// バックエンドコネクションプール設定
const POOL_MAX_IDLE_PER_HOST: usize = 8;    // ホストあたりの最大アイドル接続数
const POOL_IDLE_TIMEOUT_SECS: u64 = 30;     // アイドル接続のタイムアウト（秒）

/// レスポンスヘッダーの上限
const MAX_RESPONSE_HEADER_SIZE: usize = 65536;

// ====================
// 接続先
// ====================

/// 接続先（`http://host:port/prefix`）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub path_prefix: String,
}

impl Target {
    /// URL を解析（TLS 終端は前段で行うため http のみ）
    pub fn parse(url: &str) -> Option<Self> {
        let rest = url.strip_prefix("http://")?;

        let (host_port, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };

        let (host, port) = match host_port.rfind(':') {
            Some(idx) => (&host_port[..idx], host_port[idx + 1..].parse().ok()?),
            None => (host_port, 80),
        };
        if host.is_empty() {
            return None;
        }

        Some(Target {
            host: host.to_string(),
            port,
            path_prefix: path.trim_end_matches('/').to_string(),
        })
    }

    /// `host:port`（接続・プールのキー）
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// デフォルトポートかどうかを判定
    #[inline]
    pub fn is_default_port(&self) -> bool {
        self.port == 80
    }

    /// Host ヘッダー値
    pub fn host_header(&self) -> String {
        if self.is_default_port() {
            self.host.clone()
        } else {
            self.authority()
        }
    }

    /// リクエストパスにプレフィックスを付ける
    pub fn request_path(&self, target: &str) -> String {
        if target.starts_with('/') {
            format!("{}{}", self.path_prefix, target)
        } else {
            format!("{}/{}", self.path_prefix, target)
        }
    }
}

/// リクエストヘッダーを組み立てる
///
/// Host と接続管理ヘッダー、ボディのフレーミングは付け直し、不正なヘッダーは除外する
pub fn encode_request(
    method: &str,
    path: &str,
    host_header: &str,
    headers: &[(Box<[u8]>, Box<[u8]>)],
    body: &[u8],
) -> Vec<u8> {
    let mut request = Vec::with_capacity(256 + headers.len() * 48 + body.len());
    request.extend_from_slice(method.as_bytes());
    request.push(b' ');
    request.extend_from_slice(path.as_bytes());
    request.extend_from_slice(b" HTTP/1.1\r\nHost: ");
    request.extend_from_slice(host_header.as_bytes());
    request.extend_from_slice(b"\r\n");

    for (name, value) in headers {
        if name.eq_ignore_ascii_case(b"host")
            || name.eq_ignore_ascii_case(b"connection")
            || name.eq_ignore_ascii_case(b"keep-alive")
            || name.eq_ignore_ascii_case(b"proxy-connection")
            || name.eq_ignore_ascii_case(b"upgrade")
            || name.eq_ignore_ascii_case(b"te")
            || name.eq_ignore_ascii_case(b"content-length")
            || name.eq_ignore_ascii_case(b"transfer-encoding")
        {
            continue;
        }
        if !is_valid_header_name(name) {
            warn!("Invalid header name detected, skipping: {:?}", String::from_utf8_lossy(name));
            continue;
        }
        if !is_valid_header_value(value) {
            warn!(
                "Invalid header value detected (possible header injection), skipping header: {:?}",
                String::from_utf8_lossy(name)
            );
            continue;
        }
        request.extend_from_slice(name);
        request.extend_from_slice(b": ");
        request.extend_from_slice(value);
        request.extend_from_slice(b"\r\n");
    }
    if !body.is_empty() || matches!(method, "POST" | "PUT" | "PATCH") {
        let mut len_buf = itoa::Buffer::new();
        request.extend_from_slice(b"Content-Length: ");
        request.extend_from_slice(len_buf.format(body.len()).as_bytes());
        request.extend_from_slice(b"\r\n");
    }
    request.extend_from_slice(b"Connection: keep-alive\r\n\r\n");
    request.extend_from_slice(body);
    request
}

// ====================
// バックエンドコネクションプール
// ====================

/// プールされた接続のエントリ
struct PooledConnection {
    stream: TcpStream,
    returned_at: Instant,
}

impl PooledConnection {
    /// 接続がまだ有効かどうかを判定（タイムアウトチェック）
    fn is_valid(&self) -> bool {
        self.returned_at.elapsed().as_secs() < POOL_IDLE_TIMEOUT_SECS
    }
}

/// ホスト:ポート単位のアイドル接続プール
struct HttpConnectionPool {
    connections: HashMap<String, VecDeque<PooledConnection>>,
}

impl HttpConnectionPool {
    fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    /// プールから接続を取得（有効な接続がなければNone）
    fn get(&mut self, key: &str) -> Option<TcpStream> {
        let queue = self.connections.get_mut(key)?;
        while let Some(entry) = queue.pop_back() {
            if entry.is_valid() {
                return Some(entry.stream);
            }
        }
        None
    }

    /// 接続をプールに返却
    fn put(&mut self, key: String, stream: TcpStream) {
        let queue = self.connections.entry(key).or_default();
        while queue.len() >= POOL_MAX_IDLE_PER_HOST {
            queue.pop_front();
        }
        queue.push_back(PooledConnection {
            stream,
            returned_at: Instant::now(),
        });
    }
}

thread_local! {
    static HTTP_POOL: RefCell<HttpConnectionPool> = RefCell::new(HttpConnectionPool::new());
}

// ====================
// レスポンスヘッダー
// ====================

/// 解析済みレスポンスヘッダー
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Headers,
    pub content_length: Option<u64>,
    pub is_chunked: bool,
    /// Connection: close かどうか（HTTP/1.1ではデフォルトはkeep-alive）
    pub is_connection_close: bool,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        super::find_header(&self.headers, name)
    }

    /// httparse で解析（データ不足なら `Ok(None)`）
    pub fn parse(data: &[u8]) -> io::Result<Option<(Self, usize)>> {
        let mut headers_storage = [httparse::EMPTY_HEADER; 100];
        let mut response = httparse::Response::new(&mut headers_storage);

        let header_len = match response.parse(data) {
            Ok(Status::Complete(n)) => n,
            Ok(Status::Partial) => return Ok(None),
            Err(e) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid response head: {}", e),
                ))
            }
        };

        let status = response.code.unwrap_or(502);
        let mut content_length = None;
        let mut is_chunked = false;
        let mut is_connection_close = response.version == Some(0);
        let mut headers = Vec::with_capacity(response.headers.len());

        for h in response.headers.iter() {
            if h.name.eq_ignore_ascii_case("content-length") {
                content_length = std::str::from_utf8(trim_ascii(h.value))
                    .ok()
                    .and_then(|s| s.parse().ok());
            } else if h.name.eq_ignore_ascii_case("transfer-encoding") {
                is_chunked = is_chunked_encoding(h.value);
            } else if h.name.eq_ignore_ascii_case("connection") {
                is_connection_close = trim_ascii(h.value).eq_ignore_ascii_case(b"close");
            }
            headers.push((Box::from(h.name.as_bytes()), Box::from(h.value)));
        }

        Ok(Some((
            ResponseHead {
                status,
                headers,
                content_length,
                is_chunked,
                is_connection_close,
            },
            header_len,
        )))
    }
}

// ====================
// レスポンスボディ
// ====================

enum BodyFraming {
    Empty,
    Length(u64),
    Chunked(ChunkedDecoder),
    UntilClose,
}

/// レスポンスボディのストリーム
///
/// 最後まで読み切った接続はプールへ返却される。
/// 途中で破棄した場合は接続ごと捨てる。
pub struct ClientBody {
    stream: Option<TcpStream>,
    pool_key: String,
    framing: BodyFraming,
    pending: Vec<u8>,
    reusable: bool,
    done: bool,
    read_timeout: Duration,
}

impl ClientBody {
    fn new(stream: TcpStream, pool_key: String, head: &ResponseHead, is_head: bool, pending: Vec<u8>, read_timeout: Duration) -> Self {
        let no_body = is_head || head.status == 204 || head.status == 304 || head.status < 200;
        let framing = if no_body {
            BodyFraming::Empty
        } else if head.is_chunked {
            BodyFraming::Chunked(ChunkedDecoder::new())
        } else {
            match head.content_length {
                Some(0) => BodyFraming::Empty,
                Some(n) => BodyFraming::Length(n),
                None => BodyFraming::UntilClose,
            }
        };
        let reusable = !head.is_connection_close && !matches!(framing, BodyFraming::UntilClose);

        let mut body = Self {
            stream: Some(stream),
            pool_key,
            framing,
            pending,
            reusable,
            done: false,
            read_timeout,
        };
        if matches!(body.framing, BodyFraming::Empty) {
            body.finish();
        }
        body
    }

    /// ボディを最後まで読んだか
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.done
    }

    /// 既知のボディ長（Content-Length）
    pub fn remaining_hint(&self) -> Option<u64> {
        match self.framing {
            BodyFraming::Empty => Some(0),
            BodyFraming::Length(n) => Some(n),
            _ => None,
        }
    }

    /// 次のデータを読む（終端なら `None`）
    pub async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            if self.done {
                return Ok(None);
            }

            match &mut self.framing {
                BodyFraming::Empty => {
                    self.finish();
                    return Ok(None);
                }
                BodyFraming::Length(remaining) => {
                    if !self.pending.is_empty() {
                        let take = (*remaining).min(self.pending.len() as u64) as usize;
                        let rest = self.pending.split_off(take);
                        let chunk = std::mem::replace(&mut self.pending, rest);
                        *remaining -= take as u64;
                        if *remaining == 0 {
                            if !self.pending.is_empty() {
                                // 余分なデータがある接続は再利用しない
                                self.reusable = false;
                            }
                            self.finish();
                        }
                        return Ok(Some(chunk));
                    }
                }
                BodyFraming::Chunked(decoder) => {
                    if !self.pending.is_empty() {
                        let mut out = Vec::with_capacity(self.pending.len());
                        let consumed = decoder.decode(&self.pending, &mut out);
                        self.pending.drain(..consumed);
                        if decoder.is_invalid() {
                            self.reusable = false;
                            self.stream = None;
                            self.done = true;
                            return Err(io::Error::new(io::ErrorKind::InvalidData, "malformed chunked body"));
                        }
                        if decoder.is_complete() {
                            if !self.pending.is_empty() {
                                self.reusable = false;
                            }
                            self.finish();
                        }
                        if !out.is_empty() {
                            return Ok(Some(out));
                        }
                        continue;
                    }
                }
                BodyFraming::UntilClose => {
                    if !self.pending.is_empty() {
                        return Ok(Some(std::mem::take(&mut self.pending)));
                    }
                }
            }

            if !self.fill().await? {
                if matches!(self.framing, BodyFraming::UntilClose) {
                    self.reusable = false;
                    self.finish();
                    return Ok(None);
                }
                self.reusable = false;
                self.stream = None;
                self.done = true;
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "body truncated"));
            }
        }
    }

    /// 全体を読み込む
    pub async fn collect(mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.remaining_hint().unwrap_or(0).min(1 << 24) as usize);
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// ソケットから読んで `pending` を補充（EOF なら false）
    async fn fill(&mut self) -> io::Result<bool> {
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Ok(false),
        };
        let buf = buf_get();
        let (res, returned) = match timeout(self.read_timeout, stream.read(buf)).await {
            Ok(r) => r,
            Err(_) => {
                self.stream = None;
                return Err(io::Error::new(io::ErrorKind::TimedOut, "body read timeout"));
            }
        };
        match res {
            Ok(0) => {
                buf_put(returned);
                Ok(false)
            }
            Ok(n) => {
                self.pending.extend_from_slice(&returned[..n]);
                buf_put(returned);
                Ok(true)
            }
            Err(e) => {
                buf_put(returned);
                self.stream = None;
                Err(e)
            }
        }
    }

    fn finish(&mut self) {
        self.done = true;
        if let Some(stream) = self.stream.take() {
            if self.reusable {
                let key = std::mem::take(&mut self.pool_key);
                HTTP_POOL.with(|p| p.borrow_mut().put(key, stream));
            }
        }
    }
}

// ====================
// クライアント
// ====================

/// 送信失敗の分類
enum ExchangeError {
    /// 再利用した接続が既に切れていた（再送可能）
    Stale(io::Error),
    Fatal(io::Error),
}

/// HTTP/1.1 クライアント
#[derive(Debug, Clone)]
pub struct HttpClient {
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            read_timeout: READ_TIMEOUT,
        }
    }
}

impl HttpClient {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_timeout,
        }
    }

    /// リクエストを送信してレスポンスヘッダーを受け取る
    ///
    /// `request` はヘッダーとボディを連結したもの
    pub async fn send(
        &self,
        target: &Target,
        request: &[u8],
        is_head: bool,
    ) -> io::Result<(ResponseHead, ClientBody)> {
        let pool_key = target.authority();

        if let Some(stream) = HTTP_POOL.with(|p| p.borrow_mut().get(&pool_key)) {
            match self.exchange(stream, request).await {
                Ok((stream, head, pending)) => {
                    let body = ClientBody::new(stream, pool_key, &head, is_head, pending, self.read_timeout);
                    return Ok((head, body));
                }
                Err(ExchangeError::Stale(e)) => {
                    debug!("Pooled connection to {} was stale ({}), reconnecting", pool_key, e);
                }
                Err(ExchangeError::Fatal(e)) => return Err(e),
            }
        }

        let stream = self.connect(&pool_key).await?;
        match self.exchange(stream, request).await {
            Ok((stream, head, pending)) => {
                let body = ClientBody::new(stream, pool_key, &head, is_head, pending, self.read_timeout);
                Ok((head, body))
            }
            Err(ExchangeError::Stale(e)) | Err(ExchangeError::Fatal(e)) => Err(e),
        }
    }

    async fn connect(&self, addr: &str) -> io::Result<TcpStream> {
        match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timeout to {}", addr),
            )),
        }
    }

    /// リクエストを書き込み、レスポンスヘッダーを読む
    async fn exchange(
        &self,
        mut stream: TcpStream,
        request: &[u8],
    ) -> Result<(TcpStream, ResponseHead, Vec<u8>), ExchangeError> {
        match timeout(WRITE_TIMEOUT, stream.write_all(request.to_vec())).await {
            Ok((Ok(_), _)) => {}
            Ok((Err(e), _)) => return Err(ExchangeError::Stale(e)),
            Err(_) => {
                return Err(ExchangeError::Fatal(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "request write timeout",
                )))
            }
        }

        let mut accumulated: Vec<u8> = Vec::with_capacity(4096);
        loop {
            let buf = buf_get();
            let (res, returned) = match timeout(self.read_timeout, stream.read(buf)).await {
                Ok(r) => r,
                Err(_) => {
                    return Err(ExchangeError::Fatal(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "response read timeout",
                    )))
                }
            };
            let n = match res {
                Ok(0) => {
                    buf_put(returned);
                    let e = io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed before response");
                    return Err(if accumulated.is_empty() {
                        ExchangeError::Stale(e)
                    } else {
                        ExchangeError::Fatal(e)
                    });
                }
                Ok(n) => n,
                Err(e) => {
                    buf_put(returned);
                    return Err(if accumulated.is_empty() {
                        ExchangeError::Stale(e)
                    } else {
                        ExchangeError::Fatal(e)
                    });
                }
            };
            accumulated.extend_from_slice(&returned[..n]);
            buf_put(returned);

            loop {
                match ResponseHead::parse(&accumulated).map_err(ExchangeError::Fatal)? {
                    Some((head, header_len)) if (100..200).contains(&head.status) && head.status != 101 => {
                        // 1xx 中間レスポンスは読み捨てる
                        accumulated.drain(..header_len);
                        if accumulated.is_empty() {
                            break;
                        }
                    }
                    Some((head, header_len)) => {
                        let pending = accumulated.split_off(header_len);
                        return Ok((stream, head, pending));
                    }
                    None => break,
                }
            }

            if accumulated.len() > MAX_RESPONSE_HEADER_SIZE {
                return Err(ExchangeError::Fatal(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "response header too large",
                )));
            }
        }
    }
}
