//! # HTTP/1.1 プリミティブ
//!
//! クライアント側リクエストの解析、オリジン／ノードへのクライアント、
//! Chunked デコーダ、レスポンスヘッダーの組み立てを提供します。
//!
//! すべてのソケット操作は monoio の所有権ベースI/O（`Vec<u8>` の受け渡し）と
//! `monoio::time::timeout` で行います。

mod chunked;
mod client;
mod request;

pub use chunked::ChunkedDecoder;
pub use client::{encode_request, ClientBody, HttpClient, ResponseHead, Target};
pub use request::{parse_request, read_request_body, ParseOutcome, Request};

use monoio::io::AsyncWriteRentExt;
use monoio::net::TcpStream;
use monoio::time::timeout;
use std::cell::RefCell;
use std::io;
use std::time::Duration;

// ====================
// 定数定義
// ====================

/// 固定エラーレスポンス
pub static ERR_MSG_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
pub static ERR_MSG_REQUEST_TOO_LARGE: &[u8] = b"HTTP/1.1 413 Request Entity Too Large\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// バッファサイズ設定
pub const BUF_SIZE: usize = 65536;           // 64KB - io_uring最適サイズ

/// セキュリティ制限
pub const MAX_HEADER_SIZE: usize = 8192;     // 8KB - ヘッダーサイズ上限
pub const MAX_BODY_SIZE: usize = 10485760;   // 10MB - リクエストボディサイズ上限

/// タイムアウト設定
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// ヘッダー型（名前, 値）
pub type Headers = Vec<(Box<[u8]>, Box<[u8]>)>;

// ====================
// バッファプール
// ====================
//
// monoioのAsyncWriteRentExtはバッファの所有権を取るため、
// スレッドローカルのプールで64KBバッファを使い回します。
// ====================

thread_local! {
    static BUF_POOL: RefCell<Vec<Vec<u8>>> = RefCell::new(
        (0..32).map(|_| vec![0u8; BUF_SIZE]).collect()
    );
}

/// バッファ取得ヘルパー
#[inline(always)]
pub fn buf_get() -> Vec<u8> {
    BUF_POOL.with(|p| {
        p.borrow_mut().pop().unwrap_or_else(|| vec![0u8; BUF_SIZE])
    })
}

/// バッファ返却ヘルパー
///
/// 前回のデータが残らないよう長さをクリアしてからゼロ初期化する
#[inline(always)]
pub fn buf_put(mut buf: Vec<u8>) {
    BUF_POOL.with(|p| {
        let mut pool = p.borrow_mut();
        if pool.len() < 128 {
            buf.clear();
            buf.resize(BUF_SIZE, 0);
            pool.push(buf);
        }
    });
}

// ====================
// 書き込みヘルパー
// ====================

/// タイムアウト付きで全バイトを書き込む
pub async fn write_all(stream: &mut TcpStream, buf: Vec<u8>) -> io::Result<Vec<u8>> {
    match timeout(WRITE_TIMEOUT, stream.write_all(buf)).await {
        Ok((Ok(_), returned)) => Ok(returned),
        Ok((Err(e), _)) => Err(e),
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timeout")),
    }
}

/// `Transfer-Encoding: chunked` 形式で1チャンクを書き込む
pub async fn write_chunk(stream: &mut TcpStream, data: &[u8]) -> io::Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    let mut frame = Vec::with_capacity(data.len() + 20);
    frame.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    frame.extend_from_slice(data);
    frame.extend_from_slice(b"\r\n");
    write_all(stream, frame).await.map(|_| ())
}

/// Chunked ボディの終端を書き込む
pub async fn write_last_chunk(stream: &mut TcpStream) -> io::Result<()> {
    write_all(stream, b"0\r\n\r\n".to_vec()).await.map(|_| ())
}

// ====================
// HTTPヘッダー検証（Header Injection防止）
// ====================
//
// httparseがパースしたヘッダーを再検証し、不正な文字を含む
// ヘッダーを転送前に除外します。
// ====================

/// ヘッダー名が有効か検証（RFC 7230 token準拠）
///
/// token = 1*tchar
/// tchar = "!" / "#" / "$" / "%" / "&" / "'" / "*" / "+" / "-" / "." /
///         "^" / "_" / "`" / "|" / "~" / DIGIT / ALPHA
#[inline]
pub fn is_valid_header_name(name: &[u8]) -> bool {
    !name.is_empty()
        && name.iter().all(|&b| {
            matches!(b,
                b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
                b'^' | b'_' | b'`' | b'|' | b'~' |
                b'0'..=b'9' | b'A'..=b'Z' | b'a'..=b'z'
            )
        })
}

/// ヘッダー値が有効か検証
///
/// CR / LF / NUL を禁止する（obs-fold も許容しない）
#[inline]
pub fn is_valid_header_value(value: &[u8]) -> bool {
    !value.iter().any(|&b| b == b'\r' || b == b'\n' || b == 0)
}

/// Transfer-Encoding ヘッダー値から chunked かどうかを判定
#[inline]
pub fn is_chunked_encoding(value: &[u8]) -> bool {
    value
        .split(|&b| b == b',')
        .any(|part| trim_ascii(part).eq_ignore_ascii_case(b"chunked"))
}

/// 前後の空白（SP / HTAB）を除去
#[inline]
pub fn trim_ascii(value: &[u8]) -> &[u8] {
    let start = value.iter().position(|&b| b != b' ' && b != b'\t').unwrap_or(value.len());
    let end = value.iter().rposition(|&b| b != b' ' && b != b'\t').map_or(start, |i| i + 1);
    &value[start..end]
}

/// ヘッダーを大文字小文字を区別せずに検索
pub fn find_header<'a>(headers: &'a [(Box<[u8]>, Box<[u8]>)], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name.as_bytes()))
        .map(|(_, v)| v.as_ref())
}

/// ステータスコードの理由句
pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Request Entity Too Large",
        416 => "Range Not Satisfiable",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

// ====================
// レスポンスヘッダー組み立て
// ====================

/// ボディのフレーミング
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `Content-Length: n`
    Length(u64),
    /// `Transfer-Encoding: chunked`
    Chunked,
    /// ボディなし（304 等）
    None,
}

/// レスポンスヘッダーを組み立てる
///
/// フレーミング関連（Content-Length / Transfer-Encoding / Connection）は
/// 引数から付け直すため、`headers` 内の同名ヘッダーは無視する。
pub fn encode_response_head(
    status: u16,
    headers: &[(Box<[u8]>, Box<[u8]>)],
    framing: Framing,
    keep_alive: bool,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + headers.len() * 48);
    let mut num = itoa::Buffer::new();

    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(num.format(status).as_bytes());
    out.push(b' ');
    out.extend_from_slice(status_text(status).as_bytes());
    out.extend_from_slice(b"\r\n");

    for (name, value) in headers {
        if name.eq_ignore_ascii_case(b"content-length")
            || name.eq_ignore_ascii_case(b"transfer-encoding")
            || name.eq_ignore_ascii_case(b"connection")
            || name.eq_ignore_ascii_case(b"keep-alive")
        {
            continue;
        }
        if !is_valid_header_name(name) || !is_valid_header_value(value) {
            continue;
        }
        out.extend_from_slice(name);
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }

    match framing {
        Framing::Length(len) => {
            out.extend_from_slice(b"Content-Length: ");
            out.extend_from_slice(num.format(len).as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Framing::Chunked => out.extend_from_slice(b"Transfer-Encoding: chunked\r\n"),
        Framing::None => {}
    }

    if keep_alive {
        out.extend_from_slice(b"Connection: keep-alive\r\n\r\n");
    } else {
        out.extend_from_slice(b"Connection: close\r\n\r\n");
    }
    out
}

/// ボディ付きの小さなレスポンスを組み立てる（/health 等）
pub fn simple_response(status: u16, content_type: &str, body: &[u8], keep_alive: bool) -> Vec<u8> {
    let headers: Headers = vec![(Box::from(&b"Content-Type"[..]), Box::from(content_type.as_bytes()))];
    let mut out = encode_response_head(status, &headers, Framing::Length(body.len() as u64), keep_alive);
    out.extend_from_slice(body);
    out
}

/// ボディなしのエラーレスポンス
pub fn error_response(status: u16) -> Vec<u8> {
    encode_response_head(status, &[], Framing::Length(0), false)
}
