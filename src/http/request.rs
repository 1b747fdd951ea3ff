//! クライアントリクエストの解析とボディ読み込み

use super::{
    buf_get, buf_put, is_chunked_encoding, trim_ascii, ChunkedDecoder, Headers, MAX_BODY_SIZE,
    READ_TIMEOUT,
};
use httparse::Status;
use monoio::io::AsyncReadRent;
use monoio::net::TcpStream;
use monoio::time::timeout;
use std::io;

/// 解析済みリクエスト
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Box<str>,
    /// パス（クエリ含む）
    pub target: Box<str>,
    pub host: Box<str>,
    pub headers: Headers,
    pub content_length: usize,
    pub is_chunked: bool,
    /// Keep-Alive を継続するか（HTTP/1.1 は Connection: close がなければ継続）
    pub keep_alive: bool,
}

impl Request {
    /// クエリを除いたパス
    pub fn path(&self) -> &str {
        match self.target.split_once('?') {
            Some((path, _)) => path,
            None => &self.target,
        }
    }

    /// クエリ文字列（`?` 以降）
    pub fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, q)| q)
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        super::find_header(&self.headers, name)
    }

    #[inline]
    pub fn is_method(&self, method: &str) -> bool {
        self.method.eq_ignore_ascii_case(method)
    }

    /// ボディを持つか
    #[inline]
    pub fn has_body(&self) -> bool {
        self.is_chunked || self.content_length > 0
    }

    pub fn user_agent(&self) -> &[u8] {
        self.header("user-agent").unwrap_or(b"-")
    }
}

/// 解析結果
#[derive(Debug)]
pub enum ParseOutcome {
    /// ヘッダー完了（ヘッダー長）
    Complete(Request, usize),
    /// データ不足
    Partial,
    /// 不正なリクエスト
    Invalid,
    /// ボディが上限を超える
    TooLarge,
}

/// リクエストヘッダーを解析
pub fn parse_request(data: &[u8]) -> ParseOutcome {
    let mut headers_storage = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers_storage);

    let header_len = match req.parse(data) {
        Ok(Status::Complete(n)) => n,
        Ok(Status::Partial) => return ParseOutcome::Partial,
        Err(_) => return ParseOutcome::Invalid,
    };

    let method: Box<str> = req.method.unwrap_or("GET").into();
    let target: Box<str> = req.path.unwrap_or("/").into();
    let http10 = req.version == Some(0);

    let mut host: Box<str> = "".into();
    let mut content_length: Option<usize> = None;
    let mut is_chunked = false;
    let mut connection_close = http10;
    let mut headers = Vec::with_capacity(req.headers.len());

    for h in req.headers.iter() {
        if h.name.is_empty() {
            continue;
        }
        if h.name.eq_ignore_ascii_case("host") {
            host = String::from_utf8_lossy(trim_ascii(h.value)).into();
        } else if h.name.eq_ignore_ascii_case("content-length") {
            let parsed = std::str::from_utf8(trim_ascii(h.value))
                .ok()
                .and_then(|s| s.parse::<usize>().ok());
            match (parsed, content_length) {
                (None, _) => return ParseOutcome::Invalid,
                // 値の異なる重複 Content-Length は拒否
                (Some(v), Some(prev)) if v != prev => return ParseOutcome::Invalid,
                (Some(v), _) => content_length = Some(v),
            }
        } else if h.name.eq_ignore_ascii_case("transfer-encoding") {
            is_chunked = is_chunked_encoding(h.value);
        } else if h.name.eq_ignore_ascii_case("connection") {
            let v = trim_ascii(h.value);
            if v.eq_ignore_ascii_case(b"close") {
                connection_close = true;
            } else if v.eq_ignore_ascii_case(b"keep-alive") {
                connection_close = false;
            }
        }
        headers.push((Box::from(h.name.as_bytes()), Box::from(h.value)));
    }

    // Transfer-Encoding と Content-Length の併用はスマグリング対策で拒否
    if is_chunked && content_length.is_some() {
        return ParseOutcome::Invalid;
    }
    let content_length = content_length.unwrap_or(0);
    if !is_chunked && content_length > MAX_BODY_SIZE {
        return ParseOutcome::TooLarge;
    }

    ParseOutcome::Complete(
        Request {
            method,
            target,
            host,
            headers,
            content_length,
            is_chunked,
            keep_alive: !connection_close,
        },
        header_len,
    )
}

/// リクエストボディを読み込む
///
/// `pending` はヘッダー以降に受信済みのデータ。ボディはフレーミングを含めて
/// 受信したまま（chunked ならチャンク形式のまま）返し、
/// ボディ以降のデータ（パイプライン化された次のリクエスト）は `pending` に残す。
pub async fn read_request_body(
    stream: &mut TcpStream,
    req: &Request,
    pending: &mut Vec<u8>,
) -> io::Result<Vec<u8>> {
    if req.is_chunked {
        let mut decoder = ChunkedDecoder::new();
        let mut body = Vec::new();
        loop {
            let mut sink = Vec::new();
            let consumed = decoder.decode(&pending[..], &mut sink);
            body.extend_from_slice(&pending[..consumed]);
            pending.drain(..consumed);

            if decoder.is_complete() {
                return Ok(body);
            }
            if decoder.is_invalid() {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "malformed chunked body"));
            }
            if body.len() > MAX_BODY_SIZE {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "request body too large"));
            }
            read_more(stream, pending).await?;
        }
    }

    while pending.len() < req.content_length {
        read_more(stream, pending).await?;
    }
    let rest = pending.split_off(req.content_length);
    Ok(std::mem::replace(pending, rest))
}

/// ソケットから追加で読み込んで `pending` に追記
async fn read_more(stream: &mut TcpStream, pending: &mut Vec<u8>) -> io::Result<()> {
    let buf = buf_get();
    let (res, returned) = match timeout(READ_TIMEOUT, stream.read(buf)).await {
        Ok(r) => r,
        Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "read timeout")),
    };
    let n = match res {
        Ok(0) => {
            buf_put(returned);
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"));
        }
        Ok(n) => n,
        Err(e) => {
            buf_put(returned);
            return Err(e);
        }
    };
    pending.extend_from_slice(&returned[..n]);
    buf_put(returned);
    Ok(())
}
