//! テスト用共通ヘルパーモジュール
//!
//! 統合テストで使用するオリジンのモックとサーバー起動、HTTPクライアントを提供します。

#![allow(dead_code)]

use shardcache::server::{create_listener, serve_connection, RequestHandler};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// 動的に空きポートを取得
pub fn get_available_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

// ====================
// オリジンのモック
// ====================

/// リクエスト数を数えるオリジン（S3 の代わり）
///
/// どのパスにも同じボディを返す。接続ごとにスレッドを立て、Keep-Alive に対応する。
pub struct CountingOrigin {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl CountingOrigin {
    /// `delay` だけ待ってから応答するオリジンを起動
    pub fn start(body: &'static [u8], delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let hits_clone = Arc::clone(&hits);
        let requests_clone = Arc::clone(&requests);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let hits = Arc::clone(&hits_clone);
                let requests = Arc::clone(&requests_clone);
                thread::spawn(move || handle_origin_connection(stream, body, delay, hits, requests));
            }
        });

        Self { addr, hits, requests }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// 受け付けたリクエスト数
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// 受け付けたリクエスト行（"GET /path" の形式）
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

fn handle_origin_connection(
    mut stream: TcpStream,
    body: &'static [u8],
    delay: Duration,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(10)));
    let mut pending = Vec::new();
    let mut buf = [0u8; 4096];

    loop {
        // ヘッダー終端まで読む
        let header_end = loop {
            if let Some(pos) = find(&pending, b"\r\n\r\n") {
                break pos + 4;
            }
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => pending.extend_from_slice(&buf[..n]),
            }
        };

        let head = String::from_utf8_lossy(&pending[..header_end]).to_string();
        let content_length = head
            .lines()
            .find_map(|l| {
                let (name, value) = l.split_once(':')?;
                name.eq_ignore_ascii_case("content-length").then(|| value.trim().parse::<usize>().ok())?
            })
            .unwrap_or(0);
        while pending.len() < header_end + content_length {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => pending.extend_from_slice(&buf[..n]),
            }
        }
        pending.drain(..header_end + content_length);

        let request_line = head.lines().next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let target = parts.next().unwrap_or_default().to_string();
        requests.lock().unwrap().push(format!("{} {}", method, target));
        hits.fetch_add(1, Ordering::SeqCst);

        thread::sleep(delay);

        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\n\
             ETag: \"v1\"\r\nCache-Control: max-age=3600\r\n\r\n",
            body.len()
        )
        .into_bytes();
        if method != "HEAD" {
            response.extend_from_slice(body);
        }
        if stream.write_all(&response).is_err() {
            return;
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ====================
// サーバー起動
// ====================

/// ハンドラを専用スレッドの monoio ランタイムで待ち受けさせる
///
/// スレッドはテストプロセスの終了まで動き続ける。
pub fn spawn_handler<H: RequestHandler>(handler: Arc<H>) -> SocketAddr {
    let port = get_available_port();
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let (ready_tx, ready_rx) = mpsc::channel();

    thread::spawn(move || {
        let mut rt = monoio::RuntimeBuilder::<monoio::FusionDriver>::new()
            .enable_timer()
            .build()
            .unwrap();
        rt.block_on(async move {
            let listener = create_listener(addr).unwrap();
            ready_tx.send(()).unwrap();
            loop {
                let Ok((stream, peer)) = listener.accept().await else { continue };
                let handler = Arc::clone(&handler);
                monoio::spawn(serve_connection(stream, peer, handler));
            }
        });
    });

    ready_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    addr
}

// ====================
// HTTP クライアント
// ====================

/// パース済みのレスポンス
#[derive(Debug)]
pub struct TestResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// 1リクエストを送って接続を閉じるまで読む
pub fn send_request(addr: SocketAddr, method: &str, path: &str, extra_headers: &[(&str, &str)], body: &[u8]) -> TestResponse {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();

    let mut request = format!("{} {} HTTP/1.1\r\nHost: cdn.example\r\nConnection: close\r\n", method, path);
    for (name, value) in extra_headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    if !body.is_empty() {
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).unwrap();
    stream.write_all(body).unwrap();

    let mut raw = Vec::new();
    let _ = stream.read_to_end(&mut raw);
    parse_response(&raw)
}

pub fn get(addr: SocketAddr, path: &str) -> TestResponse {
    send_request(addr, "GET", path, &[], &[])
}

fn parse_response(raw: &[u8]) -> TestResponse {
    let header_end = find(raw, b"\r\n\r\n").expect("incomplete response") + 4;
    let head = String::from_utf8_lossy(&raw[..header_end]);
    let mut lines = head.lines();
    let status = lines
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|s| s.parse().ok())
        .expect("bad status line");
    let headers: Vec<(String, String)> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
        .collect();

    let mut body = raw[header_end..].to_vec();
    let chunked = headers
        .iter()
        .any(|(n, v)| n.eq_ignore_ascii_case("transfer-encoding") && v.eq_ignore_ascii_case("chunked"));
    if chunked {
        body = dechunk(&body);
    }
    TestResponse { status, headers, body }
}

fn dechunk(mut data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(line_end) = find(data, b"\r\n") {
        let size = usize::from_str_radix(std::str::from_utf8(&data[..line_end]).unwrap().trim(), 16).unwrap();
        if size == 0 {
            break;
        }
        let start = line_end + 2;
        out.extend_from_slice(&data[start..start + size]);
        data = &data[start + size + 2..];
    }
    out
}
