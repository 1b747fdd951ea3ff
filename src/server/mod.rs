//! # サーバー
//!
//! thread-per-core のワーカー起動、HTTP/1.1 接続ループ、
//! レスポンスの中継、アクセスログを提供します。
//!
//! ## 構成
//!
//! ```text
//! main
//!  ├─ worker thread 0 ─ monoio runtime ─ SO_REUSEPORT listener ─ 接続ごとに spawn
//!  ├─ worker thread 1 ─ ...
//!  ├─ health-monitor thread
//!  └─ (node) cache-sweeper thread
//! ```

pub mod node;
pub mod router;

use crate::cache::{CacheResponse, ResponseBody};
use crate::error::CacheError;
use crate::http::{
    buf_get, buf_put, encode_response_head, parse_request, read_request_body, simple_response, write_all,
    write_chunk, write_last_chunk, Framing, ParseOutcome, Request, ERR_MSG_BAD_REQUEST, ERR_MSG_REQUEST_TOO_LARGE,
    IDLE_TIMEOUT, MAX_HEADER_SIZE, READ_TIMEOUT,
};
use crate::origin::OriginBody;
use ftlog::{debug, error, info, warn};
use monoio::io::AsyncReadRent;
use monoio::net::{TcpListener, TcpStream};
use monoio::time::timeout;
use monoio::RuntimeBuilder;
use once_cell::sync::Lazy;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use time::OffsetDateTime;

pub use node::NodeServer;
pub use router::RouterServer;

/// Graceful Shutdown 用フラグ
pub static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);

#[inline]
pub fn is_shutting_down() -> bool {
    SHUTDOWN_FLAG.load(Ordering::Relaxed)
}

/// プロセスの起動時刻
static STARTED_AT: Lazy<Instant> = Lazy::new(Instant::now);

/// 起動からの経過秒数（/health 用）
pub fn uptime_secs() -> u64 {
    STARTED_AT.elapsed().as_secs()
}

/// シグナルハンドラのセットアップ
pub fn setup_signal_handler() {
    // SIGINT, SIGTERM をキャッチしてシャットダウンフラグを設定
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal, initiating graceful shutdown...");
        SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
    }) {
        error!("Failed to set signal handler: {}", e);
    }
}

pub fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let config = monoio::net::ListenerConfig::default()
        .reuse_port(true)
        .backlog(8192);
    TcpListener::bind_with_config(addr, &config)
}

// ====================
// リクエストハンドラ
// ====================

/// 1リクエストの処理結果（アクセスログ用）
#[derive(Debug, Clone, Copy)]
pub struct Outcome {
    pub status: u16,
    pub body_bytes: u64,
    pub cache_status: &'static str,
    /// 接続を継続できるか
    pub keep_alive: bool,
}

/// リクエストを処理してレスポンスを書き込む
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, stream: &mut TcpStream, req: &Request, body: Vec<u8>) -> io::Result<Outcome>;
}

// ====================
// ワーカー
// ====================

/// CPU数ぶんのワーカースレッドで待ち受ける（シャットダウンまで戻らない）
pub fn run_workers<H: RequestHandler>(addr: SocketAddr, threads: usize, handler: Arc<H>) {
    Lazy::force(&STARTED_AT);
    let mut handles = Vec::with_capacity(threads);

    for thread_id in 0..threads {
        let handler = Arc::clone(&handler);

        let spawned = thread::Builder::new()
            .name(format!("worker-{}", thread_id))
            .spawn(move || {
                let mut rt = match RuntimeBuilder::<monoio::FusionDriver>::new().enable_timer().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("[Thread {}] Failed to create runtime: {}", thread_id, e);
                        return;
                    }
                };
                rt.block_on(accept_loop(thread_id, addr, handler));
            });

        match spawned {
            Ok(handle) => handles.push(handle),
            Err(e) => error!("[Thread {}] Spawn error: {}", thread_id, e),
        }
    }

    for handle in handles {
        let _ = handle.join();
    }
}

async fn accept_loop<H: RequestHandler>(thread_id: usize, addr: SocketAddr, handler: Arc<H>) {
    let listener = match create_listener(addr) {
        Ok(l) => l,
        Err(e) => {
            error!("[Thread {}] Bind error: {}", thread_id, e);
            return;
        }
    };

    info!("[Thread {}] Worker started", thread_id);

    loop {
        // Shutdown チェック
        if is_shutting_down() {
            info!("[Thread {}] Shutting down...", thread_id);
            break;
        }

        // タイムアウト付きaccept（Graceful Shutdown対応）
        let (stream, peer_addr) = match timeout(Duration::from_secs(1), listener.accept()).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                error!("[Thread {}] Accept error: {}", thread_id, e);
                continue;
            }
            Err(_) => continue,
        };

        let _ = stream.set_nodelay(true);
        let handler = Arc::clone(&handler);

        monoio::spawn(async move {
            serve_connection(stream, peer_addr, handler).await;
        });
    }

    info!("[Thread {}] Worker stopped", thread_id);
}

// ====================
// 接続処理
// ====================

/// HTTP/1.1 キープアライブ接続を処理
pub async fn serve_connection<H: RequestHandler>(mut stream: TcpStream, peer_addr: SocketAddr, handler: Arc<H>) {
    let mut pending: Vec<u8> = Vec::new();

    loop {
        // ヘッダーを読む（最初の1バイトまではアイドルタイムアウト）
        let (req, header_len) = loop {
            match parse_request(&pending) {
                ParseOutcome::Complete(req, n) => break (req, n),
                ParseOutcome::Partial => {
                    if pending.len() > MAX_HEADER_SIZE {
                        let _ = write_all(&mut stream, ERR_MSG_REQUEST_TOO_LARGE.to_vec()).await;
                        return;
                    }
                }
                ParseOutcome::Invalid => {
                    let _ = write_all(&mut stream, ERR_MSG_BAD_REQUEST.to_vec()).await;
                    return;
                }
                ParseOutcome::TooLarge => {
                    let _ = write_all(&mut stream, ERR_MSG_REQUEST_TOO_LARGE.to_vec()).await;
                    return;
                }
            }

            let wait = if pending.is_empty() { IDLE_TIMEOUT } else { READ_TIMEOUT };
            let buf = buf_get();
            let (res, returned) = match timeout(wait, stream.read(buf)).await {
                Ok(r) => r,
                Err(_) => return,
            };
            match res {
                Ok(0) | Err(_) => {
                    buf_put(returned);
                    return;
                }
                Ok(n) => {
                    pending.extend_from_slice(&returned[..n]);
                    buf_put(returned);
                }
            }
        };

        if is_shutting_down() {
            let _ = write_all(&mut stream, simple_response(503, "text/plain", b"shutting down\n", false)).await;
            return;
        }

        let start_time = OffsetDateTime::now_utc();
        pending.drain(..header_len);

        let body = match read_request_body(&mut stream, &req, &mut pending).await {
            Ok(b) => b,
            Err(e) => {
                debug!("{} request body read failed: {}", peer_addr, e);
                let _ = write_all(&mut stream, ERR_MSG_BAD_REQUEST.to_vec()).await;
                return;
            }
        };
        let req_body_size = body.len() as u64;

        match handler.handle(&mut stream, &req, body).await {
            Ok(outcome) => {
                log_access(&req, req_body_size, &outcome, start_time);
                if !outcome.keep_alive || !req.keep_alive {
                    return;
                }
            }
            Err(e) => {
                warn!("{} {} {} failed: {}", peer_addr, req.method, req.target, e);
                return;
            }
        }
    }
}

// ====================
// レスポンス中継
// ====================

/// ボディのフレーミングを決める
fn response_framing<B>(resp: &CacheResponse<B>) -> Framing {
    match resp.status {
        204 | 304 => Framing::None,
        _ => match resp.content_length {
            Some(len) => Framing::Length(len),
            None if resp.is_bodiless() => Framing::Length(0),
            None => Framing::Chunked,
        },
    }
}

/// レスポンスを書き込み、送信したボディのバイト数を返す
///
/// オリジンのボディが途中で途切れた場合は `Err` を返す（接続は閉じる）
pub async fn relay_response<B: OriginBody>(
    stream: &mut TcpStream,
    resp: CacheResponse<B>,
    keep_alive: bool,
) -> io::Result<u64> {
    let framing = response_framing(&resp);
    let head = encode_response_head(resp.status, &resp.headers, framing, keep_alive);
    write_all(stream, head).await?;

    let chunked = framing == Framing::Chunked;
    let sent = match resp.body {
        ResponseBody::Empty => 0,
        ResponseBody::Memory { data, start, end } => {
            write_all(stream, data[start..end].to_vec()).await?;
            (end - start) as u64
        }
        ResponseBody::Disk(mut reader) => {
            let mut sent = 0u64;
            let mut buf = buf_get();
            while let Some(chunk) = reader.next_chunk(buf).await? {
                sent += chunk.len() as u64;
                buf = write_all(stream, chunk).await?;
                if reader.remaining() == 0 {
                    buf_put(buf);
                    break;
                }
            }
            sent
        }
        ResponseBody::Origin(mut body) => {
            let mut sent = 0u64;
            while let Some(chunk) = body.next_chunk().await.map_err(upstream_error)? {
                sent += chunk.len() as u64;
                send_chunk(stream, chunk, chunked).await?;
            }
            sent
        }
        ResponseBody::Spliced(mut body) => {
            let mut sent = 0u64;
            while let Some(chunk) = body.next_chunk(buf_get()).await.map_err(upstream_error)? {
                sent += chunk.len() as u64;
                let buf = send_chunk(stream, chunk, chunked).await?;
                buf_put(buf);
            }
            sent
        }
    };

    if chunked {
        write_last_chunk(stream).await?;
    }
    if let Framing::Length(expected) = framing {
        if sent != expected {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("upstream body ended at {} of {} bytes", sent, expected),
            ));
        }
    }
    Ok(sent)
}

/// ボディの一部を送る（バッファは返却する）
async fn send_chunk(stream: &mut TcpStream, chunk: Vec<u8>, chunked: bool) -> io::Result<Vec<u8>> {
    if chunked {
        write_chunk(stream, &chunk).await?;
        Ok(chunk)
    } else {
        write_all(stream, chunk).await
    }
}

fn upstream_error(e: CacheError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

// ====================
// ロギング
// ====================

fn log_access(req: &Request, req_body_size: u64, outcome: &Outcome, start_time: OffsetDateTime) {
    let end_time = OffsetDateTime::now_utc();
    let duration_ms = (end_time - start_time).whole_milliseconds();
    let ua_str = std::str::from_utf8(req.user_agent()).unwrap_or("-");

    info!(
        "Access: time={} duration={}ms method={} path={} ua={} req_body_size={} status={} resp_body_size={} cache={}",
        start_time,
        duration_ms,
        req.method,
        req.target,
        ua_str,
        req_body_size,
        outcome.status,
        outcome.body_bytes,
        outcome.cache_status
    );
}
