//! キャッシュノードの起動とリクエスト処理

use super::{is_shutting_down, relay_response, run_workers, uptime_secs, Outcome, RequestHandler};
use crate::cache::{DiskStore, LocalDisk, NodeCacheEngine};
use crate::config::Config;
use crate::health::{DiskProbe, HealthMonitor, HealthSubscriber};
use crate::http::{simple_response, write_all, Request};
use crate::metrics::{render_cache_stats, render_prometheus};
use crate::origin::{HttpOrigin, Origin};
use ftlog::{info, warn};
use monoio::net::TcpStream;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// ノードのリクエストハンドラ
pub struct NodeServer<O: Origin> {
    node_id: Arc<str>,
    engine: Arc<NodeCacheEngine<O>>,
}

impl<O: Origin> NodeServer<O> {
    pub fn new(node_id: &str, engine: Arc<NodeCacheEngine<O>>) -> Self {
        Self {
            node_id: node_id.into(),
            engine,
        }
    }

    pub fn engine(&self) -> &Arc<NodeCacheEngine<O>> {
        &self.engine
    }

    /// `/health` の本文とステータス
    pub fn health_body(&self) -> (u16, String) {
        let serviceable = self.engine.is_serviceable();
        let mut body = format!(
            "{{\"status\":\"{}\",\"node\":\"{}\",\"uptime_secs\":{},\"disks\":[",
            if serviceable { "ok" } else { "unavailable" },
            self.node_id,
            uptime_secs()
        );
        for (i, disk) in self.engine.disks().iter().enumerate() {
            if i > 0 {
                body.push(',');
            }
            body.push_str(&format!("{{\"id\":{},\"health\":\"{}\"}}", disk.id(), disk.health_state()));
        }
        body.push_str("]}\n");
        (if serviceable { 200 } else { 503 }, body)
    }

    /// 管理用エンドポイント（該当しなければ `None`）
    fn admin_response(&self, req: &Request) -> Option<(u16, &'static str, String)> {
        if !req.is_method("GET") {
            return None;
        }
        match req.path() {
            "/health" => {
                let (status, body) = self.health_body();
                Some((status, "application/json", body))
            }
            "/cache-stats" => {
                let stats = self.engine.stats();
                Some((200, "application/json", render_cache_stats(&self.node_id, &stats)))
            }
            "/metrics" => {
                let stats = self.engine.stats();
                Some((200, "text/plain; version=0.0.4", render_prometheus(&self.node_id, &stats)))
            }
            _ => None,
        }
    }
}

impl<O: Origin> RequestHandler for NodeServer<O> {
    async fn handle(&self, stream: &mut TcpStream, req: &Request, body: Vec<u8>) -> io::Result<Outcome> {
        if let Some((status, content_type, text)) = self.admin_response(req) {
            let len = text.len() as u64;
            write_all(stream, simple_response(status, content_type, text.as_bytes(), req.keep_alive)).await?;
            return Ok(Outcome {
                status,
                body_bytes: len,
                cache_status: "-",
                keep_alive: true,
            });
        }

        let resp = self.engine.serve(req, body).await;
        let status = resp.status;
        let cache_status = resp.cache_status.as_str();
        // エラー応答の後は接続を閉じる
        let keep_alive = req.keep_alive && status < 500;

        let body_bytes = relay_response(stream, resp, keep_alive).await?;
        Ok(Outcome {
            status,
            body_bytes,
            cache_status,
            keep_alive,
        })
    }
}

// ====================
// 起動
// ====================

/// ノードを起動（シャットダウンまで戻らない）
pub fn run(config: Config) -> io::Result<()> {
    let node = config
        .node
        .as_ref()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "missing [node] section"))?;
    let node_id = node.node_id();
    let listen_addr = config.listen_addr()?;

    let mut disks: Vec<Arc<dyn DiskStore>> = Vec::with_capacity(node.disks.len());
    for (id, disk) in node.disks.iter().enumerate() {
        let store = LocalDisk::open(id, &disk.path, disk.capacity, &config.cache)?;
        disks.push(Arc::new(store));
    }

    let origin = HttpOrigin::new(
        config.origin_target()?,
        config.origin.connect_timeout(),
        config.origin.fetch_timeout(),
    );
    let engine = Arc::new(NodeCacheEngine::new(
        config.cache.clone(),
        disks.clone(),
        origin,
        config.origin.fetch_timeout(),
    ));

    info!("============================================");
    info!("shardcache node {}", node_id);
    info!("Listen Address: {}", listen_addr);
    info!("Origin: {}", config.origin.url);
    info!("Threads: {}", config.threads());
    for disk in &node.disks {
        info!("Disk: {} (capacity {} bytes)", disk.path.display(), disk.capacity);
    }
    info!("Range Policy: {:?}", config.cache.range_policy);
    info!("Fetch Timeout: {:?}", config.origin.fetch_timeout());
    info!("============================================");

    let mut monitor = HealthMonitor::new(config.health.clone());
    monitor.subscribe(Arc::clone(&engine) as Arc<dyn HealthSubscriber>);
    let monitor = Arc::new(monitor);
    let probes = disks.into_iter().map(DiskProbe::new).collect();
    let monitor_handle = Arc::clone(&monitor).start(Vec::new(), probes)?;

    let sweeper = spawn_sweeper(Arc::clone(&engine), Duration::from_secs(config.cache.sweep_interval_secs.max(1)))?;

    run_workers(listen_addr, config.threads(), Arc::new(NodeServer::new(&node_id, engine)));

    monitor.stop();
    let _ = monitor_handle.join();
    let _ = sweeper.join();
    info!("Server shutdown complete");
    Ok(())
}

/// 期限切れエントリを定期的に削除するスレッド
fn spawn_sweeper<O: Origin>(engine: Arc<NodeCacheEngine<O>>, interval: Duration) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new().name("cache-sweeper".to_string()).spawn(move || {
        let mut last = Instant::now();
        while !is_shutting_down() {
            thread::sleep(Duration::from_millis(500));
            if last.elapsed() < interval {
                continue;
            }
            last = Instant::now();
            let freed = engine.sweep_expired();
            if freed > 0 {
                info!("[Sweeper] freed {} bytes of expired entries", freed);
            }
        }
        if engine.stats().in_flight > 0 {
            warn!("[Sweeper] stopping with fetches still in flight");
        }
    })
}
