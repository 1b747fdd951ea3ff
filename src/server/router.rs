//! ロードバランサー（ルーター）の起動とリクエスト処理
//!
//! GET/HEAD はリングで選んだノードへ、それ以外はオリジンへ直接転送します。
//! ノードへの転送がレスポンスを受け取る前に失敗した場合に限り、
//! リング上の次の候補へ1回だけ再試行します。

use super::{relay_response, run_workers, uptime_secs, Outcome, RequestHandler};
use crate::cache::{relay_headers, CacheConfig, CacheKey, CacheResponse, CacheStatus, ResponseBody};
use crate::config::Config;
use crate::error::CacheError;
use crate::health::{HealthMonitor, HealthSubscriber, NodeProbe};
use crate::http::{encode_request, simple_response, write_all, HttpClient, Request, Target, CONNECT_TIMEOUT};
use crate::origin::{HttpOrigin, HttpOriginBody, Origin, OriginRequest};
use crate::router::{NodeDescriptor, Router};
use ftlog::{info, warn};
use monoio::net::TcpStream;
use monoio::time::timeout;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// 1リクエストあたりのノード試行回数（初回 + 再試行1回）
const MAX_ATTEMPTS: usize = 2;

/// ルーターのリクエストハンドラ
pub struct RouterServer<O: Origin = HttpOrigin> {
    router: Arc<Router>,
    origin: O,
    cache: CacheConfig,
    client: HttpClient,
    node_timeout: Duration,
}

impl<O: Origin> RouterServer<O> {
    pub fn new(router: Arc<Router>, origin: O, cache: CacheConfig, node_timeout: Duration) -> Self {
        Self {
            router,
            origin,
            cache,
            client: HttpClient::new(CONNECT_TIMEOUT.min(node_timeout), node_timeout),
            node_timeout,
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// `/health` の本文とステータス
    pub fn health_body(&self) -> (u16, String) {
        let serviceable = self.router.is_serviceable();
        let mut body = format!(
            "{{\"status\":\"{}\",\"uptime_secs\":{},\"nodes\":[",
            if serviceable { "ok" } else { "unavailable" },
            uptime_secs()
        );
        for (i, node) in self.router.nodes().iter().enumerate() {
            if i > 0 {
                body.push(',');
            }
            body.push_str(&format!(
                "{{\"id\":\"{}\",\"addr\":\"{}\",\"disks\":{},\"health\":\"{}\"}}",
                node.id,
                node.addr.authority(),
                node.disk_count,
                node.health()
            ));
        }
        body.push_str("]}\n");
        (if serviceable { 200 } else { 503 }, body)
    }

    /// ノード選択に使うキー（キャッシュ対象外なら `None`）
    pub fn routing_key(&self, req: &Request) -> Option<CacheKey> {
        let method = req.method.as_bytes();
        if !self.cache.is_cacheable_method(method) {
            return None;
        }
        CacheKey::from_request(method, &req.host, req.path(), req.query(), self.cache.include_query)
    }

    /// ノードへ転送（レスポンスヘッダー受信前の失敗は次の候補へ）
    async fn forward_to_node(
        &self,
        key: &CacheKey,
        req: &Request,
        body: &[u8],
    ) -> Result<CacheResponse<HttpOriginBody>, CacheError> {
        let candidates = self.router.candidates(key, MAX_ATTEMPTS);
        if candidates.is_empty() {
            return Err(CacheError::NoHealthyNode);
        }

        let is_head = req.is_method("HEAD");
        let mut last_err = CacheError::NoHealthyNode;

        for node in candidates {
            match self.try_node(&node, req, body, is_head).await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    warn!("[Router] node {} failed for {}: {}", node.id, key, e);
                    last_err = CacheError::OriginUnreachable(format!("node {}: {}", node.id, e));
                }
            }
        }
        Err(last_err)
    }

    async fn try_node(
        &self,
        node: &NodeDescriptor,
        req: &Request,
        body: &[u8],
        is_head: bool,
    ) -> io::Result<CacheResponse<HttpOriginBody>> {
        // ノードが同じキーを計算できるようクライアントの Host をそのまま渡す
        let host = if req.host.is_empty() { node.addr.host_header() } else { req.host.to_string() };
        let raw = encode_request(&req.method, &req.target, &host, &req.headers, body);

        let (head, client_body) = match timeout(self.node_timeout, self.client.send(&node.addr, &raw, is_head)).await {
            Ok(r) => r?,
            Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "node timeout")),
        };

        let cache_status = match head.header("x-cache") {
            Some(v) if v.eq_ignore_ascii_case(b"HIT") => CacheStatus::Hit,
            Some(v) if v.eq_ignore_ascii_case(b"BYPASS") => CacheStatus::Bypass,
            _ => CacheStatus::Miss,
        };
        let content_length = if is_head { head.content_length } else { client_body.remaining_hint() };
        let bodiless = is_head || head.status == 204 || head.status == 304;

        Ok(CacheResponse {
            status: head.status,
            headers: relay_headers(&head.headers),
            content_length,
            body: if bodiless { ResponseBody::Empty } else { ResponseBody::Origin(client_body.into()) },
            cache_status,
        })
    }

    /// オリジンへ直接転送
    async fn forward_to_origin(&self, req: &Request, body: Vec<u8>) -> Result<CacheResponse<O::Body>, CacheError> {
        let origin_req = OriginRequest::new(&req.method, &req.target, req.headers.clone()).with_body(body);
        let resp = self.origin.send(&origin_req).await?;
        let bodiless = origin_req.is_head() || resp.status == 204 || resp.status == 304;
        Ok(CacheResponse {
            status: resp.status,
            headers: relay_headers(&resp.headers),
            content_length: resp.content_length,
            body: if bodiless { ResponseBody::Empty } else { ResponseBody::Origin(resp.body) },
            cache_status: CacheStatus::Bypass,
        })
    }
}

impl<O: Origin> RequestHandler for RouterServer<O> {
    async fn handle(&self, stream: &mut TcpStream, req: &Request, body: Vec<u8>) -> io::Result<Outcome> {
        if req.is_method("GET") && req.path() == "/health" {
            let (status, text) = self.health_body();
            write_all(stream, simple_response(status, "application/json", text.as_bytes(), req.keep_alive)).await?;
            return Ok(Outcome {
                status,
                body_bytes: text.len() as u64,
                cache_status: "-",
                keep_alive: true,
            });
        }

        let (status, cache_status, body_bytes, keep_alive) = match self.routing_key(req) {
            Some(key) => match self.forward_to_node(&key, req, &body).await {
                Ok(resp) => {
                    let (status, cache) = (resp.status, resp.cache_status.as_str());
                    let keep_alive = req.keep_alive && status < 500;
                    (status, cache, relay_response(stream, resp, keep_alive).await?, keep_alive)
                }
                Err(e) => {
                    let resp: CacheResponse<HttpOriginBody> = CacheResponse::error(&e);
                    (resp.status, "-", relay_response(stream, resp, false).await?, false)
                }
            },
            None => match self.forward_to_origin(req, body).await {
                Ok(resp) => {
                    let status = resp.status;
                    let keep_alive = req.keep_alive && status < 500;
                    (status, "BYPASS", relay_response(stream, resp, keep_alive).await?, keep_alive)
                }
                Err(e) => {
                    warn!("[Router] origin passthrough {} {} failed: {}", req.method, req.target, e);
                    let resp: CacheResponse<O::Body> = CacheResponse::error(&e);
                    (resp.status, "-", relay_response(stream, resp, false).await?, false)
                }
            },
        };

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

/// ルーターを起動（シャットダウンまで戻らない）
pub fn run(config: Config) -> io::Result<()> {
    let section = config
        .router
        .as_ref()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "missing [router] section"))?;
    let listen_addr = config.listen_addr()?;

    let router = Arc::new(Router::new(section.vnodes, section.max_probes));
    let mut probes = Vec::with_capacity(section.nodes.len());
    let probe_timeout = Duration::from_millis(config.health.timeout_ms);

    for entry in &section.nodes {
        let addr = Target::parse(&entry.addr)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid node address: {}", entry.addr)))?;
        probes.push(NodeProbe::new(entry.id.as_str().into(), addr.clone(), probe_timeout));
        router.add_node(NodeDescriptor::new(&entry.id, addr, entry.disks));
    }

    let origin = HttpOrigin::new(
        config.origin_target()?,
        config.origin.connect_timeout(),
        config.origin.fetch_timeout(),
    );

    info!("============================================");
    info!("shardcache router");
    info!("Listen Address: {}", listen_addr);
    info!("Origin: {}", config.origin.url);
    info!("Threads: {}", config.threads());
    info!("Nodes: {} ({} virtual nodes each)", section.nodes.len(), section.vnodes);
    info!("Node Timeout: {:?}", section.node_timeout());
    info!("============================================");

    let mut monitor = HealthMonitor::new(config.health.clone());
    monitor.subscribe(Arc::clone(&router) as Arc<dyn HealthSubscriber>);
    let monitor = Arc::new(monitor);
    let monitor_handle = Arc::clone(&monitor).start(probes, Vec::new())?;

    let server = RouterServer::new(router, origin, config.cache.clone(), section.node_timeout());
    run_workers(listen_addr, config.threads(), Arc::new(server));

    monitor.stop();
    let _ = monitor_handle.join();
    info!("Server shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthState;
    use crate::http::{parse_request, ParseOutcome};
    use crate::origin::mock::MockOrigin;

    fn request(raw: &str) -> Request {
        match parse_request(raw.as_bytes()) {
            ParseOutcome::Complete(req, _) => req,
            _ => panic!("bad request"),
        }
    }

    fn server() -> RouterServer<Arc<MockOrigin>> {
        let router = Arc::new(Router::new(16, None));
        router.add_node(NodeDescriptor::new("a", Target::parse("http://127.0.0.1:1").unwrap(), 2));
        RouterServer::new(router, Arc::new(MockOrigin::new()), CacheConfig::default(), Duration::from_millis(200))
    }

    #[test]
    fn test_routing_key_only_for_cacheable_methods() {
        let s = server();
        assert!(s.routing_key(&request("GET /a HTTP/1.1\r\nHost: h\r\n\r\n")).is_some());
        assert!(s.routing_key(&request("HEAD /a HTTP/1.1\r\nHost: h\r\n\r\n")).is_some());
        assert!(s.routing_key(&request("PUT /a HTTP/1.1\r\nHost: h\r\nContent-Length: 0\r\n\r\n")).is_none());
        assert!(s.routing_key(&request("DELETE /a HTTP/1.1\r\nHost: h\r\n\r\n")).is_none());

        // 署名パラメータが違っても同じノードへ
        let a = s.routing_key(&request("GET /a?X-Amz-Signature=1 HTTP/1.1\r\nHost: H\r\n\r\n")).unwrap();
        let b = s.routing_key(&request("GET /a?X-Amz-Signature=2 HTTP/1.1\r\nHost: h\r\n\r\n")).unwrap();
        assert_eq!(a.hash_value(), b.hash_value());
    }

    #[test]
    fn test_health_body() {
        let s = server();
        let (status, body) = s.health_body();
        assert_eq!(status, 200);
        assert!(body.contains("\"id\":\"a\",\"addr\":\"127.0.0.1:1\",\"disks\":2,\"health\":\"healthy\""));

        s.router().set_health("a", HealthState::Unhealthy);
        assert_eq!(s.health_body().0, 503);
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_unreachable_nodes_give_502_and_none_give_503() {
        let s = server();
        let req = request("GET /a HTTP/1.1\r\nHost: h\r\n\r\n");
        let key = s.routing_key(&req).unwrap();

        let err = s.forward_to_node(&key, &req, &[]).await.err().unwrap();
        assert_eq!(err.status_code(), 502);

        s.router().set_health("a", HealthState::Unhealthy);
        let err = s.forward_to_node(&key, &req, &[]).await.err().unwrap();
        assert_eq!(err.status_code(), 503);
    }
}
