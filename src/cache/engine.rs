//! ノードキャッシュエンジン
//!
//! 1ノード内のリクエスト処理（キー計算 → ディスク選択 → ヒット／ミス処理）を担います。
//!
//! ## 処理フロー
//!
//! ```text
//! serve(req)
//!   ├─ 非キャッシュメソッド / バイパス条件 → passthrough（オリジンへそのまま転送）
//!   ├─ lookup: プライマリディスク → フォールバックディスク
//!   │    └─ HIT → respond_entry（Range / 304 / HEAD）
//!   └─ MISS → fetch_shared（シングルフライト）
//!         ├─ リーダーが run_fetch タスクを起動、全員が同じ結果を待つ
//!         └─ Direct（共有できない大きな応答）→ リーダーはボディを引き継ぎ、
//!            他の待機者は各自オリジンへ転送する
//! ```
//!
//! ## メモリに載せるボディ
//!
//! メモリに溜めるのは `large_object_threshold` 未満のボディだけです。
//! それを超える非キャッシュ応答や、書き込みに失敗した大きなオブジェクトは
//! 溜めた分（またはステージングファイル）に続けて残りをオリジンから中継します。
//!
//! ## ディスク選択
//!
//! - プライマリ: `hash(key) mod n`
//! - 書き込み先: `(hash + i) mod n` を i=0 から辿って最初の Unhealthy でないディスク
//! - 読み込み: プライマリ（Unhealthy でなければ）→ i=1 以降で最初の利用可能なディスク

use super::config::{CacheConfig, RangePolicy};
use super::disk::{put_body, BodyReader, DiskStats, DiskStore, EvictionPolicy};
use super::entry::{CacheEntry, CacheEntryBuilder};
use super::flight::{InFlightFetch, InFlightTable};
use super::key::{CacheKey, CacheableMethod};
use super::policy::CachePolicy;
use super::range::{content_range, unsatisfied_range, ByteRange, RangeResolution};
use crate::error::CacheError;
use crate::health::{HealthEvent, HealthSubscriber, HealthTarget};
use crate::http::{Headers, Request};
use crate::origin::{Origin, OriginBody, OriginRequest, OriginResponse};
use ftlog::{debug, info, warn};
use monoio::time::timeout;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// フライトの結果（全待機者で共有）
pub type FlightResult = Result<Arc<Fetched>, CacheError>;

/// オリジンフェッチの結果
#[derive(Debug)]
pub enum Fetched {
    /// キャッシュへ保存済み（小さいオブジェクトはボディもメモリに保持）
    Stored {
        entry: Arc<CacheEntry>,
        body: Option<Arc<[u8]>>,
    },
    /// 保存しなかったオリジンレスポンス
    Uncached {
        status: u16,
        headers: Arc<[(Box<[u8]>, Box<[u8]>)]>,
        body: Arc<[u8]>,
    },
    /// 共有しないレスポンス
    ///
    /// リーダーはボディを `Handoff` で引き継ぎ、他の待機者は個別にオリジンへ転送する
    Direct,
}

/// リーダーへ引き継ぐオリジンレスポンス
struct Handoff<B> {
    status: u16,
    headers: Headers,
    content_length: Option<u64>,
    body: SplicedBody<B>,
}

/// リーダーのフェッチタスクからの引き継ぎ先（同じスレッド内でのみ共有）
type HandoffSlot<B> = Rc<RefCell<Option<Handoff<B>>>>;

/// 読み込み済みの部分とオリジンの残りをつないだボディ
///
/// `staged` → `buffered` → `rest` の順に読み出す
pub struct SplicedBody<B> {
    /// 書き込みに失敗したステージングファイルの内容
    pub staged: Option<BodyReader>,
    pub buffered: Vec<u8>,
    pub rest: Option<B>,
}

impl<B: OriginBody> SplicedBody<B> {
    /// 次のデータ（終端なら `None`）
    ///
    /// ディスクから読む場合は `buf` を使う
    pub async fn next_chunk(&mut self, buf: Vec<u8>) -> Result<Option<Vec<u8>>, CacheError> {
        if let Some(reader) = self.staged.as_mut() {
            if let Some(chunk) = reader.next_chunk(buf).await? {
                return Ok(Some(chunk));
            }
            self.staged = None;
        }
        if !self.buffered.is_empty() {
            return Ok(Some(std::mem::take(&mut self.buffered)));
        }
        match self.rest.as_mut() {
            Some(body) => body.next_chunk().await,
            None => Ok(None),
        }
    }
}

/// 上限付きで読み込んだボディ
enum Collected {
    Complete(Vec<u8>),
    /// 上限に達した（続きはまだオリジン側にある）
    Overflow(Vec<u8>),
}

/// X-Cache ヘッダー値
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Bypass,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

/// レスポンスボディ
pub enum ResponseBody<B> {
    Empty,
    /// メモリ上のボディの一部
    Memory {
        data: Arc<[u8]>,
        start: usize,
        end: usize,
    },
    /// キャッシュファイルから読み出す
    Disk(BodyReader),
    /// オリジンからそのまま中継する
    Origin(B),
    /// 読み込み済みの部分に続けてオリジンから中継する
    Spliced(SplicedBody<B>),
}

/// エンジンのレスポンス
pub struct CacheResponse<B> {
    pub status: u16,
    pub headers: Headers,
    /// Content-Length（`None` なら chunked で送る）
    pub content_length: Option<u64>,
    pub body: ResponseBody<B>,
    pub cache_status: CacheStatus,
}

impl<B> CacheResponse<B> {
    /// エラーレスポンス
    pub fn error(err: &CacheError) -> Self {
        Self {
            status: err.status_code(),
            headers: Vec::new(),
            content_length: Some(0),
            body: ResponseBody::Empty,
            cache_status: CacheStatus::Miss,
        }
    }

    /// ボディを持たないステータスか
    #[inline]
    pub fn is_bodiless(&self) -> bool {
        matches!(self.body, ResponseBody::Empty)
    }
}

/// エンジンの統計スナップショット
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub hits: u64,
    pub misses: u64,
    pub bypasses: u64,
    /// 既存フライトに合流した待機者
    pub collapsed: u64,
    pub origin_fetches: u64,
    pub write_failures: u64,
    pub in_flight: usize,
    pub disks: Vec<DiskStats>,
}

impl EngineStats {
    /// ヒット率（%）
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 * 100.0 / total as f64
        }
    }

    /// 全ディスクのエントリ数
    pub fn object_count(&self) -> usize {
        self.disks.iter().map(|d| d.entries).sum()
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    bypasses: AtomicU64,
    origin_fetches: AtomicU64,
    write_failures: AtomicU64,
}

/// ノードキャッシュエンジン
pub struct NodeCacheEngine<O: Origin> {
    config: CacheConfig,
    disks: Vec<Arc<dyn DiskStore>>,
    origin: O,
    flights: InFlightTable<FlightResult>,
    fetch_timeout: Duration,
    counters: Counters,
}

/// フェッチタスクが結果を確定せずに終了した場合に待機者を解放する
struct FlightGuard<'a> {
    table: &'a InFlightTable<FlightResult>,
    flight: &'a Arc<InFlightFetch<FlightResult>>,
    armed: bool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.table.complete(self.flight, Err(CacheError::Cancelled));
        }
    }
}

impl<O: Origin> NodeCacheEngine<O> {
    /// `disks` の並びはディスクIDと一致している必要がある
    pub fn new(config: CacheConfig, disks: Vec<Arc<dyn DiskStore>>, origin: O, fetch_timeout: Duration) -> Self {
        Self {
            config,
            disks,
            origin,
            flights: InFlightTable::new(),
            fetch_timeout,
            counters: Counters::default(),
        }
    }

    #[inline]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[inline]
    pub fn origin(&self) -> &O {
        &self.origin
    }

    #[inline]
    pub fn disks(&self) -> &[Arc<dyn DiskStore>] {
        &self.disks
    }

    // ====================
    // ディスク選択
    // ====================

    /// プライマリディスクの位置
    #[inline]
    pub fn primary_disk(&self, key: &CacheKey) -> usize {
        (key.hash_value() % self.disks.len().max(1) as u64) as usize
    }

    /// `(hash + i) mod n` の順にディスクを辿る
    fn walk(&self, key: &CacheKey) -> impl Iterator<Item = &Arc<dyn DiskStore>> {
        let n = self.disks.len();
        let primary = self.primary_disk(key);
        (0..n).map(move |i| &self.disks[(primary + i) % n])
    }

    /// 書き込み先ディスク（Unhealthy を除外して辿る）
    pub fn write_disk(&self, key: &CacheKey) -> Option<&Arc<dyn DiskStore>> {
        self.walk(key).find(|d| d.health_state().is_available())
    }

    /// 読み込み候補（プライマリ → フォールバック）
    fn read_disks(&self, key: &CacheKey) -> Vec<&Arc<dyn DiskStore>> {
        let mut walk = self.walk(key);
        let mut out = Vec::with_capacity(2);
        if let Some(primary) = walk.next() {
            if primary.health_state().is_available() {
                out.push(primary);
            }
        }
        if let Some(fallback) = walk.find(|d| d.health_state().is_available()) {
            out.push(fallback);
        }
        out
    }

    fn disk(&self, id: usize) -> Option<&Arc<dyn DiskStore>> {
        self.disks.iter().find(|d| d.id() == id)
    }

    /// 有効期限内のエントリを探す
    pub fn lookup(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.read_disks(key).into_iter().find_map(|d| d.get(key))
    }

    // ====================
    // リクエスト処理
    // ====================

    /// リクエストを処理
    ///
    /// `body` はクライアントから受信したリクエストボディ（オリジンへの転送用）
    pub async fn serve(self: &Arc<Self>, req: &Request, body: Vec<u8>) -> CacheResponse<O::Body> {
        let method = req.method.as_bytes();
        if !self.config.is_cacheable_method(method) || CacheableMethod::from_bytes(method).is_none() {
            return self.passthrough(req, body).await;
        }
        if self.config.should_bypass(req.path()) || CachePolicy::request_bypasses_cache(&req.headers) {
            return self.passthrough(req, body).await;
        }
        let key = match CacheKey::from_request(method, &req.host, req.path(), req.query(), self.config.include_query) {
            Some(k) => k,
            None => return self.passthrough(req, body).await,
        };

        let is_head = req.is_method("HEAD");
        let range = if is_head {
            None
        } else {
            req.header("range").and_then(ByteRange::parse)
        };
        let inm = CachePolicy::get_if_none_match(&req.headers);

        if let Some(entry) = self.lookup(&key) {
            match self.respond_entry(&entry, None, range, inm, is_head, CacheStatus::Hit) {
                Ok(resp) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return resp;
                }
                Err(e) => debug!("[Cache] {} unreadable, refetching: {}", key, e),
            }
        }

        // 範囲だけをオリジンへ転送する方針
        let (fetch_key, origin_range) = match (range, self.config.range_policy) {
            (Some(r), RangePolicy::Requested) => {
                let rkey = key.with_range(&r.header_value());
                if let Some(entry) = self.lookup(&rkey) {
                    if let Ok(resp) = self.respond_entry(&entry, None, None, inm, false, CacheStatus::Hit) {
                        self.counters.hits.fetch_add(1, Ordering::Relaxed);
                        return resp;
                    }
                }
                (rkey, Some(r))
            }
            _ => (key, None),
        };

        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let mut last_err = CacheError::Cancelled;
        for _ in 0..2 {
            let (result, handoff) = self.fetch_shared(&fetch_key, req, origin_range).await;
            if matches!(result.as_deref(), Ok(Fetched::Direct)) {
                return match handoff {
                    Some(h) => respond_handoff(h, is_head),
                    None => {
                        self.counters.origin_fetches.fetch_add(1, Ordering::Relaxed);
                        let origin_req = OriginRequest::new(&req.method, &req.target, req.headers.clone());
                        self.forward(&origin_req, CacheStatus::Miss).await
                    }
                };
            }
            match self.respond_fetched(result, range, inm, is_head) {
                Ok(resp) => return resp,
                // 保存直後に読めなくなった（エビクション等）場合は取り直す
                Err(e) if e.is_storage_error() => {
                    debug!("[Cache] {} stored entry unreadable, retrying: {}", fetch_key, e);
                    last_err = e;
                }
                Err(e) => return CacheResponse::error(&e),
            }
        }
        CacheResponse::error(&last_err)
    }

    /// キャッシュを通さずオリジンへ転送
    pub async fn passthrough(&self, req: &Request, body: Vec<u8>) -> CacheResponse<O::Body> {
        self.counters.bypasses.fetch_add(1, Ordering::Relaxed);

        let origin_req = OriginRequest::new(&req.method, &req.target, req.headers.clone()).with_body(body);
        self.forward(&origin_req, CacheStatus::Bypass).await
    }

    /// オリジンのレスポンスをそのまま中継する
    async fn forward(&self, origin_req: &OriginRequest, cache_status: CacheStatus) -> CacheResponse<O::Body> {
        match self.origin.send(origin_req).await {
            Ok(resp) => {
                let mut headers = relay_headers(&resp.headers);
                push_header(&mut headers, "X-Cache", cache_status.as_str());
                let bodiless = origin_req.is_head() || resp.status == 204 || resp.status == 304;
                CacheResponse {
                    status: resp.status,
                    headers,
                    content_length: if resp.status == 304 { None } else { resp.content_length },
                    body: if bodiless { ResponseBody::Empty } else { ResponseBody::Origin(resp.body) },
                    cache_status,
                }
            }
            Err(e) => {
                warn!("[Cache] forward {} {} failed: {}", origin_req.method, origin_req.target, e);
                CacheResponse::error(&e)
            }
        }
    }

    /// エントリからレスポンスを組み立てる
    fn respond_entry(
        &self,
        entry: &Arc<CacheEntry>,
        memory: Option<Arc<[u8]>>,
        range: Option<ByteRange>,
        if_none_match: Option<&[u8]>,
        is_head: bool,
        cache_status: CacheStatus,
    ) -> Result<CacheResponse<O::Body>, CacheError> {
        let mut age = itoa::Buffer::new();
        let age = age.format(entry.age_secs(SystemTime::now())).to_string();

        if let (Some(inm), Some(etag)) = (if_none_match, entry.etag.as_deref()) {
            if CachePolicy::etag_matches(inm, etag) {
                let mut headers: Headers = entry
                    .headers
                    .iter()
                    .filter(|(n, _)| {
                        n.eq_ignore_ascii_case(b"etag")
                            || n.eq_ignore_ascii_case(b"cache-control")
                            || n.eq_ignore_ascii_case(b"last-modified")
                    })
                    .cloned()
                    .collect();
                push_header(&mut headers, "X-Cache", cache_status.as_str());
                push_header(&mut headers, "Age", &age);
                return Ok(CacheResponse {
                    status: 304,
                    headers,
                    content_length: None,
                    body: ResponseBody::Empty,
                    cache_status,
                });
            }
        }

        let mut headers: Headers = entry.headers.iter().cloned().collect();
        let size = entry.body_size;

        let (status, start, len) = match range.filter(|_| entry.status_code == 200) {
            Some(r) => match r.resolve(size) {
                RangeResolution::Unsatisfiable => {
                    let mut headers = Vec::new();
                    push_header(&mut headers, "Content-Range", &unsatisfied_range(size));
                    push_header(&mut headers, "X-Cache", cache_status.as_str());
                    return Ok(CacheResponse {
                        status: 416,
                        headers,
                        content_length: Some(0),
                        body: ResponseBody::Empty,
                        cache_status,
                    });
                }
                RangeResolution::Satisfiable { start, end } => {
                    push_header(&mut headers, "Content-Range", &content_range(start, end, size));
                    (206, start, end - start + 1)
                }
            },
            None => (entry.status_code, 0, size),
        };

        if entry.status_code == 200 && entry.header(b"accept-ranges").is_none() {
            push_header(&mut headers, "Accept-Ranges", "bytes");
        }
        push_header(&mut headers, "X-Cache", cache_status.as_str());
        push_header(&mut headers, "Age", &age);

        let body = if is_head || len == 0 {
            ResponseBody::Empty
        } else if let Some(data) = memory {
            ResponseBody::Memory {
                data,
                start: start as usize,
                end: (start + len) as usize,
            }
        } else {
            let disk = self
                .disk(entry.disk_id)
                .ok_or_else(|| CacheError::CorruptEntry(format!("unknown disk {}", entry.disk_id)))?;
            ResponseBody::Disk(disk.open_body(entry, start, len)?)
        };

        Ok(CacheResponse {
            status,
            headers,
            content_length: Some(len),
            body,
            cache_status,
        })
    }

    /// フライト結果からレスポンスを組み立てる
    fn respond_fetched(
        &self,
        result: FlightResult,
        range: Option<ByteRange>,
        if_none_match: Option<&[u8]>,
        is_head: bool,
    ) -> Result<CacheResponse<O::Body>, CacheError> {
        let fetched = result?;
        match &*fetched {
            Fetched::Stored { entry, body } => {
                self.respond_entry(entry, body.clone(), range, if_none_match, is_head, CacheStatus::Miss)
            }
            Fetched::Uncached { status, headers, body } => {
                let mut headers: Headers = headers.to_vec();
                push_header(&mut headers, "X-Cache", CacheStatus::Miss.as_str());
                Ok(CacheResponse {
                    status: *status,
                    headers,
                    content_length: Some(body.len() as u64),
                    body: if is_head || body.is_empty() {
                        ResponseBody::Empty
                    } else {
                        ResponseBody::Memory {
                            data: Arc::clone(body),
                            start: 0,
                            end: body.len(),
                        }
                    },
                    cache_status: CacheStatus::Miss,
                })
            }
            // serve が先に処理する
            Fetched::Direct => Err(CacheError::Cancelled),
        }
    }

    // ====================
    // シングルフライト
    // ====================

    /// 同じキーのフェッチを1回にまとめて結果を待つ
    ///
    /// 結果が `Fetched::Direct` のとき、リーダーにだけ引き継ぎが返る
    async fn fetch_shared(
        self: &Arc<Self>,
        key: &CacheKey,
        req: &Request,
        origin_range: Option<ByteRange>,
    ) -> (FlightResult, Option<Handoff<O::Body>>) {
        for attempt in 0..2 {
            let waiter = self.flights.join(key.hash_value(), key.canonical());

            let slot = if waiter.is_leader() {
                self.counters.origin_fetches.fetch_add(1, Ordering::Relaxed);
                let slot: HandoffSlot<O::Body> = Rc::new(RefCell::new(None));
                let origin_req = origin_request(req, origin_range);
                let this = Arc::clone(self);
                let flight = Arc::clone(waiter.flight());
                let key = key.clone();
                let task_slot = Rc::clone(&slot);
                monoio::spawn(async move {
                    this.run_fetch(flight, key, origin_req, task_slot).await;
                });
                Some(slot)
            } else {
                None
            };

            match waiter.wait().await {
                // 全待機者の離脱で中止されたフライトに合流していた
                Err(CacheError::Cancelled) if attempt == 0 => continue,
                result => {
                    let handoff = slot.and_then(|s| s.take());
                    return (result, handoff);
                }
            }
        }
        (Err(CacheError::Cancelled), None)
    }

    /// フェッチタスク本体
    async fn run_fetch(
        &self,
        flight: Arc<InFlightFetch<FlightResult>>,
        key: CacheKey,
        req: OriginRequest,
        slot: HandoffSlot<O::Body>,
    ) {
        let mut guard = FlightGuard {
            table: &self.flights,
            flight: &flight,
            armed: true,
        };

        let result = match timeout(self.fetch_timeout, self.fetch_and_store(&flight, &key, &req, &slot)).await {
            Ok(r) => r,
            Err(_) => Err(CacheError::OriginTimeout),
        };

        match &result {
            Ok(_) => {}
            Err(CacheError::Cancelled) => debug!("[Cache] fetch for {} abandoned by all waiters", key),
            Err(e) => warn!("[Cache] fetch for {} failed: {}", key, e),
        }

        guard.armed = false;
        self.flights.complete(&flight, result.map(Arc::new));
    }

    /// オリジンから取得してディスクへ書き込む
    ///
    /// キャッシュへの書き込み失敗ではフライトを失敗させない（オリジンのエラーのみ）
    async fn fetch_and_store(
        &self,
        flight: &InFlightFetch<FlightResult>,
        key: &CacheKey,
        req: &OriginRequest,
        slot: &HandoffSlot<O::Body>,
    ) -> Result<Fetched, CacheError> {
        let mut resp = self.origin.send(req).await?;
        if flight.is_abandoned() {
            return Err(CacheError::Cancelled);
        }

        let ttl = CachePolicy::check_response(
            resp.status,
            &resp.headers,
            &self.config.cacheable_statuses,
            self.config.default_ttl_secs,
            self.config.respect_vary,
        );
        // 範囲なしのキーに部分レスポンスは保存しない
        let ttl = ttl.filter(|_| resp.status != 206 || key.range().is_some());
        let ttl = match ttl {
            Some(t) => t,
            None => return self.uncached(resp, flight, slot).await,
        };

        // 範囲要求にオリジンが全体を返した場合は全体のキーで保存
        let store_key = if resp.status == 206 { key.clone() } else { key.without_range() };

        let disk = match self.write_disk(&store_key) {
            Some(d) => Arc::clone(d),
            None => {
                warn!("[Cache] no available disk for {}, serving uncached", store_key);
                return self.uncached(resp, flight, slot).await;
            }
        };

        let meta = CacheEntryBuilder::new(resp.status)
            .headers(CachePolicy::storable_headers(&resp.headers))
            .ttl(ttl)
            .body_size(resp.content_length.unwrap_or(0))
            .build(store_key.canonical());

        if let Some(len) = resp.content_length.filter(|&l| self.config.is_large_object(l)) {
            let mut staged = match disk.begin_put(&store_key, meta, len) {
                Ok(s) => s,
                Err(e) => {
                    self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("[Cache] {} ({} bytes) not cached: {}", store_key, len, e);
                    return Ok(hand_off(slot, resp, None, Vec::new(), true));
                }
            };

            loop {
                let chunk = match resp.body.next_chunk().await? {
                    Some(c) => c,
                    None => break,
                };
                if flight.is_abandoned() {
                    return Err(CacheError::Cancelled);
                }
                let (res, chunk) = staged.write_chunk(chunk).await;
                if let Err(e) = res {
                    self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("[Cache] {} write failed on disk {}, relaying uncached: {}", store_key, disk.id(), e);
                    return Ok(hand_off(slot, resp, Some(staged.into_reader()), chunk, true));
                }
            }
            if staged.written() != len {
                return Err(CacheError::OriginUnreachable(format!(
                    "body truncated: {} of {} bytes",
                    staged.written(),
                    len
                )));
            }

            let committed = match staged.finish().await {
                Ok(()) => disk.commit(&mut staged),
                Err(e) => Err(e),
            };
            return match committed {
                Ok(entry) => {
                    info!("[Cache] stored large object {} ({} bytes) on disk {}", store_key, len, disk.id());
                    Ok(Fetched::Stored { entry, body: None })
                }
                Err(e) => {
                    self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("[Cache] {} not committed on disk {}, relaying uncached: {}", store_key, disk.id(), e);
                    Ok(hand_off(slot, resp, Some(staged.into_reader()), Vec::new(), false))
                }
            };
        }

        let body = match self.collect(&mut resp.body, flight).await? {
            Collected::Complete(body) => body,
            Collected::Overflow(prefix) => {
                debug!("[Cache] {} has no length and exceeds the memory limit, not cached", store_key);
                return Ok(hand_off(slot, resp, None, prefix, true));
            }
        };
        if let Some(len) = resp.content_length {
            if body.len() as u64 != len {
                return Err(CacheError::OriginUnreachable(format!(
                    "body length mismatch: {} of {} bytes",
                    body.len(),
                    len
                )));
            }
        }

        match put_body(&*disk, &store_key, meta, body).await {
            (Ok(entry), body) => Ok(Fetched::Stored {
                entry,
                body: Some(body.into()),
            }),
            (Err(e), body) => {
                self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
                warn!("[Cache] {} not cached on disk {}: {}", store_key, disk.id(), e);
                Ok(Fetched::Uncached {
                    status: resp.status,
                    headers: relay_headers(&resp.headers).into(),
                    body: body.into(),
                })
            }
        }
    }

    /// 保存せずに中継する
    ///
    /// 上限未満なら全待機者で共有し、超えるならリーダーへ引き継ぐ
    async fn uncached(
        &self,
        mut resp: OriginResponse<O::Body>,
        flight: &InFlightFetch<FlightResult>,
        slot: &HandoffSlot<O::Body>,
    ) -> Result<Fetched, CacheError> {
        if resp.content_length.is_some_and(|l| self.config.is_large_object(l)) {
            return Ok(hand_off(slot, resp, None, Vec::new(), true));
        }
        match self.collect(&mut resp.body, flight).await? {
            Collected::Complete(body) => Ok(Fetched::Uncached {
                status: resp.status,
                headers: relay_headers(&resp.headers).into(),
                body: body.into(),
            }),
            Collected::Overflow(prefix) => Ok(hand_off(slot, resp, None, prefix, true)),
        }
    }

    /// `large_object_threshold` に達するまでボディを読み込む（全待機者が離脱したら中止）
    async fn collect(&self, body: &mut O::Body, flight: &InFlightFetch<FlightResult>) -> Result<Collected, CacheError> {
        let mut out = Vec::new();
        while let Some(chunk) = body.next_chunk().await? {
            if flight.is_abandoned() {
                return Err(CacheError::Cancelled);
            }
            out.extend_from_slice(&chunk);
            if self.config.is_large_object(out.len() as u64) {
                return Ok(Collected::Overflow(out));
            }
        }
        Ok(Collected::Complete(out))
    }

    // ====================
    // メンテナンス・統計
    // ====================

    /// 期限切れエントリを全ディスクから削除
    pub fn sweep_expired(&self) -> u64 {
        let mut freed = 0;
        for disk in &self.disks {
            if disk.health_state().is_available() {
                freed += disk.evict(EvictionPolicy::ExpiredOnly);
            }
        }
        if freed > 0 {
            debug!("[Cache] expired sweep freed {} bytes", freed);
        }
        freed
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            bypasses: self.counters.bypasses.load(Ordering::Relaxed),
            collapsed: self.flights.collapsed(),
            origin_fetches: self.counters.origin_fetches.load(Ordering::Relaxed),
            write_failures: self.counters.write_failures.load(Ordering::Relaxed),
            in_flight: self.flights.len(),
            disks: self.disks.iter().map(|d| d.stats()).collect(),
        }
    }

    /// 少なくとも1台のディスクが利用可能か
    pub fn is_serviceable(&self) -> bool {
        self.disks.iter().any(|d| d.health_state().is_available())
    }
}

impl<O: Origin> HealthSubscriber for NodeCacheEngine<O> {
    fn on_health_event(&self, event: &HealthEvent) {
        if let HealthTarget::Disk(id) = event.target {
            if let Some(disk) = self.disk(id) {
                disk.set_health_state(event.to);
                info!("[Cache] disk {} health {} -> {}", id, event.from, event.to);
            }
        }
    }
}

// ====================
// 引き継ぎ
// ====================

/// レスポンスをリーダーへ引き継ぐ
///
/// `relay_rest` が偽ならオリジンの残りは読まない（`staged` がボディ全体を持つ）
fn hand_off<B>(
    slot: &HandoffSlot<B>,
    resp: OriginResponse<B>,
    staged: Option<BodyReader>,
    buffered: Vec<u8>,
    relay_rest: bool,
) -> Fetched {
    *slot.borrow_mut() = Some(Handoff {
        status: resp.status,
        headers: relay_headers(&resp.headers),
        content_length: resp.content_length,
        body: SplicedBody {
            staged,
            buffered,
            rest: relay_rest.then_some(resp.body),
        },
    });
    Fetched::Direct
}

/// 引き継いだレスポンスをクライアントへ返す
fn respond_handoff<B>(handoff: Handoff<B>, is_head: bool) -> CacheResponse<B> {
    let mut headers = handoff.headers;
    push_header(&mut headers, "X-Cache", CacheStatus::Miss.as_str());
    let bodiless = is_head || handoff.content_length == Some(0);
    CacheResponse {
        status: handoff.status,
        headers,
        content_length: handoff.content_length,
        body: if bodiless { ResponseBody::Empty } else { ResponseBody::Spliced(handoff.body) },
        cache_status: CacheStatus::Miss,
    }
}

// ====================
// ヘッダー操作
// ====================

/// キャッシュフェッチ用のオリジンリクエスト
///
/// 認証・署名ヘッダーはそのまま転送し、条件付き・範囲指定は外す
fn origin_request(req: &Request, range: Option<ByteRange>) -> OriginRequest {
    let mut headers: Headers = req
        .headers
        .iter()
        .filter(|(name, _)| {
            !CachePolicy::is_hop_by_hop(name)
                && !name.eq_ignore_ascii_case(b"range")
                && !name.eq_ignore_ascii_case(b"if-range")
                && !name.eq_ignore_ascii_case(b"if-none-match")
                && !name.eq_ignore_ascii_case(b"if-modified-since")
                && !name.eq_ignore_ascii_case(b"content-length")
                && !name.eq_ignore_ascii_case(b"expect")
        })
        .cloned()
        .collect();
    if let Some(r) = range {
        push_header(&mut headers, "Range", &r.header_value());
    }
    OriginRequest::new("GET", &req.target, headers)
}

/// クライアントへ中継するレスポンスヘッダー（hop-by-hop とフレーミングを除く）
pub(crate) fn relay_headers(headers: &[(Box<[u8]>, Box<[u8]>)]) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| !CachePolicy::is_hop_by_hop(name) && !name.eq_ignore_ascii_case(b"content-length"))
        .cloned()
        .collect()
}

#[inline]
fn push_header(headers: &mut Headers, name: &str, value: &str) {
    headers.push((Box::from(name.as_bytes()), Box::from(value.as_bytes())));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::disk::LocalDisk;
    use crate::cache::key::path_components;
    use crate::health::HealthState;
    use crate::http::{find_header, parse_request, ParseOutcome};
    use crate::origin::collect_body;
    use crate::origin::mock::{MockObject, MockOrigin};
    use tempfile::TempDir;

    type Engine = NodeCacheEngine<Arc<MockOrigin>>;

    struct Fixture {
        engine: Arc<Engine>,
        origin: Arc<MockOrigin>,
        _dirs: Vec<TempDir>,
    }

    fn fixture_with(config: CacheConfig, disks: usize, capacity: u64, fetch_timeout: Duration) -> Fixture {
        let origin = Arc::new(MockOrigin::new());
        let mut dirs = Vec::new();
        let mut stores: Vec<Arc<dyn DiskStore>> = Vec::new();
        for id in 0..disks {
            let dir = tempfile::tempdir().unwrap();
            stores.push(Arc::new(LocalDisk::open(id, dir.path(), capacity, &config).unwrap()));
            dirs.push(dir);
        }
        let engine = Arc::new(NodeCacheEngine::new(config, stores, Arc::clone(&origin), fetch_timeout));
        Fixture {
            engine,
            origin,
            _dirs: dirs,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(CacheConfig::default(), 2, 1 << 20, Duration::from_secs(5))
    }

    fn request(raw: &str) -> Request {
        match parse_request(raw.as_bytes()) {
            ParseOutcome::Complete(req, _) => req,
            other => panic!("bad request {:?}", other),
        }
    }

    fn get(path: &str, extra: &str) -> Request {
        request(&format!("GET {} HTTP/1.1\r\nHost: origin.test\r\n{}\r\n", path, extra))
    }

    async fn read_body(resp: CacheResponse<crate::origin::mock::MockBody>) -> Vec<u8> {
        match resp.body {
            ResponseBody::Empty => Vec::new(),
            ResponseBody::Memory { data, start, end } => data[start..end].to_vec(),
            ResponseBody::Disk(reader) => reader.read_to_vec().await.unwrap(),
            ResponseBody::Origin(mut body) => collect_body(&mut body).await.unwrap(),
            ResponseBody::Spliced(mut body) => {
                let mut out = Vec::new();
                while let Some(chunk) = body.next_chunk(Vec::new()).await.unwrap() {
                    out.extend_from_slice(&chunk);
                }
                out
            }
        }
    }

    fn header<'a, B>(resp: &'a CacheResponse<B>, name: &str) -> Option<&'a str> {
        find_header(&resp.headers, name).and_then(|v| std::str::from_utf8(v).ok())
    }

    fn key_for(path: &str) -> CacheKey {
        CacheKey::from_request(b"GET", "origin.test", path, None, true).unwrap()
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_miss_then_hit() {
        let f = fixture();
        f.origin.insert("/a", MockObject::ok(b"hello world"));

        let resp = f.engine.serve(&get("/a", ""), Vec::new()).await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.cache_status, CacheStatus::Miss);
        assert_eq!(read_body(resp).await, b"hello world");

        let resp = f.engine.serve(&get("/a", ""), Vec::new()).await;
        assert_eq!(resp.cache_status, CacheStatus::Hit);
        assert_eq!(header(&resp, "X-Cache"), Some("HIT"));
        assert!(matches!(resp.body, ResponseBody::Disk(_)));
        assert_eq!(read_body(resp).await, b"hello world");

        assert_eq!(f.origin.calls(), 1);
        let stats = f.engine.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.object_count(), 1);
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_range_served_from_cache() {
        let f = fixture();
        let body: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        f.origin.insert("/obj", MockObject::ok(&body));
        read_body(f.engine.serve(&get("/obj", ""), Vec::new()).await).await;

        let resp = f.engine.serve(&get("/obj", "Range: bytes=0-99\r\n"), Vec::new()).await;
        assert_eq!(resp.status, 206);
        assert_eq!(header(&resp, "Content-Range"), Some("bytes 0-99/1000"));
        assert_eq!(resp.content_length, Some(100));
        assert_eq!(read_body(resp).await, &body[0..100]);

        let resp = f.engine.serve(&get("/obj", "Range: bytes=-10\r\n"), Vec::new()).await;
        assert_eq!(read_body(resp).await, &body[990..]);

        let resp = f.engine.serve(&get("/obj", "Range: bytes=1000-\r\n"), Vec::new()).await;
        assert_eq!(resp.status, 416);
        assert_eq!(header(&resp, "Content-Range"), Some("bytes */1000"));

        // 複数範囲は無視して全体を返す
        let resp = f.engine.serve(&get("/obj", "Range: bytes=0-1,5-6\r\n"), Vec::new()).await;
        assert_eq!(resp.status, 200);

        assert_eq!(f.origin.calls(), 1);
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_range_miss_fetches_full_object() {
        let f = fixture();
        let body = vec![b'x'; 500];
        f.origin.insert("/big", MockObject::ok(&body));

        let resp = f.engine.serve(&get("/big", "Range: bytes=100-199\r\n"), Vec::new()).await;
        assert_eq!(resp.status, 206);
        assert_eq!(header(&resp, "Content-Range"), Some("bytes 100-199/500"));
        assert_eq!(read_body(resp).await.len(), 100);

        let sent = f.origin.last_request().unwrap();
        assert!(sent.header("range").is_none());

        let resp = f.engine.serve(&get("/big", ""), Vec::new()).await;
        assert_eq!(resp.cache_status, CacheStatus::Hit);
        assert_eq!(f.origin.calls(), 1);
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_requested_range_policy() {
        let config = CacheConfig {
            range_policy: RangePolicy::Requested,
            ..CacheConfig::default()
        };
        let f = fixture_with(config, 2, 1 << 20, Duration::from_secs(5));
        let body: Vec<u8> = (0..200u8).collect();
        f.origin.insert("/part", MockObject::ok(&body));

        let resp = f.engine.serve(&get("/part", "Range: bytes=10-19\r\n"), Vec::new()).await;
        assert_eq!(resp.status, 206);
        assert_eq!(read_body(resp).await, &body[10..20]);
        assert_eq!(
            f.origin.last_request().unwrap().header("range"),
            Some(&b"bytes=10-19"[..])
        );

        let resp = f.engine.serve(&get("/part", "Range: bytes=10-19\r\n"), Vec::new()).await;
        assert_eq!(resp.cache_status, CacheStatus::Hit);
        assert_eq!(header(&resp, "Content-Range"), Some("bytes 10-19/200"));
        assert_eq!(f.origin.calls(), 1);

        // 全体のキーには保存されていない
        assert!(f.engine.lookup(&key_for("/part")).is_none());
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_mutating_methods_pass_through() {
        let f = fixture();
        f.origin.insert("/up", MockObject::ok(b"created").status(201));

        let req = request("PUT /up HTTP/1.1\r\nHost: origin.test\r\nContent-Length: 4\r\nAuthorization: AWS4 sig\r\n\r\n");
        let resp = f.engine.serve(&req, b"data".to_vec()).await;
        assert_eq!(resp.status, 201);
        assert_eq!(resp.cache_status, CacheStatus::Bypass);
        assert_eq!(read_body(resp).await, b"created");

        let sent = f.origin.last_request().unwrap();
        assert_eq!(&*sent.method, "PUT");
        assert_eq!(sent.body, b"data");
        assert_eq!(sent.header("authorization"), Some(&b"AWS4 sig"[..]));

        assert_eq!(f.engine.stats().object_count(), 0);
        for method in ["POST", "DELETE"] {
            let req = request(&format!("{} /up HTTP/1.1\r\nHost: origin.test\r\n\r\n", method));
            let resp = f.engine.serve(&req, Vec::new()).await;
            assert_eq!(resp.cache_status, CacheStatus::Bypass);
        }
        assert_eq!(f.origin.calls(), 3);
        assert_eq!(f.engine.stats().object_count(), 0);
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_concurrent_misses_share_one_fetch() {
        let f = fixture();
        f.origin.insert("/hot", MockObject::ok(b"shared body"));
        f.origin.set_delay(100);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = Arc::clone(&f.engine);
            handles.push(monoio::spawn(async move {
                let resp = engine.serve(&get("/hot", ""), Vec::new()).await;
                (resp.status, read_body(resp).await)
            }));
        }
        for h in handles {
            let (status, body) = h.await;
            assert_eq!(status, 200);
            assert_eq!(body, b"shared body");
        }

        assert_eq!(f.origin.calls(), 1);
        let stats = f.engine.stats();
        assert_eq!(stats.collapsed, 7);
        assert_eq!(stats.origin_fetches, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_uncacheable_responses_not_stored() {
        let f = fixture();
        f.origin.insert("/private", MockObject::ok(b"secret").header("Cache-Control", "no-store"));
        f.origin.insert("/missing", MockObject::ok(b"nope").status(404));

        for _ in 0..2 {
            let resp = f.engine.serve(&get("/private", ""), Vec::new()).await;
            assert_eq!(resp.status, 200);
            assert_eq!(read_body(resp).await, b"secret");
            let resp = f.engine.serve(&get("/missing", ""), Vec::new()).await;
            assert_eq!(resp.status, 404);
        }
        assert_eq!(f.origin.calls(), 4);
        assert_eq!(f.engine.stats().object_count(), 0);
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_unhealthy_disk_excluded_from_writes() {
        let f = fixture_with(CacheConfig::default(), 3, 1 << 20, Duration::from_secs(5));
        f.origin.insert("/d", MockObject::ok(b"payload"));
        let key = key_for("/d");
        let primary = f.engine.primary_disk(&key);

        let down = HealthEvent {
            target: HealthTarget::Disk(primary),
            from: HealthState::Suspect,
            to: HealthState::Unhealthy,
        };
        f.engine.on_health_event(&down);
        assert_eq!(f.engine.disks()[primary].health_state(), HealthState::Unhealthy);

        read_body(f.engine.serve(&get("/d", ""), Vec::new()).await).await;
        let entry = f.engine.lookup(&key).unwrap();
        assert_ne!(entry.disk_id, primary);
        assert_eq!(entry.disk_id, (primary + 1) % 3);

        // 復帰後もフォールバックから読める
        f.engine.on_health_event(&HealthEvent {
            target: HealthTarget::Disk(primary),
            from: HealthState::Unhealthy,
            to: HealthState::Healthy,
        });
        let resp = f.engine.serve(&get("/d", ""), Vec::new()).await;
        assert_eq!(resp.cache_status, CacheStatus::Hit);
        assert_eq!(f.origin.calls(), 1);
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_full_disk_still_serves() {
        let f = fixture_with(CacheConfig::default(), 1, 64, Duration::from_secs(5));
        let body = vec![1u8; 4096];
        f.origin.insert("/large", MockObject::ok(&body));

        let resp = f.engine.serve(&get("/large", ""), Vec::new()).await;
        assert_eq!(resp.status, 200);
        assert_eq!(read_body(resp).await, body);

        let stats = f.engine.stats();
        assert_eq!(stats.write_failures, 1);
        assert_eq!(stats.object_count(), 0);
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_origin_timeout_returns_504() {
        let f = fixture_with(CacheConfig::default(), 1, 1 << 20, Duration::from_millis(50));
        f.origin.insert("/slow", MockObject::ok(b"late"));
        f.origin.set_delay(300);

        let resp = f.engine.serve(&get("/slow", ""), Vec::new()).await;
        assert_eq!(resp.status, 504);
        assert_eq!(f.engine.stats().object_count(), 0);
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_origin_unreachable_returns_502() {
        let f = fixture();
        f.origin.fail_with(|| CacheError::OriginUnreachable("connection refused".into()));
        let resp = f.engine.serve(&get("/x", ""), Vec::new()).await;
        assert_eq!(resp.status, 502);
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_if_none_match_and_head() {
        let f = fixture();
        f.origin.insert("/e", MockObject::ok(b"tagged").header("ETag", "\"abc\""));

        // HEAD のミスは GET で取得して保存する
        let head = request("HEAD /e HTTP/1.1\r\nHost: origin.test\r\n\r\n");
        let resp = f.engine.serve(&head, Vec::new()).await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.content_length, Some(6));
        assert!(resp.is_bodiless());
        assert_eq!(&*f.origin.last_request().unwrap().method, "GET");

        let resp = f.engine.serve(&get("/e", "If-None-Match: \"abc\"\r\n"), Vec::new()).await;
        assert_eq!(resp.status, 304);
        assert_eq!(header(&resp, "ETag"), Some("\"abc\""));

        let resp = f.engine.serve(&get("/e", "If-None-Match: \"zzz\"\r\n"), Vec::new()).await;
        assert_eq!(resp.status, 200);
        assert_eq!(f.origin.calls(), 1);
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_auth_forwarded_but_not_stored() {
        let f = fixture();
        f.origin.insert(
            "/signed?X-Amz-Signature=abc",
            MockObject::ok(b"obj").header("Set-Cookie", "s=1").header("X-Amz-Request-Id", "r1"),
        );

        let req = get("/signed?X-Amz-Signature=abc", "Authorization: AWS4-HMAC-SHA256 Credential=x\r\n");
        read_body(f.engine.serve(&req, Vec::new()).await).await;

        let sent = f.origin.last_request().unwrap();
        assert_eq!(&*sent.target, "/signed?X-Amz-Signature=abc");
        assert!(sent.header("authorization").is_some());

        let entry = f.engine.lookup(&key_for("/signed")).unwrap();
        assert!(entry.header(b"set-cookie").is_none());
        assert!(entry.header(b"authorization").is_none());
        assert!(entry.header(b"x-amz-request-id").is_some());
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_abandoned_fetch_is_not_cached() {
        let f = fixture();
        f.origin.insert("/gone", MockObject::ok(b"body"));
        f.origin.set_delay(100);

        let req = get("/gone", "");
        let serve = f.engine.serve(&req, Vec::new());
        assert!(timeout(Duration::from_millis(20), serve).await.is_err());

        monoio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(f.origin.calls(), 1);
        assert!(f.engine.lookup(&key_for("/gone")).is_none());
        assert_eq!(f.engine.stats().in_flight, 0);
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_large_object_streamed_to_disk() {
        let config = CacheConfig {
            large_object_threshold: 10_000,
            ..CacheConfig::default()
        };
        let f = fixture_with(config, 2, 1 << 20, Duration::from_secs(5));
        let body: Vec<u8> = (0..50_000u32).map(|i| (i % 253) as u8).collect();
        f.origin.insert("/video", MockObject::ok(&body));

        let resp = f.engine.serve(&get("/video", "Range: bytes=20000-20009\r\n"), Vec::new()).await;
        assert_eq!(resp.status, 206);
        assert!(matches!(resp.body, ResponseBody::Disk(_)));
        assert_eq!(read_body(resp).await, &body[20000..20010]);

        let resp = f.engine.serve(&get("/video", ""), Vec::new()).await;
        assert_eq!(resp.cache_status, CacheStatus::Hit);
        assert_eq!(read_body(resp).await, body);
    }

    /// キャッシュディレクトリの位置に通常ファイルを置いて確定できなくする
    fn block_entry_dir(f: &Fixture, path: &str) {
        let (dir1, _, _) = path_components(key_for(path).hash_value());
        std::fs::write(f._dirs[0].path().join(dir1), b"not a directory").unwrap();
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_large_object_commit_failure_still_serves() {
        let config = CacheConfig {
            large_object_threshold: 10_000,
            ..CacheConfig::default()
        };
        let f = fixture_with(config, 1, 1 << 20, Duration::from_secs(5));
        let body: Vec<u8> = (0..50_000u32).map(|i| (i % 241) as u8).collect();
        f.origin.insert("/video", MockObject::ok(&body));
        block_entry_dir(&f, "/video");

        let resp = f.engine.serve(&get("/video", ""), Vec::new()).await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.content_length, Some(50_000));
        assert!(matches!(resp.body, ResponseBody::Spliced(_)));
        assert_eq!(read_body(resp).await, body);

        assert_eq!(f.origin.calls(), 1);
        let stats = f.engine.stats();
        assert_eq!(stats.write_failures, 1);
        assert_eq!(stats.object_count(), 0);
        assert_eq!(stats.disks[0].descriptor.used, 0);
        // ステージングファイルも残らない
        assert_eq!(std::fs::read_dir(f._dirs[0].path().join("tmp")).unwrap().count(), 0);
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_small_object_commit_failure_still_serves() {
        let f = fixture_with(CacheConfig::default(), 1, 1 << 20, Duration::from_secs(5));
        f.origin.insert("/small", MockObject::ok(b"tiny body"));
        block_entry_dir(&f, "/small");

        let resp = f.engine.serve(&get("/small", ""), Vec::new()).await;
        assert_eq!(resp.status, 200);
        assert_eq!(read_body(resp).await, b"tiny body");
        assert_eq!(f.origin.calls(), 1);
        assert_eq!(f.engine.stats().write_failures, 1);
        assert!(f.engine.lookup(&key_for("/small")).is_none());
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_expired_entry_refetched_and_replaced() {
        let f = fixture();
        f.origin.insert("/v", MockObject::ok(b"v1"));
        read_body(f.engine.serve(&get("/v", ""), Vec::new()).await).await;

        // 保存済みエントリを期限切れのもので上書きする
        let key = key_for("/v");
        let disk = Arc::clone(&f.engine.disks()[f.engine.lookup(&key).unwrap().disk_id]);
        let meta = CacheEntryBuilder::new(200)
            .ttl(10)
            .body_size(2)
            .fetched_at(SystemTime::now() - Duration::from_secs(60))
            .build(key.canonical());
        put_body(&*disk, &key, meta, b"v1".to_vec()).await.0.unwrap();
        assert!(f.engine.lookup(&key).is_none());

        f.origin.insert("/v", MockObject::ok(b"v2"));
        let resp = f.engine.serve(&get("/v", ""), Vec::new()).await;
        assert_eq!(resp.cache_status, CacheStatus::Miss);
        assert_eq!(read_body(resp).await, b"v2");
        assert_eq!(f.origin.calls(), 2);

        let resp = f.engine.serve(&get("/v", ""), Vec::new()).await;
        assert_eq!(resp.cache_status, CacheStatus::Hit);
        assert_eq!(read_body(resp).await, b"v2");
        assert_eq!(f.origin.calls(), 2);
        assert_eq!(f.engine.stats().object_count(), 1);
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_corrupt_entry_refetched_and_overwritten() {
        let f = fixture();
        let body: Vec<u8> = (0..300u32).map(|i| (i % 199) as u8).collect();
        f.origin.insert("/c", MockObject::ok(&body));
        read_body(f.engine.serve(&get("/c", ""), Vec::new()).await).await;

        let key = key_for("/c");
        let path = f.engine.lookup(&key).unwrap().path.clone();
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 10]).unwrap();

        let resp = f.engine.serve(&get("/c", ""), Vec::new()).await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.cache_status, CacheStatus::Miss);
        assert_eq!(read_body(resp).await, body);
        assert_eq!(f.origin.calls(), 2);

        let entry = f.engine.lookup(&key).unwrap();
        assert_eq!(std::fs::metadata(&entry.path).unwrap().len(), entry.file_size());
        let resp = f.engine.serve(&get("/c", ""), Vec::new()).await;
        assert_eq!(resp.cache_status, CacheStatus::Hit);
        assert_eq!(read_body(resp).await, body);
        assert_eq!(f.origin.calls(), 2);
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_large_uncacheable_body_is_streamed() {
        let config = CacheConfig {
            large_object_threshold: 10_000,
            ..CacheConfig::default()
        };
        let f = fixture_with(config, 1, 1 << 20, Duration::from_secs(5));
        let body: Vec<u8> = (0..50_000u32).map(|i| (i % 239) as u8).collect();
        f.origin.insert("/live", MockObject::ok(&body).header("Cache-Control", "no-store"));
        f.origin.insert(
            "/feed",
            MockObject::ok(&body).header("Cache-Control", "no-store").without_length(),
        );

        // 長さが分かっていれば読み込まずに中継する
        let resp = f.engine.serve(&get("/live", ""), Vec::new()).await;
        assert_eq!(resp.content_length, Some(50_000));
        match &resp.body {
            ResponseBody::Spliced(b) => assert!(b.staged.is_none() && b.buffered.is_empty()),
            _ => panic!("expected streamed body"),
        }
        assert_eq!(read_body(resp).await, body);

        // 長さが分からなければ上限まで読んだ続きを中継する
        let resp = f.engine.serve(&get("/feed", ""), Vec::new()).await;
        assert_eq!(resp.content_length, None);
        match &resp.body {
            ResponseBody::Spliced(b) => {
                assert!(b.buffered.len() >= 10_000 && b.buffered.len() < body.len());
                assert!(b.rest.is_some());
            }
            _ => panic!("expected streamed body"),
        }
        assert_eq!(read_body(resp).await, body);
        assert_eq!(f.engine.stats().object_count(), 0);
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_large_uncacheable_waiters_fetch_directly() {
        let config = CacheConfig {
            large_object_threshold: 10_000,
            ..CacheConfig::default()
        };
        let f = fixture_with(config, 1, 1 << 20, Duration::from_secs(5));
        let body = vec![9u8; 30_000];
        f.origin.insert("/live", MockObject::ok(&body).header("Cache-Control", "no-store"));
        f.origin.set_delay(50);

        let mut handles = Vec::new();
        for _ in 0..3 {
            let engine = Arc::clone(&f.engine);
            handles.push(monoio::spawn(async move {
                let resp = engine.serve(&get("/live", ""), Vec::new()).await;
                (resp.status, read_body(resp).await)
            }));
        }
        for h in handles {
            let (status, got) = h.await;
            assert_eq!(status, 200);
            assert_eq!(got, body);
        }

        // リーダーの1回と、合流した2件の個別転送
        assert_eq!(f.origin.calls(), 3);
        assert_eq!(f.engine.stats().collapsed, 2);
        assert_eq!(f.engine.stats().in_flight, 0);
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_request_bypass() {
        let config = CacheConfig {
            bypass_patterns: vec!["/api/*".to_string()],
            ..CacheConfig::default()
        };
        let f = fixture_with(config, 1, 1 << 20, Duration::from_secs(5));
        f.origin.insert("/api/x", MockObject::ok(b"dynamic"));
        f.origin.insert("/static", MockObject::ok(b"static"));

        let resp = f.engine.serve(&get("/api/x", ""), Vec::new()).await;
        assert_eq!(resp.cache_status, CacheStatus::Bypass);
        let resp = f.engine.serve(&get("/static", "Cache-Control: no-cache\r\n"), Vec::new()).await;
        assert_eq!(resp.cache_status, CacheStatus::Bypass);
        assert_eq!(f.engine.stats().object_count(), 0);
        assert_eq!(f.engine.stats().bypasses, 2);
    }
}
