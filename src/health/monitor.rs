//! プローブの実行と状態遷移の配信

use super::{HealthConfig, HealthEvent, HealthState, HealthSubscriber, HealthTarget, HealthTracker};
use crate::cache::DiskStore;
use crate::http::{encode_request, HttpClient, Target};
use dashmap::DashMap;
use ftlog::{debug, error, info, warn};
use monoio::blocking::DefaultThreadPool;
use monoio::time::timeout;
use monoio::RuntimeBuilder;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// ヘルスプローブ
pub trait Probe: 'static {
    fn target(&self) -> HealthTarget;

    /// 1回分のチェック（期限はモニター側で設定する）
    async fn check(&self) -> io::Result<()>;
}

// ====================
// ノードプローブ
// ====================

/// ノードの `GET /health` が 200 を返すか
pub struct NodeProbe {
    id: Arc<str>,
    target: Target,
    client: HttpClient,
}

impl NodeProbe {
    pub fn new(id: Arc<str>, target: Target, timeout: Duration) -> Self {
        Self {
            id,
            target,
            client: HttpClient::new(timeout, timeout),
        }
    }
}

impl Probe for NodeProbe {
    fn target(&self) -> HealthTarget {
        HealthTarget::Node(Arc::clone(&self.id))
    }

    async fn check(&self) -> io::Result<()> {
        let request = encode_request("GET", "/health", &self.target.host_header(), &[], &[]);
        let (head, body) = self.client.send(&self.target, &request, false).await?;
        // 接続をプールへ戻すため読み切る
        body.collect().await?;
        if head.status == 200 {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("health endpoint returned {}", head.status),
            ))
        }
    }
}

// ====================
// ディスクプローブ
// ====================

/// 小さいファイルの書き込み・読み戻し・削除
///
/// 同期 I/O なのでブロッキングプールで実行し、止まったディスクでも期限で打ち切れるようにする
pub struct DiskProbe {
    disk: Arc<dyn DiskStore>,
}

impl DiskProbe {
    pub fn new(disk: Arc<dyn DiskStore>) -> Self {
        Self { disk }
    }
}

impl Probe for DiskProbe {
    fn target(&self) -> HealthTarget {
        HealthTarget::Disk(self.disk.id())
    }

    async fn check(&self) -> io::Result<()> {
        let disk = Arc::clone(&self.disk);
        match monoio::spawn_blocking(move || disk.probe()).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::Other, "disk check canceled")),
        }
    }
}

// ====================
// モニター
// ====================

/// ヘルスモニター
///
/// 対象ごとに独立したタスクで一定間隔のプローブを行い、
/// 状態が変わったときだけ購読者へ通知します。
pub struct HealthMonitor {
    config: HealthConfig,
    subscribers: Vec<Arc<dyn HealthSubscriber>>,
    states: DashMap<HealthTarget, HealthState>,
    stopped: AtomicBool,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            subscribers: Vec::new(),
            states: DashMap::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&mut self, subscriber: Arc<dyn HealthSubscriber>) {
        self.subscribers.push(subscriber);
    }

    #[inline]
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// 最後に観測した状態（未観測なら Healthy）
    pub fn state(&self, target: &HealthTarget) -> HealthState {
        self.states.get(target).map(|s| *s).unwrap_or(HealthState::Healthy)
    }

    /// 全対象の状態
    pub fn snapshot(&self) -> Vec<(HealthTarget, HealthState)> {
        self.states.iter().map(|e| (e.key().clone(), *e.value())).collect()
    }

    /// プローブタスクを終了させる
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    /// 1回プローブして状態を更新（遷移があればイベントを返す）
    pub async fn probe_once<P: Probe>(&self, probe: &P, tracker: &mut HealthTracker) -> Option<HealthEvent> {
        let target = probe.target();
        let deadline = Duration::from_millis(self.config.timeout_ms);

        let success = match timeout(deadline, probe.check()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("[Health] {} probe failed: {}", target, e);
                false
            }
            Err(_) => {
                debug!("[Health] {} probe timed out after {:?}", target, deadline);
                false
            }
        };

        let (from, to) = tracker.record(success)?;
        self.states.insert(target.clone(), to);

        let event = HealthEvent { target, from, to };
        match to {
            HealthState::Unhealthy => warn!("[Health] {} {} -> {}", event.target, from, to),
            _ => info!("[Health] {} {} -> {}", event.target, from, to),
        }
        self.publish(&event);
        Some(event)
    }

    fn publish(&self, event: &HealthEvent) {
        for subscriber in &self.subscribers {
            subscriber.on_health_event(event);
        }
    }

    /// 停止するまで一定間隔でプローブを繰り返す
    pub async fn watch<P: Probe>(self: Arc<Self>, probe: P) {
        let mut tracker = HealthTracker::from_config(&self.config);
        let interval = Duration::from_millis(self.config.interval_ms);
        self.states.insert(probe.target(), tracker.state());

        while !self.is_stopped() {
            self.probe_once(&probe, &mut tracker).await;
            monoio::time::sleep(interval).await;
        }
        debug!("[Health] {} watcher stopped", probe.target());
    }

    /// 専用スレッドで全対象の監視を開始
    pub fn start(
        self: Arc<Self>,
        nodes: Vec<NodeProbe>,
        disks: Vec<DiskProbe>,
    ) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("health-monitor".to_string())
            .spawn(move || {
                let pool = DefaultThreadPool::new(disks.len().max(1));
                let mut rt = match RuntimeBuilder::<monoio::FusionDriver>::new()
                    .enable_timer()
                    .attach_thread_pool(Box::new(pool))
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("[Health] Failed to create runtime: {}", e);
                        return;
                    }
                };
                rt.block_on(async move {
                    info!(
                        "[Health] Monitoring {} nodes and {} disks every {}ms",
                        nodes.len(),
                        disks.len(),
                        self.config.interval_ms
                    );

                    let mut handles = Vec::new();
                    for probe in nodes {
                        handles.push(monoio::spawn(Arc::clone(&self).watch(probe)));
                    }
                    for probe in disks {
                        handles.push(monoio::spawn(Arc::clone(&self).watch(probe)));
                    }
                    for handle in handles {
                        handle.await;
                    }
                });
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, LocalDisk};
    use std::io::{Read, Write};
    use std::sync::Mutex;

    /// 結果を外から切り替えられるプローブ
    struct ScriptedProbe {
        ok: Arc<AtomicBool>,
        delay_ms: u64,
    }

    impl Probe for ScriptedProbe {
        fn target(&self) -> HealthTarget {
            HealthTarget::Node("n1".into())
        }

        async fn check(&self) -> io::Result<()> {
            if self.delay_ms > 0 {
                monoio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.ok.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(io::Error::new(io::ErrorKind::Other, "down"))
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<HealthEvent>>,
    }

    impl HealthSubscriber for Recorder {
        fn on_health_event(&self, event: &HealthEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn monitor_with(recorder: &Arc<Recorder>, timeout_ms: u64) -> HealthMonitor {
        let mut monitor = HealthMonitor::new(HealthConfig {
            interval_ms: 10,
            timeout_ms,
            failure_threshold: 3,
            success_threshold: 2,
        });
        monitor.subscribe(Arc::clone(recorder) as Arc<dyn HealthSubscriber>);
        monitor
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_transitions_are_published() {
        let recorder = Arc::new(Recorder::default());
        let monitor = monitor_with(&recorder, 100);
        let ok = Arc::new(AtomicBool::new(false));
        let probe = ScriptedProbe { ok: Arc::clone(&ok), delay_ms: 0 };
        let mut tracker = HealthTracker::from_config(monitor.config());

        for _ in 0..4 {
            monitor.probe_once(&probe, &mut tracker).await;
        }
        ok.store(true, Ordering::SeqCst);
        for _ in 0..2 {
            monitor.probe_once(&probe, &mut tracker).await;
        }

        let events = recorder.events.lock().unwrap();
        let transitions: Vec<_> = events.iter().map(|e| (e.from, e.to)).collect();
        assert_eq!(
            transitions,
            vec![
                (HealthState::Healthy, HealthState::Suspect),
                (HealthState::Suspect, HealthState::Unhealthy),
                (HealthState::Unhealthy, HealthState::Healthy),
            ]
        );
        assert_eq!(monitor.state(&probe.target()), HealthState::Healthy);
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_slow_probe_counts_as_failure() {
        let recorder = Arc::new(Recorder::default());
        let monitor = monitor_with(&recorder, 20);
        let probe = ScriptedProbe {
            ok: Arc::new(AtomicBool::new(true)),
            delay_ms: 200,
        };
        let mut tracker = HealthTracker::from_config(monitor.config());

        let event = monitor.probe_once(&probe, &mut tracker).await.unwrap();
        assert_eq!(event.to, HealthState::Suspect);
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_watch_stops_on_flag() {
        let recorder = Arc::new(Recorder::default());
        let monitor = Arc::new(monitor_with(&recorder, 50));
        let probe = ScriptedProbe {
            ok: Arc::new(AtomicBool::new(false)),
            delay_ms: 0,
        };

        let handle = monoio::spawn(Arc::clone(&monitor).watch(probe));
        monoio::time::sleep(Duration::from_millis(100)).await;
        monitor.stop();
        handle.await;

        assert_eq!(monitor.state(&HealthTarget::Node("n1".into())), HealthState::Unhealthy);
        assert_eq!(recorder.events.lock().unwrap().len(), 2);
    }

    /// ディスクチェック用のブロッキングプール付きランタイム
    fn block_on_pooled<F: std::future::Future>(fut: F) -> F::Output {
        let mut rt = RuntimeBuilder::<monoio::FusionDriver>::new()
            .enable_timer()
            .attach_thread_pool(Box::new(DefaultThreadPool::new(2)))
            .build()
            .unwrap();
        rt.block_on(fut)
    }

    #[test]
    fn test_disk_probe() {
        block_on_pooled(async {
            let dir = tempfile::tempdir().unwrap();
            let disk = Arc::new(LocalDisk::open(3, dir.path(), 1 << 20, &CacheConfig::default()).unwrap());
            let probe = DiskProbe::new(disk);
            assert_eq!(probe.target(), HealthTarget::Disk(3));
            assert!(probe.check().await.is_ok());

            // マウントが消えた状態
            drop(dir);
            assert!(probe.check().await.is_err());
        });
    }

    /// 動作確認だけが止まるディスク
    struct StalledDisk {
        inner: LocalDisk,
        stall: Duration,
    }

    impl DiskStore for StalledDisk {
        fn id(&self) -> usize {
            self.inner.id()
        }
        fn descriptor(&self) -> crate::cache::DiskDescriptor {
            self.inner.descriptor()
        }
        fn get(&self, key: &crate::cache::CacheKey) -> Option<Arc<crate::cache::CacheEntry>> {
            self.inner.get(key)
        }
        fn begin_put(
            &self,
            key: &crate::cache::CacheKey,
            meta: crate::cache::EntryMeta,
            expected_body: u64,
        ) -> Result<crate::cache::StagedWrite, crate::error::CacheError> {
            self.inner.begin_put(key, meta, expected_body)
        }
        fn commit(
            &self,
            staged: &mut crate::cache::StagedWrite,
        ) -> Result<Arc<crate::cache::CacheEntry>, crate::error::CacheError> {
            self.inner.commit(staged)
        }
        fn evict(&self, policy: crate::cache::EvictionPolicy) -> u64 {
            self.inner.evict(policy)
        }
        fn remove(&self, key: &crate::cache::CacheKey) -> bool {
            self.inner.remove(key)
        }
        fn open_body(
            &self,
            entry: &Arc<crate::cache::CacheEntry>,
            start: u64,
            len: u64,
        ) -> Result<crate::cache::BodyReader, crate::error::CacheError> {
            self.inner.open_body(entry, start, len)
        }
        fn health_state(&self) -> HealthState {
            self.inner.health_state()
        }
        fn set_health_state(&self, state: HealthState) {
            self.inner.set_health_state(state)
        }
        fn probe(&self) -> io::Result<()> {
            std::thread::sleep(self.stall);
            self.inner.probe()
        }
        fn stats(&self) -> crate::cache::DiskStats {
            self.inner.stats()
        }
    }

    #[test]
    fn test_stalled_disk_check_times_out() {
        block_on_pooled(async {
            let dir = tempfile::tempdir().unwrap();
            let disk = StalledDisk {
                inner: LocalDisk::open(5, dir.path(), 1 << 20, &CacheConfig::default()).unwrap(),
                stall: Duration::from_millis(400),
            };
            let recorder = Arc::new(Recorder::default());
            let mut monitor = HealthMonitor::new(HealthConfig {
                interval_ms: 10,
                timeout_ms: 50,
                failure_threshold: 1,
                success_threshold: 1,
            });
            monitor.subscribe(Arc::clone(&recorder) as Arc<dyn HealthSubscriber>);
            let probe = DiskProbe::new(Arc::new(disk));
            let mut tracker = HealthTracker::from_config(monitor.config());

            let started = std::time::Instant::now();
            let event = monitor.probe_once(&probe, &mut tracker).await.unwrap();
            assert!(started.elapsed() < Duration::from_millis(300));
            assert_eq!(event.target, HealthTarget::Disk(5));
            assert_eq!(event.to, HealthState::Unhealthy);
            assert_eq!(recorder.events.lock().unwrap().len(), 1);
        });
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_node_probe_checks_status() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            for (i, stream) in listener.incoming().enumerate().take(2) {
                let mut stream = stream.unwrap();
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let resp: &[u8] = if i == 0 {
                    b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok"
                } else {
                    b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                };
                stream.write_all(resp).unwrap();
            }
        });

        let target = Target::parse(&format!("http://127.0.0.1:{}", port)).unwrap();
        let probe = NodeProbe::new("n1".into(), target, Duration::from_secs(1));
        assert!(probe.check().await.is_ok());
        assert!(probe.check().await.is_err());
    }

    #[monoio::test(driver = "fusion", timer_enabled = true)]
    async fn test_node_probe_connection_refused() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let target = Target::parse(&format!("http://127.0.0.1:{}", port)).unwrap();
        let probe = NodeProbe::new("n2".into(), target, Duration::from_millis(200));
        assert!(probe.check().await.is_err());
    }
}
