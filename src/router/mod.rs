//! # コンシステントハッシュルーター
//!
//! キャッシュキーのハッシュからノードを選び、Unhealthy のノードは
//! リング上の次の物理ノードへ読み替えます。
//!
//! ## 読み手と書き手
//!
//! ```text
//! select_node ──→ RwLock::read ──→ Arc<Topology> を複製して即解放
//! add_node    ──→ 新しい Topology を組み立てて RwLock::write で差し替え
//! set_health  ──→ NodeDescriptor 内の AtomicU8 を更新（リングは不変）
//! ```
//!
//! 読み手は常に古いリングか新しいリングのどちらか一方を見ます。

mod ring;

pub use ring::{vnode_position, HashRing, Successors, DEFAULT_VNODES};

use crate::cache::CacheKey;
use crate::error::CacheError;
use crate::health::{HealthEvent, HealthState, HealthSubscriber, HealthTarget};
use crate::http::Target;
use ftlog::{info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

/// キャッシュノード
#[derive(Debug)]
pub struct NodeDescriptor {
    pub id: Arc<str>,
    /// 接続先（`http://host:port`）
    pub addr: Target,
    pub disk_count: usize,
    health: AtomicU8,
}

impl NodeDescriptor {
    pub fn new(id: &str, addr: Target, disk_count: usize) -> Self {
        Self {
            id: id.into(),
            addr,
            disk_count,
            health: AtomicU8::new(HealthState::Healthy.as_u8()),
        }
    }

    #[inline]
    pub fn health(&self) -> HealthState {
        HealthState::from_u8(self.health.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_health(&self, state: HealthState) {
        self.health.store(state.as_u8(), Ordering::Release);
    }

    #[inline]
    pub fn is_available(&self) -> bool {
        self.health().is_available()
    }
}

/// リングとノード表の一貫したスナップショット
#[derive(Debug, Clone)]
struct Topology {
    ring: HashRing,
    nodes: HashMap<Arc<str>, Arc<NodeDescriptor>>,
}

/// ルーター
pub struct Router {
    topology: RwLock<Arc<Topology>>,
    /// Unhealthy をスキップして辿る物理ノード数の上限（`None` で全ノード）
    max_probes: Option<usize>,
}

impl Router {
    pub fn new(vnodes: usize, max_probes: Option<usize>) -> Self {
        Self {
            topology: RwLock::new(Arc::new(Topology {
                ring: HashRing::new(vnodes),
                nodes: HashMap::new(),
            })),
            max_probes,
        }
    }

    fn snapshot(&self) -> Arc<Topology> {
        Arc::clone(&self.topology.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn update(&self, f: impl FnOnce(&mut Topology) -> bool) -> bool {
        let mut guard = self.topology.write().unwrap_or_else(|e| e.into_inner());
        let mut next = Topology::clone(&guard);
        let changed = f(&mut next);
        if changed {
            *guard = Arc::new(next);
        }
        changed
    }

    /// ノードを追加（同じIDが既にあれば `false`）
    pub fn add_node(&self, node: NodeDescriptor) -> bool {
        let node = Arc::new(node);
        let added = self.update(|t| {
            if !t.ring.add_node(&node.id) {
                return false;
            }
            t.nodes.insert(Arc::clone(&node.id), Arc::clone(&node));
            true
        });
        if added {
            info!("[Router] node {} ({}) added", node.id, node.addr.authority());
        }
        added
    }

    /// ノードを削除
    pub fn remove_node(&self, id: &str) -> bool {
        let removed = self.update(|t| {
            if !t.ring.remove_node(id) {
                return false;
            }
            t.nodes.remove(id);
            true
        });
        if removed {
            info!("[Router] node {} removed", id);
        }
        removed
    }

    /// キーを担当するノード（Unhealthy なら次の物理ノード）
    pub fn select_node(&self, key: &CacheKey) -> Result<Arc<NodeDescriptor>, CacheError> {
        self.candidates(key, 1)
            .into_iter()
            .next()
            .ok_or(CacheError::NoHealthyNode)
    }

    /// リング順に並んだ利用可能なノード（最大 `n` 台）
    pub fn candidates(&self, key: &CacheKey, n: usize) -> Vec<Arc<NodeDescriptor>> {
        let topology = self.snapshot();
        let probes = self.max_probes.unwrap_or(usize::MAX);

        let found: Vec<_> = topology
            .ring
            .successors(key.hash_value())
            .take(probes)
            .filter_map(|id| topology.nodes.get(id))
            .filter(|node| node.is_available())
            .take(n)
            .cloned()
            .collect();
        found
    }

    /// ノードの稼働状態を更新
    pub fn set_health(&self, id: &str, state: HealthState) -> bool {
        match self.snapshot().nodes.get(id) {
            Some(node) => {
                node.set_health(state);
                true
            }
            None => false,
        }
    }

    pub fn node(&self, id: &str) -> Option<Arc<NodeDescriptor>> {
        self.snapshot().nodes.get(id).cloned()
    }

    /// 全ノード（ID順）
    pub fn nodes(&self) -> Vec<Arc<NodeDescriptor>> {
        let topology = self.snapshot();
        let nodes: Vec<_> = topology
            .ring
            .node_ids()
            .filter_map(|id| topology.nodes.get(id).cloned())
            .collect();
        nodes
    }

    /// 1台でも利用可能なノードがあるか
    pub fn is_serviceable(&self) -> bool {
        self.snapshot().nodes.values().any(|n| n.is_available())
    }
}

impl HealthSubscriber for Router {
    fn on_health_event(&self, event: &HealthEvent) {
        if let HealthTarget::Node(id) = &event.target {
            if !self.set_health(id, event.to) {
                warn!("[Router] health event for unknown node {}", id);
            }
        }
    }
}
