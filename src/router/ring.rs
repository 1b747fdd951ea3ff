//! コンシステントハッシュリング
//!
//! 物理ノードごとに V 個の仮想位置（`xxh3("{node_id}#{i}")`）を持ち、
//! キーのハッシュから時計回りに最初の位置の所有ノードを選びます。
//! ノードの追加・削除で移動するキーは全体の約 1/N に抑えられます。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64;

/// 物理ノードあたりの仮想ノード数（デフォルト）
pub const DEFAULT_VNODES: usize = 160;

/// 仮想ノードの位置
#[inline]
pub fn vnode_position(node_id: &str, index: usize) -> u64 {
    let mut buf = itoa::Buffer::new();
    let index = buf.format(index);
    let mut label = String::with_capacity(node_id.len() + 1 + index.len());
    label.push_str(node_id);
    label.push('#');
    label.push_str(index);
    xxh3_64(label.as_bytes())
}

/// ハッシュリング
#[derive(Debug, Clone)]
pub struct HashRing {
    positions: BTreeMap<u64, Arc<str>>,
    nodes: BTreeSet<Arc<str>>,
    vnodes: usize,
}

impl HashRing {
    pub fn new(vnodes: usize) -> Self {
        Self {
            positions: BTreeMap::new(),
            nodes: BTreeSet::new(),
            vnodes: vnodes.max(1),
        }
    }

    pub fn with_nodes<'a>(vnodes: usize, ids: impl IntoIterator<Item = &'a str>) -> Self {
        let mut ring = Self::new(vnodes);
        for id in ids {
            ring.add_node(id);
        }
        ring
    }

    /// ノードを追加（既に存在すれば `false`）
    pub fn add_node(&mut self, id: &str) -> bool {
        if self.nodes.contains(id) {
            return false;
        }
        let id: Arc<str> = id.into();
        for i in 0..self.vnodes {
            // 位置の衝突は先に置かれたノードを優先
            self.positions
                .entry(vnode_position(&id, i))
                .or_insert_with(|| Arc::clone(&id));
        }
        self.nodes.insert(id);
        true
    }

    /// ノードを削除（存在しなければ `false`）
    pub fn remove_node(&mut self, id: &str) -> bool {
        if !self.nodes.remove(id) {
            return false;
        }
        for i in 0..self.vnodes {
            let pos = vnode_position(id, i);
            if self.positions.get(&pos).is_some_and(|owner| &**owner == id) {
                self.positions.remove(&pos);
            }
        }
        true
    }

    /// ハッシュを所有するノード
    pub fn node_for(&self, hash: u64) -> Option<&Arc<str>> {
        self.positions
            .range(hash..)
            .next()
            .or_else(|| self.positions.iter().next())
            .map(|(_, id)| id)
    }

    /// ハッシュから時計回りに辿った物理ノード（重複なし）
    pub fn successors(&self, hash: u64) -> Successors<'_> {
        Successors {
            iter: Box::new(self.positions.range(hash..).chain(self.positions.range(..hash))),
            seen: Vec::with_capacity(4),
            total: self.nodes.len(),
        }
    }

    #[inline]
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains(id)
    }

    /// 物理ノード数
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// 仮想位置の数
    #[inline]
    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    #[inline]
    pub fn vnodes(&self) -> usize {
        self.vnodes
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &Arc<str>> {
        self.nodes.iter()
    }
}

/// `HashRing::successors` のイテレータ
pub struct Successors<'a> {
    iter: Box<dyn Iterator<Item = (&'a u64, &'a Arc<str>)> + 'a>,
    seen: Vec<&'a Arc<str>>,
    total: usize,
}

impl<'a> Iterator for Successors<'a> {
    type Item = &'a Arc<str>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.seen.len() >= self.total {
            return None;
        }
        for (_, id) in self.iter.by_ref() {
            if !self.seen.iter().any(|s| Arc::ptr_eq(s, id)) {
                self.seen.push(id);
                return Some(id);
            }
        }
        None
    }
}
