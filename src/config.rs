//! # 設定ファイル
//!
//! ```toml
//! role = "node"
//!
//! [server]
//! listen = "0.0.0.0:8080"
//!
//! [origin]
//! url = "http://s3.internal:9000"
//!
//! [node]
//! id = "cache-01"
//!
//! [[node.disks]]
//! path = "/mnt/disk0/cache"
//! capacity = 1_000_000_000_000
//!
//! [cache]
//! default_ttl_secs = 86400
//! ```

use crate::cache::CacheConfig;
use crate::health::HealthConfig;
use crate::http::Target;
use crate::router::DEFAULT_VNODES;
use serde::Deserialize;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_listen() -> String { "0.0.0.0:8080".to_string() }
fn default_connect_timeout_ms() -> u64 { 10_000 }
fn default_fetch_timeout_ms() -> u64 { 30_000 }
fn default_vnodes() -> usize { DEFAULT_VNODES }
fn default_node_timeout_ms() -> u64 { 30_000 }
fn default_disk_count() -> usize { 1 }

/// 起動するプロセスの役割
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// キャッシュノード
    Node,
    /// ロードバランサー
    Router,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Node => "node",
            Role::Router => "router",
        }
    }
}

/// 設定全体
#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub role: Role,

    #[serde(default)]
    pub server: ServerSection,

    pub origin: OriginSection,

    #[serde(default)]
    pub node: Option<NodeSection>,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub router: Option<RouterSection>,

    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServerSection {
    /// 待ち受けアドレス
    ///
    /// デフォルト: "0.0.0.0:8080"
    #[serde(default = "default_listen")]
    pub listen: String,

    /// ワーカースレッド数
    ///
    /// デフォルト: CPU数
    #[serde(default)]
    pub threads: Option<usize>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            threads: None,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct OriginSection {
    /// オリジンURL（`http://host:port/prefix`）
    pub url: String,

    /// 接続タイムアウト（ミリ秒）
    ///
    /// デフォルト: 10000
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// オリジン取得の期限（ミリ秒）
    ///
    /// 超過したフェッチは全待機者に 504 を返し、何も保存しない
    ///
    /// デフォルト: 30000
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
}

impl OriginSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct NodeSection {
    /// ノードID（メトリクスのラベル）
    ///
    /// デフォルト: ホスト名
    #[serde(default)]
    pub id: Option<String>,

    pub disks: Vec<DiskSection>,
}

impl NodeSection {
    /// ノードID（未設定ならホスト名）
    pub fn node_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string())
        })
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct DiskSection {
    /// キャッシュディレクトリ（マウントポイント）
    pub path: PathBuf,
    /// 使用上限（バイト）
    pub capacity: u64,
}

#[derive(Deserialize, Clone, Debug)]
pub struct RouterSection {
    /// 物理ノードあたりの仮想ノード数
    ///
    /// デフォルト: 160
    #[serde(default = "default_vnodes")]
    pub vnodes: usize,

    /// Unhealthy をスキップして辿るノード数の上限
    ///
    /// デフォルト: 全ノード
    #[serde(default)]
    pub max_probes: Option<usize>,

    /// ノードへの1回の転送の期限（ミリ秒）
    ///
    /// デフォルト: 30000
    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,

    pub nodes: Vec<NodeEntry>,
}

impl RouterSection {
    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct NodeEntry {
    pub id: String,
    /// ノードURL（`http://host:port`）
    pub addr: String,
    /// ディスク数
    ///
    /// デフォルト: 1
    #[serde(default = "default_disk_count")]
    pub disks: usize,
}

impl Config {
    /// ファイルから読み込んで検証
    pub fn load(path: &Path) -> io::Result<Self> {
        let config_str = fs::read_to_string(path)?;
        Self::parse(&config_str)
    }

    pub fn parse(config_str: &str) -> io::Result<Self> {
        let config: Config = toml::from_str(config_str)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> io::Result<()> {
        self.listen_addr()?;
        self.origin_target()?;

        match self.role {
            Role::Node => {
                let node = self.node.as_ref().ok_or_else(|| invalid("role = \"node\" requires a [node] section"))?;
                if node.disks.is_empty() {
                    return Err(invalid("[node] requires at least one [[node.disks]] entry"));
                }
                if let Some(disk) = node.disks.iter().find(|d| d.capacity == 0) {
                    return Err(invalid(&format!("disk {} has zero capacity", disk.path.display())));
                }
            }
            Role::Router => {
                let router = self
                    .router
                    .as_ref()
                    .ok_or_else(|| invalid("role = \"router\" requires a [router] section"))?;
                if router.nodes.is_empty() {
                    return Err(invalid("[router] requires at least one [[router.nodes]] entry"));
                }
                for node in &router.nodes {
                    if Target::parse(&node.addr).is_none() {
                        return Err(invalid(&format!("invalid node address for {}: {}", node.id, node.addr)));
                    }
                }
                let mut ids: Vec<&str> = router.nodes.iter().map(|n| n.id.as_str()).collect();
                ids.sort_unstable();
                if ids.windows(2).any(|w| w[0] == w[1]) {
                    return Err(invalid("duplicate node id in [[router.nodes]]"));
                }
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> io::Result<SocketAddr> {
        self.server
            .listen
            .parse()
            .map_err(|_| invalid(&format!("invalid listen address: {}", self.server.listen)))
    }

    pub fn origin_target(&self) -> io::Result<Target> {
        Target::parse(&self.origin.url).ok_or_else(|| invalid(&format!("invalid origin URL: {}", self.origin.url)))
    }

    pub fn threads(&self) -> usize {
        self.server.threads.filter(|&n| n > 0).unwrap_or_else(num_cpus::get)
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RangePolicy;

    const NODE: &str = r#"
role = "node"

[server]
listen = "127.0.0.1:8081"
threads = 2

[origin]
url = "http://127.0.0.1:9000/bucket"
fetch_timeout_ms = 5000

[node]
id = "cache-01"

[[node.disks]]
path = "/tmp/d0"
capacity = 1048576

[[node.disks]]
path = "/tmp/d1"
capacity = 2097152

[cache]
default_ttl_secs = 600
range_policy = "requested"
"#;

    #[test]
    fn test_parse_node() {
        let config = Config::parse(NODE).unwrap();
        assert_eq!(config.role, Role::Node);
        assert_eq!(config.threads(), 2);
        assert_eq!(config.listen_addr().unwrap().port(), 8081);
        assert_eq!(config.origin_target().unwrap().path_prefix, "/bucket");
        assert_eq!(config.origin.fetch_timeout(), Duration::from_secs(5));
        assert_eq!(config.origin.connect_timeout_ms, 10_000);

        let node = config.node.unwrap();
        assert_eq!(node.node_id(), "cache-01");
        assert_eq!(node.disks.len(), 2);
        assert_eq!(node.disks[1].capacity, 2 * 1024 * 1024);

        assert_eq!(config.cache.default_ttl_secs, 600);
        assert_eq!(config.cache.range_policy, RangePolicy::Requested);
        assert_eq!(config.cache.cacheable_statuses, vec![200, 206, 301, 302]);
        assert_eq!(config.health.failure_threshold, 3);
    }

    #[test]
    fn test_parse_router() {
        let config = Config::parse(
            r#"
role = "router"

[origin]
url = "http://origin:9000"

[router]
max_probes = 2

[[router.nodes]]
id = "a"
addr = "http://10.0.0.1:8080"
disks = 4

[[router.nodes]]
id = "b"
addr = "http://10.0.0.2:8080"

[health]
interval_ms = 500
"#,
        )
        .unwrap();

        assert_eq!(config.role, Role::Router);
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        let router = config.router.unwrap();
        assert_eq!(router.vnodes, 160);
        assert_eq!(router.max_probes, Some(2));
        assert_eq!(router.node_timeout(), Duration::from_secs(30));
        assert_eq!(router.nodes[1].disks, 1);
        assert_eq!(config.health.interval_ms, 500);
        assert_eq!(config.health.timeout_ms, 1000);
    }

    #[test]
    fn test_validation_errors() {
        let missing_disks = "role = \"node\"\n[origin]\nurl = \"http://o\"\n[node]\ndisks = []\n";
        assert!(Config::parse(missing_disks).is_err());

        let no_router = "role = \"router\"\n[origin]\nurl = \"http://o\"\n";
        assert!(Config::parse(no_router).is_err());

        let bad_origin = "role = \"router\"\n[origin]\nurl = \"ftp://o\"\n[router]\nnodes = []\n";
        assert!(Config::parse(bad_origin).is_err());

        let dup = r#"
role = "router"
[origin]
url = "http://o"
[[router.nodes]]
id = "a"
addr = "http://h:1"
[[router.nodes]]
id = "a"
addr = "http://h:2"
"#;
        let err = Config::parse(dup).unwrap_err();
        assert!(err.to_string().contains("duplicate"));

        assert!(Config::parse("role = \"proxy\"\n[origin]\nurl = \"http://o\"\n").is_err());
    }
}
