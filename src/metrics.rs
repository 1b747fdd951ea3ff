//! # 統計エンドポイント
//!
//! ノードの `/metrics`（Prometheus テキスト形式）と `/cache-stats` の本文を生成します。

use crate::cache::EngineStats;
use std::fmt::Write;

/// Prometheus のラベル値をエスケープ
fn escape_label(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

fn header(out: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} {}", name, kind);
}

fn usage_percent(used: u64, capacity: u64) -> f64 {
    if capacity == 0 {
        0.0
    } else {
        used as f64 * 100.0 / capacity as f64
    }
}

/// `/metrics` の本文
pub fn render_prometheus(node: &str, stats: &EngineStats) -> String {
    let node = escape_label(node);
    let mut out = String::with_capacity(2048);

    header(&mut out, "cache_disk_used_bytes", "gauge", "Bytes used in cache");
    for d in &stats.disks {
        let _ = writeln!(
            out,
            "cache_disk_used_bytes{{node=\"{}\",disk=\"{}\"}} {}",
            node, d.descriptor.id, d.descriptor.used
        );
    }

    header(&mut out, "cache_disk_total_bytes", "gauge", "Total cache capacity in bytes");
    for d in &stats.disks {
        let _ = writeln!(
            out,
            "cache_disk_total_bytes{{node=\"{}\",disk=\"{}\"}} {}",
            node, d.descriptor.id, d.descriptor.capacity
        );
    }

    header(&mut out, "cache_disk_usage_percent", "gauge", "Cache disk usage percentage");
    for d in &stats.disks {
        let _ = writeln!(
            out,
            "cache_disk_usage_percent{{node=\"{}\",disk=\"{}\"}} {:.2}",
            node,
            d.descriptor.id,
            usage_percent(d.descriptor.used, d.descriptor.capacity)
        );
    }

    header(&mut out, "cache_disk_healthy", "gauge", "1 if the disk accepts reads and writes");
    for d in &stats.disks {
        let _ = writeln!(
            out,
            "cache_disk_healthy{{node=\"{}\",disk=\"{}\"}} {}",
            node,
            d.descriptor.id,
            u8::from(d.descriptor.health.is_available())
        );
    }

    header(&mut out, "cache_evictions_total", "counter", "Entries evicted from the disk");
    for d in &stats.disks {
        let _ = writeln!(
            out,
            "cache_evictions_total{{node=\"{}\",disk=\"{}\"}} {}",
            node, d.descriptor.id, d.evictions
        );
    }

    header(&mut out, "cache_object_count", "gauge", "Number of cached objects");
    let _ = writeln!(out, "cache_object_count{{node=\"{}\"}} {}", node, stats.object_count());

    header(&mut out, "cache_hits_total", "counter", "Total cache hits");
    let _ = writeln!(out, "cache_hits_total{{node=\"{}\"}} {}", node, stats.hits);

    header(&mut out, "cache_misses_total", "counter", "Total cache misses");
    let _ = writeln!(out, "cache_misses_total{{node=\"{}\"}} {}", node, stats.misses);

    header(&mut out, "cache_hit_ratio", "gauge", "Cache hit ratio percentage");
    let _ = writeln!(out, "cache_hit_ratio{{node=\"{}\"}} {:.2}", node, stats.hit_ratio());

    header(&mut out, "cache_bypass_total", "counter", "Requests proxied without caching");
    let _ = writeln!(out, "cache_bypass_total{{node=\"{}\"}} {}", node, stats.bypasses);

    header(&mut out, "cache_origin_fetches_total", "counter", "Origin fetches started on a miss");
    let _ = writeln!(out, "cache_origin_fetches_total{{node=\"{}\"}} {}", node, stats.origin_fetches);

    header(&mut out, "cache_collapsed_total", "counter", "Misses that joined an in-flight fetch");
    let _ = writeln!(out, "cache_collapsed_total{{node=\"{}\"}} {}", node, stats.collapsed);

    header(&mut out, "cache_write_failures_total", "counter", "Responses served without being cached");
    let _ = writeln!(out, "cache_write_failures_total{{node=\"{}\"}} {}", node, stats.write_failures);

    out
}

/// `/cache-stats` の本文（JSON）
pub fn render_cache_stats(node: &str, stats: &EngineStats) -> String {
    let mut out = String::with_capacity(1024);
    let _ = write!(
        out,
        "{{\"node\":\"{}\",\"hits\":{},\"misses\":{},\"bypasses\":{},\"hit_ratio\":{:.2},\
         \"origin_fetches\":{},\"collapsed\":{},\"write_failures\":{},\"in_flight\":{},\
         \"objects\":{},\"disks\":[",
        escape_json(node),
        stats.hits,
        stats.misses,
        stats.bypasses,
        stats.hit_ratio(),
        stats.origin_fetches,
        stats.collapsed,
        stats.write_failures,
        stats.in_flight,
        stats.object_count(),
    );
    for (i, d) in stats.disks.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let desc = &d.descriptor;
        let _ = write!(
            out,
            "{{\"id\":{},\"path\":\"{}\",\"health\":\"{}\",\"capacity\":{},\"used\":{},\"free\":{},\
             \"entries\":{},\"evictions\":{},\"writes\":{},\"reads\":{},\"corrupt\":{}}}",
            desc.id,
            escape_json(&desc.mount_path.to_string_lossy()),
            desc.health,
            desc.capacity,
            desc.used,
            desc.capacity.saturating_sub(desc.used),
            d.entries,
            d.evictions,
            d.writes,
            d.reads,
            d.corrupt,
        );
    }
    out.push_str("]}");
    out
}

fn escape_json(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            _ => out.push(c),
        }
    }
    out
}
