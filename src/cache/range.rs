//! Range リクエスト
//!
//! `Range: bytes=a-b | a- | -n` の単一範囲のみを扱います。
//! 複数範囲や bytes 以外の単位は無視し、全体を 200 で返します。

use std::fmt::Write as _;

/// 解析済みの Range 指定（ボディサイズ未確定）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `a-b`（両端含む）
    Bounded { start: u64, end: u64 },
    /// `a-`
    From { start: u64 },
    /// `-n`（末尾 n バイト）
    Suffix { len: u64 },
}

/// サイズ確定後の解決結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeResolution {
    /// 返す範囲（両端含む）
    Satisfiable { start: u64, end: u64 },
    /// 416 Range Not Satisfiable
    Unsatisfiable,
}

impl RangeResolution {
    /// 返すバイト数
    pub fn len(&self) -> u64 {
        match *self {
            RangeResolution::Satisfiable { start, end } => end - start + 1,
            RangeResolution::Unsatisfiable => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ByteRange {
    /// Range ヘッダー値を解析
    ///
    /// 無視すべき指定（複数範囲・不明な単位・構文エラー）は `None`
    pub fn parse(value: &[u8]) -> Option<Self> {
        let value = std::str::from_utf8(value).ok()?.trim();
        let (unit, spec) = value.split_once('=')?;
        if !unit.trim().eq_ignore_ascii_case("bytes") {
            return None;
        }

        let spec = spec.trim();
        if spec.contains(',') {
            return None;
        }

        let (first, last) = spec.split_once('-')?;
        let (first, last) = (first.trim(), last.trim());

        if first.is_empty() {
            let len: u64 = last.parse().ok()?;
            if len == 0 {
                return None;
            }
            return Some(ByteRange::Suffix { len });
        }

        let start: u64 = first.parse().ok()?;
        if last.is_empty() {
            return Some(ByteRange::From { start });
        }

        let end: u64 = last.parse().ok()?;
        if end < start {
            return None;
        }
        Some(ByteRange::Bounded { start, end })
    }

    /// ボディサイズに対して範囲を確定
    pub fn resolve(&self, size: u64) -> RangeResolution {
        match *self {
            ByteRange::Bounded { start, end } => {
                if start >= size {
                    RangeResolution::Unsatisfiable
                } else {
                    RangeResolution::Satisfiable {
                        start,
                        end: end.min(size - 1),
                    }
                }
            }
            ByteRange::From { start } => {
                if start >= size {
                    RangeResolution::Unsatisfiable
                } else {
                    RangeResolution::Satisfiable { start, end: size - 1 }
                }
            }
            ByteRange::Suffix { len } => {
                if size == 0 {
                    RangeResolution::Unsatisfiable
                } else {
                    RangeResolution::Satisfiable {
                        start: size.saturating_sub(len),
                        end: size - 1,
                    }
                }
            }
        }
    }

    /// オリジンへ転送する Range ヘッダー値（キャッシュキーの範囲成分にも使う）
    pub fn header_value(&self) -> String {
        let mut s = String::with_capacity(24);
        s.push_str("bytes=");
        let _ = match *self {
            ByteRange::Bounded { start, end } => write!(s, "{}-{}", start, end),
            ByteRange::From { start } => write!(s, "{}-", start),
            ByteRange::Suffix { len } => write!(s, "-{}", len),
        };
        s
    }
}

/// `Content-Range: bytes a-b/size`
pub fn content_range(start: u64, end: u64, size: u64) -> String {
    let mut s = String::with_capacity(40);
    let _ = write!(s, "bytes {}-{}/{}", start, end, size);
    s
}

/// 416 用の `Content-Range: bytes */size`
pub fn unsatisfied_range(size: u64) -> String {
    format!("bytes */{}", size)
}

/// オリジンの 206 応答の `Content-Range` を解析
///
/// `(start, end, total)`、total が `*` の場合は `None`
pub fn parse_content_range(value: &[u8]) -> Option<(u64, u64, Option<u64>)> {
    let value = std::str::from_utf8(value).ok()?.trim();
    let rest = value.strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.trim().split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start, end, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        assert_eq!(
            ByteRange::parse(b"bytes=0-99"),
            Some(ByteRange::Bounded { start: 0, end: 99 })
        );
        assert_eq!(ByteRange::parse(b"bytes=500-"), Some(ByteRange::From { start: 500 }));
        assert_eq!(ByteRange::parse(b"bytes=-100"), Some(ByteRange::Suffix { len: 100 }));
        assert_eq!(
            ByteRange::parse(b"Bytes = 1-2"),
            Some(ByteRange::Bounded { start: 1, end: 2 })
        );
    }

    #[test]
    fn test_parse_ignored() {
        assert_eq!(ByteRange::parse(b"bytes=0-1,5-6"), None);
        assert_eq!(ByteRange::parse(b"items=0-1"), None);
        assert_eq!(ByteRange::parse(b"bytes=5-1"), None);
        assert_eq!(ByteRange::parse(b"bytes=abc"), None);
        assert_eq!(ByteRange::parse(b"bytes=-0"), None);
        assert_eq!(ByteRange::parse(b"bytes=-"), None);
    }

    #[test]
    fn test_resolve() {
        let r = ByteRange::Bounded { start: 0, end: 99 };
        assert_eq!(r.resolve(1000), RangeResolution::Satisfiable { start: 0, end: 99 });
        // 末尾を超える end は切り詰め
        assert_eq!(r.resolve(50), RangeResolution::Satisfiable { start: 0, end: 49 });

        let r = ByteRange::From { start: 1000 };
        assert_eq!(r.resolve(1000), RangeResolution::Unsatisfiable);

        let r = ByteRange::Suffix { len: 2000 };
        assert_eq!(r.resolve(1000), RangeResolution::Satisfiable { start: 0, end: 999 });
        assert_eq!(r.resolve(0), RangeResolution::Unsatisfiable);

        assert_eq!(
            ByteRange::Bounded { start: 10, end: 19 }.resolve(100).len(),
            10
        );
    }

    #[test]
    fn test_header_values() {
        assert_eq!(ByteRange::Bounded { start: 1, end: 5 }.header_value(), "bytes=1-5");
        assert_eq!(ByteRange::From { start: 7 }.header_value(), "bytes=7-");
        assert_eq!(ByteRange::Suffix { len: 3 }.header_value(), "bytes=-3");
        assert_eq!(content_range(0, 99, 1000), "bytes 0-99/1000");
        assert_eq!(unsatisfied_range(1000), "bytes */1000");
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range(b"bytes 0-99/1000"), Some((0, 99, Some(1000))));
        assert_eq!(parse_content_range(b"bytes 5-9/*"), Some((5, 9, None)));
        assert_eq!(parse_content_range(b"bytes */1000"), None);
    }
}
