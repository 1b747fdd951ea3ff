// ====================
// Chunked Transfer Encoding デコーダ（RFC 7230 Section 4.1 準拠）
// ====================
//
// Chunked-Bodyの構文:
//   chunked-body   = *chunk last-chunk trailer-part CRLF
//   chunk          = chunk-size [ chunk-ext ] CRLF chunk-data CRLF
//   chunk-size     = 1*HEXDIG
//   last-chunk     = 1*("0") [ chunk-ext ] CRLF
//   trailer-part   = *( header-field CRLF )
//
// トレーラーが存在する場合でも終端を検出できるよう、
// ステートマシンで1バイトずつ（データ部はまとめて）処理します。
// ====================

/// Chunkedデコーダの状態
#[derive(Debug, Clone, Copy, PartialEq)]
enum ChunkedState {
    /// チャンクサイズの16進数を読み取り中
    ReadingChunkSize,
    /// チャンク拡張（;以降）をサイズ行の終わりまでスキップ
    ReadingChunkExtension,
    /// チャンクサイズ行の\r後、\nを期待
    ExpectingChunkSizeLF,
    /// チャンクデータを読み取り中
    ReadingChunkData,
    /// チャンクデータ後の\rを期待
    ExpectingChunkDataCR,
    /// チャンクデータ後の\nを期待
    ExpectingChunkDataLF,
    /// トレーラーヘッダーまたは終端の空行を読み取り中
    ReadingTrailerLine,
    /// トレーラー行または終端の\r後、\nを期待
    ExpectingTrailerLF,
    /// 転送完了
    Complete,
    /// 構文エラー
    Invalid,
}

/// Chunked転送デコーダ
#[derive(Debug, Clone)]
pub struct ChunkedDecoder {
    state: ChunkedState,
    /// 現在のチャンクの残りバイト数
    chunk_remaining: u64,
    /// チャンクサイズの解析中に蓄積する16進数値
    size_accumulator: u64,
    /// サイズに少なくとも1文字は含まれているか
    size_has_digit: bool,
    /// トレーラー行が空かどうか（終端検出用）
    trailer_line_empty: bool,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkedState::ReadingChunkSize,
            chunk_remaining: 0,
            size_accumulator: 0,
            size_has_digit: false,
            trailer_line_empty: true,
        }
    }

    /// 終端検出のみ（データはそのまま転送する場合）
    ///
    /// 完了した場合は true
    pub fn feed(&mut self, data: &[u8]) -> bool {
        self.process(data, None);
        self.is_complete()
    }

    /// データ部を `out` に取り出しながら処理
    ///
    /// 消費したバイト数を返す。完了した時点で停止するため、
    /// 戻り値が `data.len()` 未満なら残りは次のメッセージのデータ
    pub fn decode(&mut self, data: &[u8], out: &mut Vec<u8>) -> usize {
        self.process(data, Some(out))
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.state == ChunkedState::Complete
    }

    #[inline]
    pub fn is_invalid(&self) -> bool {
        self.state == ChunkedState::Invalid
    }

    fn process(&mut self, data: &[u8], mut out: Option<&mut Vec<u8>>) -> usize {
        let mut i = 0;
        while i < data.len() {
            match self.state {
                ChunkedState::Complete | ChunkedState::Invalid => break,
                ChunkedState::ReadingChunkData => {
                    let take = (self.chunk_remaining.min((data.len() - i) as u64)) as usize;
                    if let Some(out) = out.as_deref_mut() {
                        out.extend_from_slice(&data[i..i + take]);
                    }
                    self.chunk_remaining -= take as u64;
                    i += take;
                    if self.chunk_remaining == 0 {
                        self.state = ChunkedState::ExpectingChunkDataCR;
                    }
                }
                _ => {
                    self.feed_byte(data[i]);
                    i += 1;
                }
            }
        }
        i
    }

    /// 1バイトを処理（データ部以外）
    #[inline]
    fn feed_byte(&mut self, byte: u8) {
        match self.state {
            ChunkedState::ReadingChunkSize => match byte {
                b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                    let digit = (byte as char).to_digit(16).unwrap_or(0) as u64;
                    match self.size_accumulator.checked_mul(16) {
                        Some(v) => self.size_accumulator = v + digit,
                        None => self.state = ChunkedState::Invalid,
                    }
                    self.size_has_digit = true;
                }
                b';' => self.state = ChunkedState::ReadingChunkExtension,
                b' ' | b'\t' => {}
                b'\r' => self.state = ChunkedState::ExpectingChunkSizeLF,
                _ => self.state = ChunkedState::Invalid,
            },

            ChunkedState::ReadingChunkExtension => {
                if byte == b'\r' {
                    self.state = ChunkedState::ExpectingChunkSizeLF;
                }
            }

            ChunkedState::ExpectingChunkSizeLF => {
                if byte != b'\n' || !self.size_has_digit {
                    self.state = ChunkedState::Invalid;
                    return;
                }
                if self.size_accumulator == 0 {
                    // 最後のチャンク - トレーラーセクションへ
                    self.state = ChunkedState::ReadingTrailerLine;
                    self.trailer_line_empty = true;
                } else {
                    self.chunk_remaining = self.size_accumulator;
                    self.state = ChunkedState::ReadingChunkData;
                }
                self.size_accumulator = 0;
                self.size_has_digit = false;
            }

            ChunkedState::ExpectingChunkDataCR => {
                self.state = if byte == b'\r' {
                    ChunkedState::ExpectingChunkDataLF
                } else {
                    ChunkedState::Invalid
                };
            }

            ChunkedState::ExpectingChunkDataLF => {
                self.state = if byte == b'\n' {
                    ChunkedState::ReadingChunkSize
                } else {
                    ChunkedState::Invalid
                };
            }

            ChunkedState::ReadingTrailerLine => {
                if byte == b'\r' {
                    self.state = ChunkedState::ExpectingTrailerLF;
                } else {
                    self.trailer_line_empty = false;
                }
            }

            ChunkedState::ExpectingTrailerLF => {
                if byte != b'\n' {
                    self.state = ChunkedState::Invalid;
                } else if self.trailer_line_empty {
                    self.state = ChunkedState::Complete;
                } else {
                    self.state = ChunkedState::ReadingTrailerLine;
                    self.trailer_line_empty = true;
                }
            }

            ChunkedState::ReadingChunkData | ChunkedState::Complete | ChunkedState::Invalid => {}
        }
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_simple() {
        let mut d = ChunkedDecoder::new();
        let mut out = Vec::new();
        let input = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let n = d.decode(input, &mut out);
        assert_eq!(n, input.len());
        assert!(d.is_complete());
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn test_decode_split_and_leftover() {
        let mut d = ChunkedDecoder::new();
        let mut out = Vec::new();
        let input = b"a;ext=1\r\n0123456789\r\n0\r\nX-Trailer: v\r\n\r\nHTTP/1.1";
        for piece in input[..10].chunks(3) {
            assert_eq!(d.decode(piece, &mut out), piece.len());
        }
        let n = d.decode(&input[10..], &mut out);
        assert!(d.is_complete());
        assert_eq!(&input[10 + n..], b"HTTP/1.1");
        assert_eq!(out, b"0123456789");
    }

    #[test]
    fn test_feed_detects_end() {
        let mut d = ChunkedDecoder::new();
        assert!(!d.feed(b"3\r\nabc\r\n"));
        assert!(d.feed(b"0\r\n\r\n"));
    }

    #[test]
    fn test_invalid() {
        let mut d = ChunkedDecoder::new();
        let mut out = Vec::new();
        d.decode(b"zz\r\n", &mut out);
        assert!(d.is_invalid());

        let mut d = ChunkedDecoder::new();
        d.decode(b"3\r\nabcX", &mut out);
        assert!(d.is_invalid());
    }
}
