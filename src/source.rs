//! Source buffers and location mapping.
//!
//! A [`SourceBuffer`] owns the text of one script file together with its
//! interned path and modification timestamp. Byte offsets are mapped to
//! 1-indexed line/column pairs through a precomputed line-offset table.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A half-open byte range into a source buffer, with its resolved
/// line/column for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceSpan {
    /// Byte offset of the first character
    pub offset: u32,
    /// Length in bytes
    pub len: u32,
    /// Line number (1-indexed)
    pub line: u32,
    /// Column number (1-indexed)
    pub col: u32,
}

impl SourceSpan {
    /// Creates a span covering `len` bytes at `offset`.
    pub fn new(offset: u32, len: u32, line: u32, col: u32) -> Self {
        SourceSpan {
            offset,
            len,
            line,
            col,
        }
    }

    /// A span covering both `self` and `other`.
    pub fn merge(&self, other: &SourceSpan) -> SourceSpan {
        let begin = self.offset.min(other.offset);
        let end = (self.offset + self.len).max(other.offset + other.len);
        let (line, col) = if self.offset <= other.offset {
            (self.line, self.col)
        } else {
            (other.line, other.col)
        };
        SourceSpan::new(begin, end - begin, line, col)
    }
}

/// Derives the stable 32-bit module id for a canonicalized path.
pub fn module_id_from_path(path: &str) -> u32 {
    let digest = Sha256::digest(path.as_bytes());
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Derives a stable 64-bit hash for arbitrary text (type names, source
/// contents).
pub fn hash64(text: &[u8]) -> u64 {
    let digest = Sha256::digest(text);
    u64::from_le_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

/// An immutable source unit: text, interned path, modification time.
#[derive(Debug, Clone)]
pub struct SourceBuffer {
    path: String,
    module_id: u32,
    text: String,
    mtime: DateTime<Utc>,
    /// Byte offset of the start of each line
    line_offsets: Vec<u32>,
}

impl SourceBuffer {
    /// Creates a buffer from in-memory text.
    pub fn new(path: impl Into<String>, text: impl Into<String>) -> Self {
        Self::with_mtime(path, text, Utc.timestamp_opt(0, 0).unwrap())
    }

    /// Creates a buffer with an explicit modification time.
    pub fn with_mtime(
        path: impl Into<String>,
        text: impl Into<String>,
        mtime: DateTime<Utc>,
    ) -> Self {
        let path = path.into();
        let text = text.into();
        let mut line_offsets = vec![0u32];
        for (i, b) in text.bytes().enumerate() {
            if b == b'\n' {
                line_offsets.push(i as u32 + 1);
            }
        }
        SourceBuffer {
            module_id: module_id_from_path(&path),
            path,
            text,
            mtime,
            line_offsets,
        }
    }

    /// Reads a buffer from disk, capturing the file's modification time.
    pub fn from_file(path: &std::path::Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let meta = std::fs::metadata(path)?;
        let mtime: DateTime<Utc> = meta.modified()?.into();
        Ok(Self::with_mtime(path.to_string_lossy(), text, mtime))
    }

    /// The interned path this buffer was loaded from.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Stable 32-bit module id derived from the path.
    pub fn module_id(&self) -> u32 {
        self.module_id
    }

    /// The full source text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Modification time of the underlying file (epoch for in-memory buffers).
    pub fn mtime(&self) -> DateTime<Utc> {
        self.mtime
    }

    /// 64-bit content hash, used by the module cache.
    pub fn content_hash(&self) -> u64 {
        hash64(self.text.as_bytes())
    }

    /// Maps a byte offset to a (line, column) pair, both 1-indexed.
    pub fn line_col(&self, offset: u32) -> (u32, u32) {
        let line_idx = match self.line_offsets.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        let col = offset - self.line_offsets[line_idx] + 1;
        (line_idx as u32 + 1, col)
    }

    /// The text of the given 1-indexed line, without its terminator.
    pub fn line_text(&self, line: u32) -> &str {
        let idx = (line.saturating_sub(1)) as usize;
        if idx >= self.line_offsets.len() {
            return "";
        }
        let begin = self.line_offsets[idx] as usize;
        let end = self
            .line_offsets
            .get(idx + 1)
            .map(|o| *o as usize - 1)
            .unwrap_or(self.text.len());
        self.text[begin..end].trim_end_matches('\r')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_col_mapping() {
        let src = SourceBuffer::new("test.gs", "let a = 1;\nlet b = 2;\n");
        assert_eq!(src.line_col(0), (1, 1));
        assert_eq!(src.line_col(4), (1, 5));
        assert_eq!(src.line_col(11), (2, 1));
        assert_eq!(src.line_col(15), (2, 5));
    }

    #[test]
    fn test_line_text() {
        let src = SourceBuffer::new("test.gs", "first\nsecond\nthird");
        assert_eq!(src.line_text(1), "first");
        assert_eq!(src.line_text(2), "second");
        assert_eq!(src.line_text(3), "third");
        assert_eq!(src.line_text(9), "");
    }

    #[test]
    fn test_module_id_stable() {
        let a = module_id_from_path("/tmp/a.gs");
        let b = module_id_from_path("/tmp/a.gs");
        let c = module_id_from_path("/tmp/b.gs");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_span_merge() {
        let a = SourceSpan::new(4, 3, 1, 5);
        let b = SourceSpan::new(10, 2, 1, 11);
        let m = a.merge(&b);
        assert_eq!(m.offset, 4);
        assert_eq!(m.len, 8);
        assert_eq!(m.col, 5);
    }
}
