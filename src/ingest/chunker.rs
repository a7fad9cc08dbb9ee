use crate::error::{Result, RagsyncError};

/// Splits a cleaned document into chunk texts in document order
pub trait Chunker: Send + Sync {
    fn split(&self, text: &str) -> Vec<String>;
}

/// Character-window chunker with overlap.
///
/// A window of `size` characters is extended up to and including the next
/// `'\n'` or `'。'` (whichever comes first) so chunks end on a line or
/// sentence boundary. The next window starts `overlap` characters before the
/// end of the previous one, unless that would not move forward. The window
/// that reaches the end of the text is the last one.
#[derive(Debug, Clone, Copy)]
pub struct CharChunker {
    size: usize,
    overlap: usize,
}

impl CharChunker {
    pub fn new(size: usize, overlap: usize) -> Result<Self> {
        if size == 0 {
            return Err(RagsyncError::Validation("chunk_size must be > 0".to_string()));
        }
        if overlap >= size {
            return Err(RagsyncError::Validation(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                overlap, size
            )));
        }
        Ok(Self { size, overlap })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }
}

impl Chunker for CharChunker {
    fn split(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let len = chars.len();
        let mut chunks = Vec::new();
        let mut start = 0;

        while start < len {
            let mut end = (start + self.size).min(len);
            if end < len {
                if let Some(offset) = chars[end..].iter().position(|&c| c == '\n' || c == '。') {
                    end += offset + 1;
                }
            }

            let chunk: String = chars[start..end].iter().collect();
            // Whitespace-only windows would embed to the zero vector
            if !chunk.trim().is_empty() {
                chunks.push(chunk);
            }

            if end == len {
                break;
            }
            start = match end.checked_sub(self.overlap) {
                Some(next) if next > start => next,
                _ => end,
            };
        }

        log::debug!("Split {} chars into {} chunks", len, chunks.len());
        chunks
    }
}
