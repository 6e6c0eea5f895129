//! Structure-preserving message splitter.
//!
//! Splits text into pieces no longer than the configured size, preferring,
//! in order: paragraph breaks, the end of a complete fenced code block,
//! sentence ends, line breaks, word breaks, and finally a hard cut.  Every
//! candidate except the hard cut must lie past a minimum fraction of the
//! budget so that a boundary near the start does not produce a tiny chunk.
//!
//! Lengths are counted in characters, not bytes.  When an answer needs more
//! than one message each chunk gets a `[Part i/n]` header, and the header is
//! counted against the budget.  A split never leaves a code fence open: if a
//! single code block is longer than the budget, the fence is closed at the
//! end of the chunk and re-opened (with its language tag) in the next one.

use relay_core::config::{MIN_CHUNK_SIZE, TRANSPORT_HARD_LIMIT};

use crate::error::ChannelError;

const FENCE: &str = "```";
/// Bytes appended when a chunk has to close a fence: `"\n```"`.
const FENCE_CLOSE_LEN: usize = 4;
/// Longer "language tags" are not re-emitted on a reopened fence.
const MAX_FENCE_LANG: usize = 20;

/// Output of [`Chunker::chunk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResult {
    pub chunks: Vec<String>,
    pub total_parts: usize,
}

impl ChunkResult {
    fn empty() -> Self {
        Self {
            chunks: Vec::new(),
            total_parts: 0,
        }
    }

    fn single(text: String) -> Self {
        Self {
            chunks: vec![text],
            total_parts: 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Splits text for a transport with a fixed message ceiling.
#[derive(Debug, Clone)]
pub struct Chunker {
    max_size: usize,
}

impl Chunker {
    /// `max_size` must lie within `[MIN_CHUNK_SIZE, TRANSPORT_HARD_LIMIT]`.
    pub fn new(max_size: usize) -> Result<Self, ChannelError> {
        if max_size < MIN_CHUNK_SIZE {
            return Err(ChannelError::ConfigError(format!(
                "chunk size {max_size} is below the minimum of {MIN_CHUNK_SIZE}"
            )));
        }
        if max_size > TRANSPORT_HARD_LIMIT {
            return Err(ChannelError::ConfigError(format!(
                "chunk size {max_size} exceeds the transport limit of {TRANSPORT_HARD_LIMIT}"
            )));
        }
        Ok(Self { max_size })
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn chunk(&self, text: &str) -> ChunkResult {
        chunk_within(text, self.max_size)
    }

    /// Like [`chunk`](Self::chunk) but wraps every chunk in `prefix` and
    /// `suffix`, which are counted against the size budget.
    pub fn chunk_with_affixes(
        &self,
        text: &str,
        prefix: &str,
        suffix: &str,
    ) -> Result<ChunkResult, ChannelError> {
        let affixes = char_len(prefix) + char_len(suffix);
        let effective = self.max_size.saturating_sub(affixes);
        if effective < MIN_CHUNK_SIZE {
            return Err(ChannelError::ConfigError(format!(
                "prefix and suffix leave {effective} characters per chunk, minimum is {MIN_CHUNK_SIZE}"
            )));
        }

        let mut result = chunk_within(text, effective);
        for chunk in &mut result.chunks {
            *chunk = format!("{prefix}{chunk}{suffix}");
        }
        Ok(result)
    }
}

fn chunk_within(text: &str, max: usize) -> ChunkResult {
    if text.is_empty() {
        return ChunkResult::empty();
    }
    if char_len(text) <= max {
        return ChunkResult::single(text.to_string());
    }

    // The header width depends on the number of parts, which is only known
    // after splitting.  Start with room for single digits and widen until
    // the reservation covers the widest header.
    let mut reserve = part_header(9, 9).len();
    loop {
        let pieces = split_all(text, max - reserve);
        let total = pieces.len();
        if total <= 1 {
            return match pieces.into_iter().next() {
                Some(only) => ChunkResult::single(only),
                None => ChunkResult::empty(),
            };
        }

        let needed = part_header(total, total).len();
        if needed <= reserve {
            let chunks = pieces
                .into_iter()
                .enumerate()
                .map(|(i, piece)| format!("{}{}", part_header(i + 1, total), piece))
                .collect();
            return ChunkResult {
                chunks,
                total_parts: total,
            };
        }
        reserve = needed;
    }
}

fn part_header(index: usize, total: usize) -> String {
    format!("[Part {index}/{total}]\n")
}

fn split_all(text: &str, budget: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut remaining = text.to_string();

    while !remaining.is_empty() {
        if char_len(&remaining) <= budget {
            let last = remaining.trim_end();
            if !last.is_empty() {
                pieces.push(last.to_string());
            }
            break;
        }

        let split = find_split_point(&remaining, budget);
        let (head, rest) = remaining.split_at(split.at);
        let head = head.trim_end();

        let next = match split.reopen {
            Some(opener) => {
                if !head.is_empty() {
                    pieces.push(format!("{head}\n{FENCE}"));
                }
                // Keep indentation of the first code line.
                format!("{opener}\n{}", rest.trim_start_matches(['\r', '\n']))
            }
            None => {
                if !head.is_empty() {
                    pieces.push(head.to_string());
                }
                rest.trim_start().to_string()
            }
        };
        remaining = next;
    }

    pieces
}

#[derive(Debug, PartialEq, Eq)]
struct Split {
    /// Byte offset to cut at.
    at: usize,
    /// Fence opener to carry into the next chunk when cutting inside a block.
    reopen: Option<String>,
}

impl Split {
    fn clean(at: usize) -> Self {
        Self { at, reopen: None }
    }
}

/// Choose where to cut `text`, which is longer than `budget` characters.
fn find_split_point(text: &str, budget: usize) -> Split {
    let limit = byte_offset(text, budget);
    let window = &text[..limit];
    let fences = Fences::scan(text, limit);

    let half = byte_offset(text, budget / 2);
    let third = byte_offset(text, budget / 3);
    let quarter = byte_offset(text, budget / 4);

    // 1. Paragraph break.
    for (pos, _) in window.rmatch_indices("\n\n") {
        if pos <= half {
            break;
        }
        if !fences.is_open_at(pos + 2) {
            return Split::clean(pos + 2);
        }
    }

    // 2. End of the last complete code block.
    if let Some(close_end) = fences.last_closed_end(limit) {
        return match text[close_end..limit].find('\n') {
            Some(nl) => Split::clean(close_end + nl + 1),
            None => Split::clean(close_end),
        };
    }

    // 3. Sentence end.
    let bytes = window.as_bytes();
    for i in (0..bytes.len().saturating_sub(1)).rev() {
        if i <= half {
            break;
        }
        let terminator = matches!(bytes[i], b'.' | b'!' | b'?');
        let gap = matches!(bytes[i + 1], b' ' | b'\n');
        if terminator && gap && !fences.is_open_at(i + 2) {
            return Split::clean(i + 2);
        }
    }

    // 4. Line break.
    for (pos, _) in window.rmatch_indices('\n') {
        if pos <= third {
            break;
        }
        if !fences.is_open_at(pos + 1) {
            return Split::clean(pos + 1);
        }
    }

    // 5. Word break.
    for (pos, _) in window.rmatch_indices(' ') {
        if pos <= quarter {
            break;
        }
        if !fences.is_open_at(pos + 1) {
            return Split::clean(pos + 1);
        }
    }

    // 6. Hard cut.
    if !fences.is_open_at(limit) {
        return Split::clean(limit);
    }

    // Inside a code block that does not fit: leave room to close the fence,
    // prefer a line break inside the block, and reopen in the next chunk.
    let cut_limit = byte_offset(text, budget - FENCE_CLOSE_LEN);
    let mut at = text[..cut_limit]
        .rfind('\n')
        .filter(|&nl| nl > third)
        .map(|nl| nl + 1)
        .unwrap_or(cut_limit);
    if let Some(marker) = fences.marker_containing(at) {
        at = marker;
    }

    if fences.is_open_at(at) {
        Split {
            at,
            reopen: Some(fences.opener_before(text, at)),
        }
    } else {
        Split::clean(at)
    }
}

/// Fence marker positions (byte offsets) that start before the window limit.
struct Fences(Vec<usize>);

impl Fences {
    fn scan(text: &str, limit: usize) -> Self {
        Self(
            text.match_indices(FENCE)
                .map(|(i, _)| i)
                .take_while(|&i| i < limit)
                .collect(),
        )
    }

    /// Would cutting at `pos` leave a fence open (or split a marker)?
    fn is_open_at(&self, pos: usize) -> bool {
        if self.marker_containing(pos).is_some() {
            return true;
        }
        self.0.iter().filter(|&&s| s + FENCE.len() <= pos).count() % 2 == 1
    }

    fn marker_containing(&self, pos: usize) -> Option<usize> {
        self.0
            .iter()
            .copied()
            .find(|&s| s < pos && pos < s + FENCE.len())
    }

    /// End offset of the closing marker of the last complete pair within `limit`.
    fn last_closed_end(&self, limit: usize) -> Option<usize> {
        let complete: Vec<usize> = self
            .0
            .iter()
            .copied()
            .filter(|&s| s + FENCE.len() <= limit)
            .collect();
        let paired = complete.len() / 2 * 2;
        if paired == 0 {
            return None;
        }
        Some(complete[paired - 1] + FENCE.len())
    }

    /// Opening marker line (`` ```lang ``) of the block that is open at `pos`.
    fn opener_before(&self, text: &str, pos: usize) -> String {
        let opener = self
            .0
            .iter()
            .copied()
            .filter(|&s| s + FENCE.len() <= pos)
            .last();
        let lang = opener
            .map(|s| {
                text[s + FENCE.len()..]
                    .split('\n')
                    .next()
                    .unwrap_or("")
                    .trim()
            })
            .unwrap_or("");
        let plain = lang.is_empty()
            || lang.len() > MAX_FENCE_LANG
            || lang.contains(|c: char| c.is_whitespace() || c == '`');
        if plain {
            FENCE.to_string()
        } else {
            format!("{FENCE}{lang}")
        }
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Byte offset of the `chars`-th character, or `text.len()` if shorter.
fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
