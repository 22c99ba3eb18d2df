//! Sentence chunking for streaming TTS
//!
//! Splits reply text into speakable segments so synthesis can begin on the
//! first complete sentence instead of waiting for the full LLM reply.
//! Deterministic: the same input always yields the same segments.

/// Sentence-ending punctuation, covering both CJK and Latin scripts
const fn is_sentence_punct(c: char) -> bool {
    matches!(c, '。' | '！' | '？' | '!' | '?' | '.' | '\n')
}

/// Incremental sentence chunker over streamed text fragments
///
/// A segment is emitted once a punctuation run is complete (followed by more
/// text) or the buffer exceeds `max_chars` without a boundary. Segments
/// shorter than `min_chars` are held and merged into the following segment
/// to avoid choppy prosody.
pub struct SentenceChunker {
    buf: String,
    pending: String,
    max_chars: usize,
    min_chars: usize,
}

impl SentenceChunker {
    /// Create a chunker with the given segment length bounds
    #[must_use]
    pub const fn new(max_chars: usize, min_chars: usize) -> Self {
        Self {
            buf: String::new(),
            pending: String::new(),
            max_chars,
            min_chars,
        }
    }

    /// Feed a text fragment, returning any segments completed by it
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buf.push_str(fragment);

        let mut out = Vec::new();
        while let Some(at) = self.find_split() {
            let chars: Vec<char> = self.buf.chars().collect();
            let head: String = chars[..at].iter().collect();
            self.buf = chars[at..].iter().collect();
            self.take_segment(head.trim(), &mut out);
        }
        out
    }

    /// Flush the remaining buffered text as final segments
    #[must_use]
    pub fn finish(mut self) -> Vec<String> {
        let mut out = Vec::new();
        let tail = std::mem::take(&mut self.buf);
        self.take_segment(tail.trim(), &mut out);

        if !self.pending.is_empty() {
            out.extend(hard_split(&self.pending, self.max_chars));
        }
        out
    }

    /// Find the char index after the first complete punctuation run, or the
    /// soft-cut point when the buffer is overlong without a boundary
    fn find_split(&self) -> Option<usize> {
        let chars: Vec<char> = self.buf.chars().collect();

        let mut i = 0;
        while i < chars.len() {
            if is_sentence_punct(chars[i]) {
                let mut j = i + 1;
                while j < chars.len() && is_sentence_punct(chars[j]) {
                    j += 1;
                }
                if j < chars.len() {
                    return Some(j);
                }
                // Run still at the end of the buffer; more punctuation may follow
                break;
            }
            i += 1;
        }

        (chars.len() >= self.max_chars).then_some(self.max_chars)
    }

    /// Merge a completed piece with any pending short segment and emit it,
    /// or hold it when still below the minimum length
    fn take_segment(&mut self, piece: &str, out: &mut Vec<String>) {
        if piece.is_empty() {
            return;
        }

        let merged = if self.pending.is_empty() {
            piece.to_string()
        } else {
            let merged = format!("{} {piece}", self.pending);
            self.pending.clear();
            merged
        };

        if merged.chars().count() < self.min_chars {
            self.pending = merged;
        } else {
            out.extend(hard_split(&merged, self.max_chars));
        }
    }
}

/// Split a complete reply into TTS segments in one pass
#[must_use]
pub fn segment_text(text: &str, max_chars: usize, min_chars: usize) -> Vec<String> {
    let mut chunker = SentenceChunker::new(max_chars, min_chars);
    let mut segments = chunker.push(text);
    segments.extend(chunker.finish());
    segments
}

/// Split a segment that still exceeds `max_chars` at fixed char offsets
fn hard_split(text: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return vec![text.to_string()];
    }

    chars
        .chunks(max_chars)
        .map(|c| c.iter().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_nothing() {
        assert!(segment_text("", 80, 10).is_empty());
        assert!(segment_text("   ", 80, 10).is_empty());
    }

    #[test]
    fn splits_on_sentence_punctuation() {
        let segs = segment_text(
            "The sun is a big warm star. It keeps our planet cozy all year!",
            80,
            10,
        );
        assert_eq!(
            segs,
            vec![
                "The sun is a big warm star.",
                "It keeps our planet cozy all year!",
            ]
        );
    }

    #[test]
    fn handles_cjk_punctuation() {
        let segs = segment_text("今天天气真好。我们一起去公园玩吧！好不好呀？", 80, 3);
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[0], "今天天气真好。");
    }

    #[test]
    fn short_segment_merges_forward() {
        let segs = segment_text("Hi. Let me tell you a story about a brave little fox.", 80, 10);
        assert_eq!(
            segs,
            vec!["Hi. Let me tell you a story about a brave little fox."]
        );
    }

    #[test]
    fn overlong_text_without_punctuation_is_cut() {
        let text = "a ".repeat(100);
        let segs = segment_text(&text, 40, 10);
        assert!(segs.len() > 1);
        assert!(segs.iter().all(|s| s.chars().count() <= 40));
    }

    #[test]
    fn deterministic_for_same_input() {
        let text = "One fish. Two fish! Red fish? Blue fish.";
        assert_eq!(segment_text(text, 80, 5), segment_text(text, 80, 5));
    }

    #[test]
    fn incremental_emission_across_fragments() {
        let mut chunker = SentenceChunker::new(80, 10);

        assert!(chunker.push("Once upon a time").is_empty());
        assert!(chunker.push(" there was a dragon").is_empty());

        // Boundary completes only once text follows the punctuation
        let segs = chunker.push(". It loved to sing");
        assert_eq!(segs, vec!["Once upon a time there was a dragon."]);

        let rest = chunker.finish();
        assert_eq!(rest, vec!["It loved to sing"]);
    }

    #[test]
    fn punctuation_run_stays_attached() {
        let mut chunker = SentenceChunker::new(80, 5);
        let mut segs = chunker.push("Really?! Yes really.");
        segs.extend(chunker.finish());
        assert_eq!(segs, vec!["Really?!", "Yes really."]);
    }
}
