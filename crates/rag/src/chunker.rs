//! Deterministic overlapping chunker
//!
//! Splits an article body into retrievable pieces of roughly `target_tokens`
//! tokens with `overlap_tokens` of trailing context carried into the next
//! piece. Boundary preference: paragraph, then sentence, then whitespace.
//! Chunking is pure (same input, same pieces), which keeps re-embedding
//! stable across document versions.

use unicode_segmentation::UnicodeSegmentation;

use quarry_core::ChunkPiece;

/// Chunker configuration
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Target chunk size T in tokens
    pub target_tokens: usize,
    /// Overlap O in tokens between consecutive chunks
    pub overlap_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_tokens: 384,
            overlap_tokens: 64,
        }
    }
}

impl ChunkerConfig {
    pub fn from_settings(cfg: &quarry_config::IndexingConfig) -> Self {
        Self {
            target_tokens: cfg.chunk_tokens,
            overlap_tokens: cfg.chunk_overlap_tokens,
        }
    }
}

/// Deterministic chunker
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    /// Split a body into ordered pieces. Empty and whitespace-only bodies
    /// produce no pieces.
    pub fn chunk(&self, body: &str) -> Vec<ChunkPiece> {
        let segments = self.segment(body);
        if segments.is_empty() {
            return Vec::new();
        }

        let mut pieces: Vec<ChunkPiece> = Vec::new();
        let mut current = String::new();
        let mut current_tokens = 0;

        for segment in &segments {
            let segment_tokens = estimate_tokens(segment);

            if current_tokens + segment_tokens > self.config.target_tokens && !current.is_empty() {
                let overlap = tail_words(&current, self.config.overlap_tokens);
                pieces.push(self.piece(pieces.len(), current));

                current = overlap;
                current_tokens = estimate_tokens(&current);
            }

            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(segment);
            current_tokens += segment_tokens;
        }

        if !current.trim().is_empty() {
            pieces.push(self.piece(pieces.len(), current));
        }

        pieces
    }

    fn piece(&self, ordinal: usize, text: String) -> ChunkPiece {
        let trimmed = text.trim().to_string();
        let token_count = estimate_tokens(&trimmed);
        ChunkPiece {
            ordinal,
            text: trimmed,
            token_count,
        }
    }

    /// Break the body into segments each at most `target_tokens` tokens,
    /// preferring paragraph boundaries, then sentences, then whitespace
    /// windows.
    fn segment(&self, body: &str) -> Vec<String> {
        let mut segments = Vec::new();

        for paragraph in body.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
            if estimate_tokens(paragraph) <= self.config.target_tokens {
                segments.push(paragraph.to_string());
                continue;
            }

            for sentence in split_sentences(paragraph) {
                if estimate_tokens(&sentence) <= self.config.target_tokens {
                    segments.push(sentence);
                    continue;
                }

                // Oversized sentence: fall back to whitespace windows
                let words: Vec<&str> = sentence.split_whitespace().collect();
                let window = self.config.target_tokens.max(1);
                for chunk in words.chunks(window) {
                    segments.push(chunk.join(" "));
                }
            }
        }

        segments
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(ChunkerConfig::default())
    }
}

/// Split text into sentences, keeping terminators attached. Recognizes
/// Japanese sentence enders alongside Latin punctuation.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    for grapheme in text.graphemes(true) {
        current.push_str(grapheme);
        let c = grapheme.chars().next().unwrap_or(' ');
        if matches!(c, '.' | '!' | '?' | '。' | '！' | '？') {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_string());
            }
            current.clear();
        }
    }

    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    sentences
}

/// Trailing words of `text` totaling at most `max_tokens` tokens
fn tail_words(text: &str, max_tokens: usize) -> String {
    if max_tokens == 0 {
        return String::new();
    }

    let words: Vec<&str> = text.split_whitespace().collect();
    let mut taken: Vec<&str> = Vec::new();
    let mut tokens = 0;

    for word in words.iter().rev() {
        let word_tokens = estimate_tokens(word).max(1);
        if tokens + word_tokens > max_tokens && !taken.is_empty() {
            break;
        }
        taken.push(word);
        tokens += word_tokens;
    }

    taken.reverse();
    taken.join(" ")
}

/// Token estimate by grapheme count. Japanese text runs roughly two
/// graphemes per token; Latin text roughly four.
pub(crate) fn estimate_tokens(text: &str) -> usize {
    let grapheme_count = text.graphemes(true).count();
    if grapheme_count == 0 {
        return 0;
    }

    let japanese_count = text
        .chars()
        .filter(|c| {
            ('\u{3040}'..='\u{30FF}').contains(c) // Hiragana + Katakana
                || ('\u{4E00}'..='\u{9FFF}').contains(c) // CJK unified
        })
        .count();

    if japanese_count > grapheme_count / 3 {
        (grapheme_count / 2).max(1)
    } else {
        (grapheme_count / 4).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(target: usize, overlap: usize) -> Chunker {
        Chunker::new(ChunkerConfig {
            target_tokens: target,
            overlap_tokens: overlap,
        })
    }

    #[test]
    fn test_empty_body_yields_no_pieces() {
        assert!(chunker(50, 10).chunk("").is_empty());
        assert!(chunker(50, 10).chunk("  \n\n  ").is_empty());
    }

    #[test]
    fn test_chunking_is_deterministic() {
        let body = "First paragraph about hardware accelerators.\n\n\
                    Second paragraph with more detail. It has two sentences.\n\n\
                    Third paragraph closes the story.";
        let chunker = chunker(20, 5);
        let first = chunker.chunk(body);
        let second = chunker.chunk(body);
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn test_ordinals_are_sequential() {
        let body = "one two three four five six seven eight. \
                    nine ten eleven twelve thirteen fourteen. \
                    fifteen sixteen seventeen eighteen nineteen twenty."
            .repeat(8);
        let pieces = chunker(10, 2).chunk(&body);
        assert!(pieces.len() > 1);
        for (i, piece) in pieces.iter().enumerate() {
            assert_eq!(piece.ordinal, i);
        }
    }

    #[test]
    fn test_small_paragraph_stays_intact() {
        let body = "Short paragraph.\n\nAnother short one.";
        let pieces = chunker(100, 10).chunk(body);
        assert_eq!(pieces.len(), 1);
        assert!(pieces[0].text.contains("Short paragraph."));
        assert!(pieces[0].text.contains("Another short one."));
    }

    #[test]
    fn test_consecutive_chunks_overlap() {
        let sentence = "alpha beta gamma delta epsilon zeta eta theta. ";
        let body = sentence.repeat(20);
        let pieces = chunker(10, 4).chunk(&body);
        assert!(pieces.len() > 1);

        // The second chunk starts with words from the tail of the first
        let first_words: Vec<&str> = pieces[0].text.split_whitespace().collect();
        let tail = first_words.last().unwrap();
        assert!(pieces[1].text.split_whitespace().any(|w| w == *tail));
    }

    #[test]
    fn test_oversized_sentence_splits_on_whitespace() {
        let body = (0..400)
            .map(|i| format!("word{}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let pieces = chunker(20, 4).chunk(&body);
        assert!(pieces.len() > 1);
        for piece in &pieces {
            assert!(!piece.text.is_empty());
        }
    }

    #[test]
    fn test_japanese_token_estimate() {
        let english = "Hello, how are you today?";
        let japanese = "今日はいい天気ですね。散歩に行きましょう。";

        assert!(estimate_tokens(english) > 0);
        // Japanese graphemes count roughly double weight
        assert!(estimate_tokens(japanese) >= japanese.chars().count() / 2 - 1);
    }

    #[test]
    fn test_japanese_sentences_split() {
        let text = "これは最初の文です。これは二番目の文です。";
        let sentences = split_sentences(text);
        assert_eq!(sentences.len(), 2);
    }
}
