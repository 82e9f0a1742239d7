//! Text segmentation into synthesis units.

/// Split text into sentences at .!? boundaries.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;

    while let Some(end) = find_boundary(&text[start..]) {
        let s = text[start..start + end].trim();
        if !s.is_empty() {
            sentences.push(s);
        }
        start += end;
    }

    // Remainder
    let s = text[start..].trim();
    if !s.is_empty() {
        sentences.push(s);
    }

    sentences
}

/// Split text into word tokens, each carrying its leading whitespace.
///
/// Concatenating the tokens gives back the input minus trailing whitespace.
pub fn split_tokens(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = 0;
    let mut in_word = false;

    for (i, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if in_word {
                tokens.push(&text[start..i]);
                start = i;
                in_word = false;
            }
        } else {
            in_word = true;
        }
    }
    if in_word {
        tokens.push(&text[start..]);
    }

    tokens
}

/// Byte offset just past the first sentence terminator followed by whitespace.
fn find_boundary(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    bytes.iter().enumerate().find_map(|(i, &b)| {
        let terminator = b == b'.' || b == b'!' || b == b'?';
        (terminator && i + 1 < bytes.len() && bytes[i + 1].is_ascii_whitespace()).then_some(i + 1)
    })
}

/// Incremental sentence segmentation for token-by-token input.
///
/// A sentence is released once the whitespace after its terminator arrives;
/// whatever is left is released by `finish`.
#[derive(Debug, Default)]
pub struct SentenceSplitter {
    buffer: String,
}

impl SentenceSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fragment and return every sentence it completed.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buffer.push_str(fragment);

        let mut complete = Vec::new();
        while let Some(end) = find_boundary(&self.buffer) {
            let sentence = self.buffer[..end].trim().to_string();
            self.buffer.drain(..end);
            if !sentence.is_empty() {
                complete.push(sentence);
            }
        }
        complete
    }

    /// Release the pending partial sentence, if any.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }
}
