use std::sync::Arc;

use crate::error::VlmError;

/// Text tokenizer seam, implemented for [`tokenizers::Tokenizer`].
pub trait TextTokenizer: Send + Sync {
    /// Encode without adding special tokens; special tokens written in `text` are kept.
    fn encode(&self, text: &str) -> Result<Vec<u32>, VlmError>;

    /// Decode, skipping special tokens.
    fn decode(&self, ids: &[u32]) -> Result<String, VlmError>;

    fn token_to_id(&self, token: &str) -> Option<u32>;
}

// `Tokenizer` derefs to `TokenizerImpl`; calls go through `**self` so they reach the
// inner methods instead of this trait.
impl TextTokenizer for tokenizers::Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, VlmError> {
        let encoding = (**self)
            .encode(text, false)
            .map_err(|e| VlmError::TokenizationFailure(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String, VlmError> {
        (**self)
            .decode(ids, true)
            .map_err(|e| VlmError::TokenizationFailure(e.to_string()))
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        (**self).token_to_id(token)
    }
}

/// Turns a growing token sequence into text deltas.
///
/// Decoding a window that starts one token early keeps word-boundary spaces intact, and
/// text ending in an incomplete UTF-8 sequence is held back until it completes.
pub struct IncrementalDecoder {
    tokenizer: Arc<dyn TextTokenizer>,
    tokens: Vec<u32>,
    prev_index: usize,
    current_index: usize,
}

impl IncrementalDecoder {
    pub fn new(tokenizer: Arc<dyn TextTokenizer>) -> Self {
        Self {
            tokenizer,
            tokens: Vec::new(),
            prev_index: 0,
            current_index: 0,
        }
    }

    /// Push a token and return the text it completes, if any.
    pub fn next_token(&mut self, token: u32) -> Result<Option<String>, VlmError> {
        let prev_text = if self.tokens.is_empty() {
            String::new()
        } else {
            self.tokenizer
                .decode(&self.tokens[self.prev_index..self.current_index])?
        };
        self.tokens.push(token);
        let text = self.tokenizer.decode(&self.tokens[self.prev_index..])?;

        if text.len() > prev_text.len() && !text.ends_with('\u{FFFD}') {
            let delta = text.get(prev_text.len()..).unwrap_or_default().to_string();
            self.prev_index = self.current_index;
            self.current_index = self.tokens.len();
            Ok(Some(delta))
        } else {
            Ok(None)
        }
    }

    /// Text held back so far.
    pub fn flush(&mut self) -> Result<Option<String>, VlmError> {
        let prev_text = if self.tokens.is_empty() {
            String::new()
        } else {
            self.tokenizer
                .decode(&self.tokens[self.prev_index..self.current_index])?
        };
        let text = self.tokenizer.decode(&self.tokens[self.prev_index..])?;
        self.prev_index = self.current_index;
        self.current_index = self.tokens.len();
        if text.len() > prev_text.len() {
            Ok(text.get(prev_text.len()..).map(str::to_string))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Letters;

    impl TextTokenizer for Letters {
        fn encode(&self, text: &str) -> Result<Vec<u32>, VlmError> {
            Ok(text.bytes().map(u32::from).collect())
        }

        fn decode(&self, ids: &[u32]) -> Result<String, VlmError> {
            Ok(ids.iter().filter_map(|&i| char::from_u32(i)).collect())
        }

        fn token_to_id(&self, token: &str) -> Option<u32> {
            token.bytes().next().map(u32::from)
        }
    }

    #[test]
    fn test_incremental_deltas() -> Result<(), VlmError> {
        let mut decoder = IncrementalDecoder::new(Arc::new(Letters));
        let mut out = String::new();
        for id in "hi there".bytes() {
            if let Some(delta) = decoder.next_token(u32::from(id))? {
                out.push_str(&delta);
            }
        }
        if let Some(rest) = decoder.flush()? {
            out.push_str(&rest);
        }
        assert_eq!(out, "hi there");
        Ok(())
    }

    fn word_level() -> tokenizers::Tokenizer {
        let json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [{
                "id": 1, "content": "<end>", "single_word": false, "lstrip": false,
                "rstrip": false, "normalized": false, "special": true
            }],
            "normalizer": null,
            "pre_tokenizer": {"type": "WhitespaceSplit"},
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": {"<unk>": 0, "<end>": 1, "hello": 2, "world": 3},
                "unk_token": "<unk>"
            }
        });
        tokenizers::Tokenizer::from_bytes(json.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn test_hf_tokenizer_seam() -> Result<(), VlmError> {
        let tokenizer = word_level();
        let seam: &dyn TextTokenizer = &tokenizer;

        assert_eq!(seam.encode("hello world<end>")?, vec![2, 3, 1]);
        assert_eq!(seam.encode("world mystery")?, vec![3, 0]);
        assert_eq!(seam.token_to_id("<end>"), Some(1));
        assert_eq!(seam.token_to_id("world"), Some(3));
        assert_eq!(seam.token_to_id("mystery"), None);
        // special tokens are skipped
        assert_eq!(seam.decode(&[2, 1, 3])?, "hello world");
        Ok(())
    }
}
