use anyhow::{Result, anyhow};
use tiktoken_rs::{CoreBPE, cl100k_base};

/// Token codec used for summary budgets.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u32>;

    fn decode(&self, tokens: &[u32]) -> Result<String>;

    fn count_tokens(&self, text: &str) -> usize {
        self.encode(text).len()
    }
}

/// cl100k_base BPE (GPT-4/3.5).
pub struct TiktokenTokenizer {
    bpe: CoreBPE,
}

impl TiktokenTokenizer {
    pub fn cl100k() -> Result<Self> {
        let bpe = cl100k_base().map_err(|e| anyhow!("Failed to load cl100k_base: {e}"))?;
        Ok(Self { bpe })
    }
}

impl Tokenizer for TiktokenTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        self.bpe.encode_with_special_tokens(text)
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.bpe
            .decode(tokens.to_vec())
            .map_err(|e| anyhow!("Failed to decode tokens: {e}"))
    }
}
