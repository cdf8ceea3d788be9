//! Feature-hashing embedder.

use async_trait::async_trait;
use tracing::debug;

use kb_core::{Embedder, KbError, Result};

/// Number of buckets the whole-text digest is spread over.
const WHOLE_TEXT_BUCKETS: usize = 8;

/// Share of the squared norm carried by the whole-text digest.
const WHOLE_TEXT_WEIGHT: f32 = 0.25;

/// Embeds text by hashing each lowercase word token into a signed bucket,
/// plus a small component derived from the exact text.
///
/// Token overlap drives similarity. The whole-text component keeps distinct
/// strings apart even when they tokenize alike (case, punctuation, word
/// order), so only identical texts sit at distance zero, and text with no
/// word tokens still gets a unit vector.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    /// Create an embedder producing vectors of `dimension` components.
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(KbError::config("embedding dimension must be positive"));
        }
        Ok(Self { dimension })
    }

    /// Embed one text synchronously.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut tokens = vec![0.0f32; self.dimension];
        for token in tokenize(text) {
            let (index, sign) = self.bucket(blake3::hash(token.as_bytes()).as_bytes());
            tokens[index] += sign;
        }

        let token_norm = l2_norm(&tokens);
        let (token_scale, whole_scale) = if token_norm > 0.0 {
            (
                (1.0 - WHOLE_TEXT_WEIGHT).sqrt() / token_norm,
                WHOLE_TEXT_WEIGHT.sqrt(),
            )
        } else {
            (0.0, 1.0)
        };

        let mut embedding: Vec<f32> = tokens.iter().map(|x| x * token_scale).collect();
        let component = whole_scale / (WHOLE_TEXT_BUCKETS as f32).sqrt();
        for (index, sign) in self.whole_text_buckets(text) {
            embedding[index] += sign * component;
        }

        // Buckets can collide, so normalize once more
        let norm = l2_norm(&embedding);
        if norm > 0.0 {
            for x in &mut embedding {
                *x /= norm;
            }
        }
        embedding
    }

    fn whole_text_buckets(&self, text: &str) -> Vec<(usize, f32)> {
        let mut hasher = blake3::Hasher::new_derive_key("kb-embed whole text");
        hasher.update(text.as_bytes());
        let mut reader = hasher.finalize_xof();

        let mut buckets = Vec::with_capacity(WHOLE_TEXT_BUCKETS);
        let mut block = [0u8; 9];
        for _ in 0..WHOLE_TEXT_BUCKETS {
            reader.fill(&mut block);
            buckets.push(self.bucket(&block));
        }
        buckets
    }

    /// Bucket index from the first eight bytes, sign from the ninth.
    fn bucket(&self, bytes: &[u8]) -> (usize, f32) {
        let mut head = [0u8; 8];
        head.copy_from_slice(&bytes[..8]);
        let index = (u64::from_le_bytes(head) % self.dimension as u64) as usize;
        let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };

        (index, sign)
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self { dimension: 1024 }
    }
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Split on anything that is not alphanumeric and lowercase the pieces.
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        debug!("Embedding {} texts", texts.len());
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_text(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
