use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::{Embedder, FingerprintError};

/// Hashed bag-of-words embedding. Whitespace and case do not affect the result.
pub fn embed(text: &str, dim: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dim.max(1)];
    let dim = v.len();
    for token in text.split_whitespace() {
        let token = token
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        if token.is_empty() {
            continue;
        }
        let digest = Sha256::digest(token.as_bytes());
        let idx = (digest[0] as usize) % dim;
        let sign = if digest[1] % 2 == 0 { 1.0 } else { -1.0 };
        v[idx] += sign;
    }
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    v
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Local embedder; never fails and never leaves the process.
pub struct LexicalEmbedder {
    dim: usize,
}

impl LexicalEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

#[async_trait]
impl Embedder for LexicalEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, FingerprintError> {
        Ok(embed(text, self.dim))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_embedding() {
        let a = embed("hello world", 16);
        let b = embed("hello world", 16);
        assert_eq!(a, b);
    }

    #[test]
    fn case_and_punctuation_insensitive() {
        let a = embed("The storm, broke.", 32);
        let b = embed("the STORM broke", 32);
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn mismatched_lengths_have_zero_similarity() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }
}
