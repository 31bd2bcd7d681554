//! Deterministic identity keys for generation requests.
//!
//! Three independent keys are derived from a request:
//! - the exact hash (rendered prompt + model parameters, no I/O),
//! - the semantic signature (embedding vector + quantized digest),
//! - the template signature (template identity + variable names, no fill-ins).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quill_types::GenerationRequest;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod lexical;
pub use lexical::{cosine_similarity, embed, LexicalEmbedder};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FingerprintError {
    #[error("embedding provider error: {0}")]
    Embedding(String),
    #[error("embedding provider timed out after {0:?}")]
    EmbeddingTimeout(Duration),
    #[error("embedding provider returned an empty vector")]
    EmptyEmbedding,
}

/// Embedding provider seam. The semantic path is the only one allowed to do I/O.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, FingerprintError>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SemanticSignature {
    pub vector: Vec<f32>,
    /// Digest of the quantized vector, used as the index key.
    pub digest: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fingerprints {
    pub exact: String,
    pub semantic: Option<SemanticSignature>,
    pub template: Option<String>,
}

impl Fingerprints {
    /// Exact key only; what the cache sees with enhanced caching off.
    pub fn exact_only(req: &GenerationRequest) -> Self {
        Self {
            exact: exact_hash(req),
            semantic: None,
            template: None,
        }
    }
}

pub fn exact_hash(req: &GenerationRequest) -> String {
    let mut h = Sha256::new();
    h.update(req.model_class.as_bytes());
    h.update([0u8]);
    h.update(req.params.temperature.to_bits().to_le_bytes());
    h.update(req.params.max_tokens.to_le_bytes());
    h.update([0u8]);
    h.update(req.rendered_prompt.as_bytes());
    hex::encode(h.finalize())
}

/// Structural signature: template identity, model class and the set of variable names.
pub fn template_signature(req: &GenerationRequest) -> String {
    let mut h = Sha256::new();
    h.update(req.template_id.as_bytes());
    h.update([0u8]);
    h.update(req.template_version.to_le_bytes());
    h.update(req.model_class.as_bytes());
    // BTreeMap keys iterate sorted, so the shape is order independent.
    for name in req.variables.keys() {
        h.update([0u8]);
        h.update(name.as_bytes());
    }
    hex::encode(h.finalize())
}

pub fn semantic_digest(vector: &[f32]) -> String {
    let mut h = Sha256::new();
    for x in vector {
        let q = (x * 1000.0).round() as i32;
        h.update(q.to_le_bytes());
    }
    hex::encode(h.finalize())
}

pub struct Fingerprinter {
    embedder: Arc<dyn Embedder>,
    embed_timeout: Duration,
}

impl Fingerprinter {
    pub fn new(embedder: Arc<dyn Embedder>, embed_timeout: Duration) -> Self {
        Self {
            embedder,
            embed_timeout,
        }
    }

    pub async fn semantic_signature(
        &self,
        req: &GenerationRequest,
    ) -> Result<SemanticSignature, FingerprintError> {
        let vector = tokio::time::timeout(self.embed_timeout, self.embedder.embed(&req.rendered_prompt))
            .await
            .map_err(|_| FingerprintError::EmbeddingTimeout(self.embed_timeout))??;
        if vector.is_empty() {
            return Err(FingerprintError::EmptyEmbedding);
        }
        let digest = semantic_digest(&vector);
        Ok(SemanticSignature { vector, digest })
    }

    /// Compute the fingerprint set.
    ///
    /// With `enhanced` off only the exact hash is produced. With it on, an
    /// embedding failure is returned as an error; callers decide whether to
    /// continue on the exact and template keys.
    pub async fn fingerprint(
        &self,
        req: &GenerationRequest,
        enhanced: bool,
    ) -> Result<Fingerprints, FingerprintError> {
        let mut fps = Fingerprints::exact_only(req);
        if !enhanced {
            tracing::debug!(exact = %fps.exact, "fingerprinted (exact only)");
            return Ok(fps);
        }
        fps.template = Some(template_signature(req));
        let semantic = self.semantic_signature(req).await.map_err(|e| {
            tracing::debug!(exact = %fps.exact, error = %e, "semantic fingerprint failed");
            e
        })?;
        tracing::debug!(
            exact = %fps.exact,
            semantic = %semantic.digest,
            dims = semantic.vector.len(),
            "fingerprinted"
        );
        fps.semantic = Some(semantic);
        Ok(fps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_types::{GenerationParams, RequestContext};
    use std::collections::BTreeMap;

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest {
            template_id: "scene-draft".into(),
            template_version: 2,
            rendered_prompt: prompt.into(),
            variables: BTreeMap::from([("hero".to_string(), "Mara".to_string())]),
            model_class: "prose".into(),
            params: GenerationParams::default(),
            context: RequestContext {
                project_id: "p1".into(),
                ..Default::default()
            },
            hints: None,
            required_entities: Vec::new(),
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, FingerprintError> {
            Err(FingerprintError::Embedding("provider down".into()))
        }
    }

    struct SlowEmbedder;

    #[async_trait]
    impl Embedder for SlowEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, FingerprintError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(vec![1.0])
        }
    }

    #[test]
    fn exact_hash_is_stable_and_parameter_sensitive() {
        let a = request("Write the storm scene.");
        let b = request("Write the storm scene.");
        assert_eq!(exact_hash(&a), exact_hash(&b));

        let mut c = b.clone();
        c.params.temperature = 0.2;
        assert_ne!(exact_hash(&a), exact_hash(&c));
    }

    #[test]
    fn template_signature_ignores_fill_ins() {
        let a = request("Mara walks into the storm.");
        let mut b = request("Ilse walks into the harbour.");
        b.variables.insert("hero".into(), "Ilse".into());
        assert_eq!(template_signature(&a), template_signature(&b));

        b.variables.insert("setting".into(), "harbour".into());
        assert_ne!(template_signature(&a), template_signature(&b));
    }

    #[tokio::test]
    async fn whitespace_variants_share_semantic_digest() {
        let fp = Fingerprinter::new(Arc::new(LexicalEmbedder::new(64)), Duration::from_secs(1));
        let a = request("Write the  storm scene.\n\nKeep it tense.");
        let b = request("Write the storm scene. Keep it   tense.");
        let sa = fp.semantic_signature(&a).await.unwrap();
        let sb = fp.semantic_signature(&b).await.unwrap();
        assert_ne!(exact_hash(&a), exact_hash(&b));
        assert_eq!(sa.digest, sb.digest);
        assert!(cosine_similarity(&sa.vector, &sb.vector) > 0.99);
    }

    #[tokio::test]
    async fn embedding_failure_is_reported() {
        let fp = Fingerprinter::new(Arc::new(FailingEmbedder), Duration::from_secs(1));
        let err = fp.fingerprint(&request("x"), true).await.unwrap_err();
        assert!(matches!(err, FingerprintError::Embedding(_)));

        let exact_only = fp.fingerprint(&request("x"), false).await.unwrap();
        assert!(exact_only.semantic.is_none());
        assert!(exact_only.template.is_none());
    }

    #[tokio::test]
    async fn slow_embedding_times_out() {
        let fp = Fingerprinter::new(Arc::new(SlowEmbedder), Duration::from_millis(10));
        let err = fp.semantic_signature(&request("x")).await.unwrap_err();
        assert!(matches!(err, FingerprintError::EmbeddingTimeout(_)));
    }
}
