//! Generation orchestration: wires fingerprinting, the cache, routing, model
//! calls, quality and repair into one request state machine with a single
//! audit append per request.

pub mod admin;
pub mod config;
pub mod context;
pub mod error;
pub mod pipeline;

pub use config::{PricingConfig, QuillConfig, RetryConfig, SchemaConfig};
pub use context::ExecutionContext;
pub use error::PipelineError;
pub use pipeline::{Components, GenerationOutcome, GenerationPipeline};
