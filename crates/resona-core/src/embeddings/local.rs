//! Local embedding provider
//!
//! fastembed-backed ONNX inference with nomic-embed-text-v1.5 at its
//! native 768 dimensions. The model is process-global: initialization is
//! expensive and the fastembed API wants exclusive access.

use std::sync::{Mutex, OnceLock};

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

use super::{EmbeddingError, EmbeddingProvider};

static MODEL: OnceLock<Result<Mutex<TextEmbedding>, String>> = OnceLock::new();

/// Default cache directory for fastembed model files.
/// Respects RESONA_MODEL_CACHE, falls back to the platform cache dir.
fn model_cache_dir() -> std::path::PathBuf {
    if let Ok(path) = std::env::var("RESONA_MODEL_CACHE") {
        return std::path::PathBuf::from(path);
    }

    if let Some(proj_dirs) = directories::ProjectDirs::from("dev", "resona", "core") {
        return proj_dirs.cache_dir().join("fastembed");
    }

    std::path::PathBuf::from(".resona_model_cache")
}

fn model() -> Result<std::sync::MutexGuard<'static, TextEmbedding>, EmbeddingError> {
    let result = MODEL.get_or_init(|| {
        let cache_dir = model_cache_dir();
        if let Err(e) = std::fs::create_dir_all(&cache_dir) {
            tracing::warn!("failed to create model cache dir {:?}: {}", cache_dir, e);
        }

        let options = InitOptions::new(EmbeddingModel::NomicEmbedTextV15)
            .with_show_download_progress(false)
            .with_cache_dir(cache_dir);

        TextEmbedding::try_new(options).map(Mutex::new).map_err(|e| {
            format!(
                "failed to initialize nomic-embed-text-v1.5: {}. \
                 Ensure ONNX runtime is available and model files can be downloaded.",
                e
            )
        })
    });

    match result {
        Ok(model) => model
            .lock()
            .map_err(|e| EmbeddingError::ProviderInit(format!("model lock poisoned: {}", e))),
        Err(err) => Err(EmbeddingError::ProviderInit(err.clone())),
    }
}

/// Local ONNX embedding provider (the default primary)
#[derive(Default)]
pub struct LocalEmbedder;

impl LocalEmbedder {
    pub fn new() -> Self {
        Self
    }
}

impl EmbeddingProvider for LocalEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut model = model()?;
        let mut vectors = model
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::GenerationFailed(e.to_string()))?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::GenerationFailed("empty batch result".into()))
    }

    fn name(&self) -> &str {
        "local-nomic-v1.5"
    }
}
