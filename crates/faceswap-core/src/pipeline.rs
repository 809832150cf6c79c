//! Pipeline driver: detect, resolve the identity, composite every face.

use crate::compositor::Compositor;
use crate::enroll;
use crate::error::PipelineError;
use crate::models::{ModelLoader, ModelProvider, OnnxModelLoader};
use crate::store::EmbeddingStore;
use crate::types::{Embedding, IdentityRecord, IdentityVector};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Source identity for a swap request.
#[derive(Debug, Clone)]
pub enum IdentityRef {
    /// Name of a record in the embedding store.
    Stored(String),
    /// Identity already resolved by the caller.
    Vector(IdentityVector),
}

/// How faces in one image relate while compositing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaceIsolation {
    /// Each face is swapped from the image as already modified by earlier faces.
    #[default]
    Sequential,
    /// Every face is swapped from the unmodified input.
    Snapshot,
}

/// Per-request summary of a swap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwapReport {
    pub detected: usize,
    pub swapped: usize,
    pub skipped: usize,
}

pub struct FacePipeline<L = OnnxModelLoader> {
    provider: Arc<ModelProvider<L>>,
    store: Arc<dyn EmbeddingStore>,
    compositor: Compositor,
    isolation: FaceIsolation,
}

impl<L: ModelLoader> FacePipeline<L> {
    pub fn new(provider: Arc<ModelProvider<L>>, store: Arc<dyn EmbeddingStore>) -> Self {
        Self {
            provider,
            store,
            compositor: Compositor::default(),
            isolation: FaceIsolation::default(),
        }
    }

    pub fn with_compositor(mut self, compositor: Compositor) -> Self {
        self.compositor = compositor;
        self
    }

    pub fn with_isolation(mut self, isolation: FaceIsolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn provider(&self) -> &ModelProvider<L> {
        &self.provider
    }

    pub fn store(&self) -> &dyn EmbeddingStore {
        self.store.as_ref()
    }

    /// Unit-length source embedding for `identity`.
    pub fn resolve_identity(&self, identity: &IdentityRef) -> Result<Embedding, PipelineError> {
        let vector = match identity {
            IdentityRef::Stored(name) => self.store.load(name)?.vector,
            IdentityRef::Vector(vector) => vector.clone(),
        };
        Ok(vector.into_normalized())
    }

    /// Replace every detected face in `image` with `identity`.
    pub fn swap_faces(&self, image: &RgbImage, identity: &IdentityRef) -> Result<RgbImage, PipelineError> {
        self.swap_faces_with_report(image, identity).map(|(out, _)| out)
    }

    pub fn swap_faces_with_report(
        &self,
        image: &RgbImage,
        identity: &IdentityRef,
    ) -> Result<(RgbImage, SwapReport), PipelineError> {
        let start = Instant::now();
        let models = self.provider.load()?;
        let source = self.resolve_identity(identity)?;

        let faces = models.analyzer.analyze(image)?;
        let mut report = SwapReport {
            detected: faces.len(),
            ..SwapReport::default()
        };
        if faces.is_empty() {
            tracing::info!("no faces detected; image returned unchanged");
            return Ok((image.clone(), report));
        }

        let swapper = models.swapper.as_ref();
        let restorer = models.restorer.as_deref();
        let mut output = image.clone();

        for (index, face) in faces.iter().enumerate() {
            if face.embedding.is_none() {
                tracing::warn!(index, "face has no embedding; skipping");
                report.skipped += 1;
                continue;
            }

            let written = match self.isolation {
                FaceIsolation::Sequential => {
                    self.compositor
                        .composite(&mut output, &face.bbox, &source, swapper, restorer)?
                }
                FaceIsolation::Snapshot => self
                    .compositor
                    .render_patch(image, &face.bbox, &source, swapper, restorer)?
                    .map(|patch| {
                        patch.write_into(&mut output);
                        patch.region
                    }),
            };
            match written {
                Some(_) => report.swapped += 1,
                None => report.skipped += 1,
            }
        }

        tracing::debug!(
            detected = report.detected,
            swapped = report.swapped,
            skipped = report.skipped,
            isolation = ?self.isolation,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "swap finished"
        );
        Ok((output, report))
    }

    /// Build and persist an identity from sample images using the shared analyzer.
    pub fn enroll_identity<I>(&self, name: &str, images: I) -> Result<IdentityRecord, PipelineError>
    where
        I: IntoIterator<Item = RgbImage>,
    {
        let analyzer = self.provider.analyzer()?;
        enroll::enroll(analyzer, self.store.as_ref(), name, images)
    }
}
