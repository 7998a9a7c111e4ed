//! Boot image resolution for the Scaleway provider.
//!
//! Project-scoped images take precedence; public images are only consulted
//! when the project has no match for the label.

use std::future::Future;

use scaleway_rs::{ScalewayImage, ScalewayListInstanceImagesBuilder};

use super::{ScalewayProvider, ScalewayProviderError};
use crate::provider::LaunchSpec;

impl ScalewayProvider {
    #[expect(
        clippy::excessive_nesting,
        reason = "organisation scoping requires nested builder updates before execution"
    )]
    pub(super) async fn resolve_image_id(
        &self,
        spec: &LaunchSpec,
    ) -> Result<String, ScalewayProviderError> {
        self.resolve_image_id_with(
            spec,
            || async move {
                let mut scoped =
                    ScalewayListInstanceImagesBuilder::new(self.api.clone(), &spec.zone)
                        .public(true)
                        .project(&spec.project_id)
                        .name(&spec.image_label)
                        .arch(&spec.architecture);
                if let Some(org) = &spec.organisation_id {
                    scoped = scoped.organization(org);
                }
                scoped.run_async().await.map_err(ScalewayProviderError::from)
            },
            || async move {
                ScalewayListInstanceImagesBuilder::new(self.api.clone(), &spec.zone)
                    .public(true)
                    .name(&spec.image_label)
                    .arch(&spec.architecture)
                    .run_async()
                    .await
                    .map_err(ScalewayProviderError::from)
            },
        )
        .await
    }

    pub(super) async fn resolve_image_id_with<FutA, FutB, FetchA, FetchB>(
        &self,
        spec: &LaunchSpec,
        project_fetch: FetchA,
        public_fetch: FetchB,
    ) -> Result<String, ScalewayProviderError>
    where
        FetchA: FnOnce() -> FutA,
        FetchB: FnOnce() -> FutB,
        FutA: Future<Output = Result<Vec<ScalewayImage>, ScalewayProviderError>>,
        FutB: Future<Output = Result<Vec<ScalewayImage>, ScalewayProviderError>>,
    {
        let project_images = Self::usable_images(project_fetch().await?, spec);
        let candidates = if project_images.is_empty() {
            Self::usable_images(public_fetch().await?, spec)
        } else {
            project_images
        };
        Self::newest_image_id(candidates, spec)
    }

    /// Picks the most recently created candidate.
    pub(super) fn newest_image_id(
        candidates: Vec<ScalewayImage>,
        spec: &LaunchSpec,
    ) -> Result<String, ScalewayProviderError> {
        candidates
            .into_iter()
            .max_by(|lhs, rhs| lhs.creation_date.cmp(&rhs.creation_date))
            .map(|image| image.id)
            .ok_or_else(|| ScalewayProviderError::ImageNotFound {
                label: spec.image_label.clone(),
                arch: spec.architecture.clone(),
                zone: spec.zone.clone(),
            })
    }

    pub(super) fn usable_images(
        images: Vec<ScalewayImage>,
        spec: &LaunchSpec,
    ) -> Vec<ScalewayImage> {
        images
            .into_iter()
            .filter(|image| image.arch == spec.architecture && image.state == "available")
            .collect()
    }
}
