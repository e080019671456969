//! Job image selection with availability probing.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

/// Registry probe errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImageCheckError {
    #[error("registry error: {0}")]
    Registry(String),

    #[error("registry call timed out after {0:?}")]
    Timeout(Duration),
}

/// A published tag of an image repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTag {
    pub tag: String,
    pub created_at: DateTime<Utc>,
}

/// Registry access used to probe image availability.
#[async_trait]
pub trait ImageChecker: Send + Sync {
    /// Whether `image` (`repository:tag`) is published.
    async fn image_exists(&self, image: &str) -> Result<bool, ImageCheckError>;

    /// Published tags of `repository`.
    async fn list_tags(&self, repository: &str) -> Result<Vec<ImageTag>, ImageCheckError>;
}

/// Where the selected image came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    Primary,
    PrimaryUnchecked,
    PrimaryCheckError,
    Fallback,
    FallbackAutoPrevious,
}

impl ImageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageSource::Primary => "primary",
            ImageSource::PrimaryUnchecked => "primary_unchecked",
            ImageSource::PrimaryCheckError => "primary_check_error",
            ImageSource::Fallback => "fallback",
            ImageSource::FallbackAutoPrevious => "fallback_auto_previous",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSelection {
    pub image: String,
    pub source: ImageSource,
}

/// Image selection failures. Each finalizes the run as `job_image_unavailable`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImageSelectionError {
    #[error("primary image {primary} is missing and no fallback is available")]
    PrimaryMissingNoFallback { primary: String },

    #[error("primary image {primary} and fallback image {fallback} are both missing")]
    FallbackMissingUsePrimary { primary: String, fallback: String },

    #[error("fallback image {fallback} could not be checked: {error}")]
    FallbackCheckError {
        fallback: String,
        error: ImageCheckError,
    },

    #[error("previous tags of {primary} could not be listed: {error}")]
    FallbackAutoCheckError {
        primary: String,
        error: ImageCheckError,
    },
}

impl ImageSelectionError {
    /// Stable code recorded with the failure.
    pub fn code(&self) -> &'static str {
        match self {
            ImageSelectionError::PrimaryMissingNoFallback { .. } => "primary_missing_no_fallback",
            ImageSelectionError::FallbackMissingUsePrimary { .. } => "fallback_missing_use_primary",
            ImageSelectionError::FallbackCheckError { .. } => "fallback_check_error",
            ImageSelectionError::FallbackAutoCheckError { .. } => "fallback_auto_check_error",
        }
    }
}

/// Split `registry/repo:tag[@digest]` into repository and tag. The digest is
/// dropped; untagged references have no tag.
pub fn split_image_ref(image: &str) -> (&str, Option<&str>) {
    let image = image.split_once('@').map_or(image, |(name, _digest)| name);
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(i) => {
            let split = name_start + i;
            (&image[..split], Some(&image[split + 1..]))
        }
        None => (image, None),
    }
}

/// The most recently published tag other than `exclude`, newest first by
/// creation time and then by tag.
pub fn pick_latest_tag<'a>(tags: &'a [ImageTag], exclude: Option<&str>) -> Option<&'a ImageTag> {
    tags.iter()
        .filter(|t| Some(t.tag.as_str()) != exclude && !t.tag.is_empty())
        .max_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.tag.cmp(&b.tag))
        })
}

async fn with_timeout<T>(
    timeout: Duration,
    call: impl std::future::Future<Output = Result<T, ImageCheckError>>,
) -> Result<T, ImageCheckError> {
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or(Err(ImageCheckError::Timeout(timeout)))
}

/// Choose the job image.
pub async fn select_job_image(
    checker: Option<&dyn ImageChecker>,
    primary: &str,
    fallback: Option<&str>,
    timeout: Duration,
) -> Result<ImageSelection, ImageSelectionError> {
    let Some(checker) = checker else {
        return Ok(ImageSelection {
            image: primary.to_string(),
            source: ImageSource::PrimaryUnchecked,
        });
    };

    match with_timeout(timeout, checker.image_exists(primary)).await {
        Ok(true) => {
            return Ok(ImageSelection {
                image: primary.to_string(),
                source: ImageSource::Primary,
            })
        }
        Ok(false) => debug!(image = primary, "primary job image is missing"),
        Err(e) => {
            warn!(image = primary, error = %e, "primary image check failed, using primary");
            return Ok(ImageSelection {
                image: primary.to_string(),
                source: ImageSource::PrimaryCheckError,
            });
        }
    }

    match fallback.map(str::trim).filter(|f| !f.is_empty()) {
        Some(fallback) => match with_timeout(timeout, checker.image_exists(fallback)).await {
            Ok(true) => Ok(ImageSelection {
                image: fallback.to_string(),
                source: ImageSource::Fallback,
            }),
            Ok(false) => Err(ImageSelectionError::FallbackMissingUsePrimary {
                primary: primary.to_string(),
                fallback: fallback.to_string(),
            }),
            Err(error) => Err(ImageSelectionError::FallbackCheckError {
                fallback: fallback.to_string(),
                error,
            }),
        },
        None => {
            let (repository, tag) = split_image_ref(primary);
            let tags = with_timeout(timeout, checker.list_tags(repository))
                .await
                .map_err(|error| ImageSelectionError::FallbackAutoCheckError {
                    primary: primary.to_string(),
                    error,
                })?;

            match pick_latest_tag(&tags, tag) {
                Some(previous) => Ok(ImageSelection {
                    image: format!("{repository}:{}", previous.tag),
                    source: ImageSource::FallbackAutoPrevious,
                }),
                None => Err(ImageSelectionError::PrimaryMissingNoFallback {
                    primary: primary.to_string(),
                }),
            }
        }
    }
}

/// Checker over a fixed tag table, for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct StaticImageChecker {
    tags: HashMap<String, Vec<ImageTag>>,
    failing: bool,
}

impl StaticImageChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A checker whose every call errors.
    pub fn failing() -> Self {
        Self {
            tags: HashMap::new(),
            failing: true,
        }
    }

    #[must_use]
    pub fn with_tag(mut self, repository: &str, tag: &str, created_at: DateTime<Utc>) -> Self {
        self.tags
            .entry(repository.to_string())
            .or_default()
            .push(ImageTag {
                tag: tag.to_string(),
                created_at,
            });
        self
    }

    fn check(&self) -> Result<(), ImageCheckError> {
        if self.failing {
            Err(ImageCheckError::Registry("registry unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ImageChecker for StaticImageChecker {
    async fn image_exists(&self, image: &str) -> Result<bool, ImageCheckError> {
        self.check()?;
        let (repository, tag) = split_image_ref(image);
        let tag = tag.unwrap_or("latest");
        Ok(self
            .tags
            .get(repository)
            .is_some_and(|tags| tags.iter().any(|t| t.tag == tag)))
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<ImageTag>, ImageCheckError> {
        self.check()?;
        Ok(self.tags.get(repository).cloned().unwrap_or_default())
    }
}
