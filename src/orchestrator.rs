use crate::cache::CacheAccessError;
use crate::engine::{BuildContext, BuildEngine, BuildError, TagError};
use crate::image_config::ImageConfiguration;
use crate::image_reference::ImageReference;
use crate::pull::ImagePullManager;
use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum BuildServiceError {
    #[error("invalid image configuration {name}: {reason}")]
    InvalidConfiguration { name: String, reason: String },
    #[error(transparent)]
    CacheAccess(#[from] CacheAccessError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Tag(#[from] TagError),
    #[error("build of image {0} was cancelled")]
    Cancelled(String),
}

/// Runs the build-then-tag sequence for images against a build engine.
pub struct BuildService {
    engine: Arc<dyn BuildEngine>,
    pull_manager: Arc<ImagePullManager>,
    context: BuildContext,
}

impl BuildService {
    pub fn new(
        engine: Arc<dyn BuildEngine>,
        pull_manager: Arc<ImagePullManager>,
        context: BuildContext,
    ) -> Self {
        Self {
            engine,
            pull_manager,
            context,
        }
    }

    pub fn pull_manager(&self) -> &ImagePullManager {
        &self.pull_manager
    }

    /// Builds `image` and, only if that succeeded, tags it.
    ///
    /// Engine errors are returned unchanged and never retried. Cancelling `cancel`
    /// fails the in-flight step and the tag step is skipped.
    pub async fn build(
        &self,
        image: &ImageConfiguration,
        cancel: &CancellationToken,
    ) -> Result<(), BuildServiceError> {
        validate(image)?;
        if cancel.is_cancelled() {
            return Err(BuildServiceError::Cancelled(image.name.clone()));
        }

        let decision = self.pull_manager.decide(image.base_image())?;
        debug!(
            "Pull decision for {}: base image {:?}, pull required {}",
            image.name,
            decision.base_image(),
            decision.required()
        );

        info!("Building image {}", image.description());
        let built = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BuildServiceError::Cancelled(image.name.clone())),
            result = self.engine.build_image(image, &decision, &self.context) => {
                result.map_err(BuildServiceError::from)
            }
        };
        match built {
            // A successful build with a required pull means the base image is now present
            Ok(()) => decision.acknowledge()?,
            Err(e) => {
                decision.release();
                warn!("Build of image {} failed: {}", image.name, e);
                return Err(e);
            }
        }

        info!("Tagging image {}", image.name);
        let tagged = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BuildServiceError::Cancelled(image.name.clone())),
            result = self.engine.tag_image(&image.name, image) => result.map_err(BuildServiceError::from),
        };
        tagged?;

        info!("Successfully built image {}", image.name);
        Ok(())
    }

    /// Builds independent images with at most `concurrency` in flight.
    ///
    /// Every image gets its own result; a failing image never affects the others.
    pub async fn build_all(
        &self,
        images: &[ImageConfiguration],
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> Vec<(String, Result<(), BuildServiceError>)> {
        futures::stream::iter(images)
            .map(|image| async move { (image.name.clone(), self.build(image, cancel).await) })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await
    }
}

fn validate(image: &ImageConfiguration) -> Result<(), BuildServiceError> {
    let invalid = |reason: &str| BuildServiceError::InvalidConfiguration {
        name: image.name.clone(),
        reason: reason.to_string(),
    };
    if image.name.trim().is_empty() {
        return Err(invalid("image name is empty"));
    }
    if image.build.is_none() {
        return Err(invalid("no build configuration"));
    }
    ImageReference::parse(&image.name).map_err(|e| invalid(&e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, MemoryCacheStore};
    use crate::image_config::BuildImageConfiguration;
    use crate::pull::{AutoPullMode, ImagePullPolicy, PullDecision};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Build {
            image: String,
            pull: bool,
            context_dir: PathBuf,
        },
        Tag {
            name: String,
            image: String,
        },
    }

    #[derive(Default)]
    struct RecordingEngine {
        calls: Mutex<Vec<Call>>,
        failing_builds: HashSet<String>,
        failing_tags: HashSet<String>,
        hang_builds: bool,
        same_manager: Mutex<Vec<bool>>,
        expected_manager: Option<usize>,
    }

    #[async_trait]
    impl BuildEngine for RecordingEngine {
        async fn build_image(
            &self,
            image: &ImageConfiguration,
            pull: &PullDecision<'_>,
            context: &BuildContext,
        ) -> Result<(), BuildError> {
            self.calls.lock().push(Call::Build {
                image: image.name.clone(),
                pull: pull.required(),
                context_dir: context.context_dir.clone(),
            });
            if let Some(expected) = self.expected_manager {
                let actual = pull.manager() as *const ImagePullManager as usize;
                self.same_manager.lock().push(actual == expected);
            }
            if self.hang_builds {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.failing_builds.contains(&image.name) {
                return Err(BuildError::MissingBuildConfiguration(image.name.clone()));
            }
            Ok(())
        }

        async fn tag_image(&self, name: &str, image: &ImageConfiguration) -> Result<(), TagError> {
            self.calls.lock().push(Call::Tag {
                name: name.to_string(),
                image: image.name.clone(),
            });
            if self.failing_tags.contains(name) {
                return Err(TagError::Failed {
                    command: format!("docker tag {}", name),
                    status: "exit status: 1".to_string(),
                    stderr: "no such image".to_string(),
                });
            }
            Ok(())
        }
    }

    struct UnreadableCache;

    impl CacheStore for UnreadableCache {
        fn get(&self, _key: &str) -> Result<Option<String>, CacheAccessError> {
            Err(CacheAccessError::Read {
                path: PathBuf::from("pull-cache.json"),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            })
        }

        fn put(&self, _key: &str, _value: &str) -> Result<(), CacheAccessError> {
            Ok(())
        }
    }

    fn image(name: &str, from: &str) -> ImageConfiguration {
        ImageConfiguration::new(
            name,
            Some(BuildImageConfiguration {
                from: Some(from.to_string()),
                ..Default::default()
            }),
        )
    }

    fn context() -> BuildContext {
        BuildContext {
            context_dir: PathBuf::from("/project"),
            ..Default::default()
        }
    }

    fn manager(policy: ImagePullPolicy) -> (Arc<ImagePullManager>, Arc<MemoryCacheStore>) {
        let cache = Arc::new(MemoryCacheStore::new());
        let manager = ImagePullManager::new(cache.clone(), Some(policy), AutoPullMode::On);
        (Arc::new(manager), cache)
    }

    #[tokio::test]
    async fn builds_then_tags_with_decider_and_context() {
        let (manager, cache) = manager(ImagePullPolicy::Always);
        let engine = Arc::new(RecordingEngine {
            expected_manager: Some(Arc::as_ptr(&manager) as usize),
            ..Default::default()
        });
        let service = BuildService::new(engine.clone(), manager, context());

        service
            .build(&image("myapp", "golang:1.11"), &CancellationToken::new())
            .await
            .expect("Build should succeed");

        assert_eq!(
            *engine.calls.lock(),
            vec![
                Call::Build {
                    image: "myapp".to_string(),
                    pull: true,
                    context_dir: PathBuf::from("/project"),
                },
                Call::Tag {
                    name: "myapp".to_string(),
                    image: "myapp".to_string(),
                },
            ]
        );
        assert_eq!(*engine.same_manager.lock(), vec![true]);
        assert_eq!(cache.get("golang:1.11").unwrap(), None);
    }

    #[tokio::test]
    async fn failed_build_is_never_tagged() {
        let (manager, _) = manager(ImagePullPolicy::IfNotPresent);
        let engine = Arc::new(RecordingEngine {
            failing_builds: HashSet::from(["broken".to_string()]),
            ..Default::default()
        });
        let service = BuildService::new(engine.clone(), manager, context());

        let result = service
            .build(&image("broken", "golang:1.11"), &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(BuildServiceError::Build(BuildError::MissingBuildConfiguration(_)))
        ));
        let calls = engine.calls.lock();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], Call::Build { .. }));
        // The pull never happened, so the next build has to pull again
        assert!(service.pull_manager().should_pull("golang:1.11").unwrap());
    }

    #[tokio::test]
    async fn tag_failure_reaches_the_caller() {
        let (manager, _) = manager(ImagePullPolicy::IfNotPresent);
        let engine = Arc::new(RecordingEngine {
            failing_tags: HashSet::from(["myapp".to_string()]),
            ..Default::default()
        });
        let service = BuildService::new(engine.clone(), manager, context());

        let result = service
            .build(&image("myapp", "golang:1.11"), &CancellationToken::new())
            .await;

        match result {
            Err(BuildServiceError::Tag(TagError::Failed { command, stderr, .. })) => {
                assert_eq!(command, "docker tag myapp");
                assert_eq!(stderr, "no such image");
            }
            other => panic!("Expected a tag error, got {:?}", other),
        }
        assert_eq!(engine.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn cache_read_failure_stops_before_the_engine() {
        let manager = Arc::new(ImagePullManager::new(
            Arc::new(UnreadableCache),
            Some(ImagePullPolicy::IfNotPresent),
            AutoPullMode::On,
        ));
        let engine = Arc::new(RecordingEngine::default());
        let service = BuildService::new(engine.clone(), manager, context());

        let result = service
            .build(&image("myapp", "golang:1.11"), &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(BuildServiceError::CacheAccess(CacheAccessError::Read { .. }))
        ));
        assert!(engine.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn shared_base_image_is_pulled_once() {
        let (manager, cache) = manager(ImagePullPolicy::IfNotPresent);
        let engine = Arc::new(RecordingEngine::default());
        let service = BuildService::new(engine.clone(), manager, context());
        let cancel = CancellationToken::new();

        service.build(&image("first", "golang:1.11"), &cancel).await.unwrap();
        service.build(&image("second", "golang:1.11"), &cancel).await.unwrap();

        let pulls: Vec<bool> = engine
            .calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::Build { pull, .. } => Some(*pull),
                Call::Tag { .. } => None,
            })
            .collect();
        assert_eq!(pulls, vec![true, false]);
        assert!(cache.get("golang:1.11").unwrap().is_some());
    }

    #[tokio::test]
    async fn rejects_image_without_build_configuration() {
        let (manager, _) = manager(ImagePullPolicy::Always);
        let engine = Arc::new(RecordingEngine::default());
        let service = BuildService::new(engine.clone(), manager, context());
        let cancel = CancellationToken::new();

        let result = service
            .build(&ImageConfiguration::new("myapp", None), &cancel)
            .await;
        assert!(matches!(
            result,
            Err(BuildServiceError::InvalidConfiguration { .. })
        ));

        let result = service.build(&image(" ", "golang:1.11"), &cancel).await;
        assert!(matches!(
            result,
            Err(BuildServiceError::InvalidConfiguration { .. })
        ));
        assert!(engine.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn cancelled_build_is_never_tagged() {
        let (manager, _) = manager(ImagePullPolicy::IfNotPresent);
        let engine = Arc::new(RecordingEngine {
            hang_builds: true,
            ..Default::default()
        });
        let service = BuildService::new(engine.clone(), manager, context());
        let cancel = CancellationToken::new();

        let myapp = image("myapp", "golang:1.11");
        let (result, _) = tokio::join!(service.build(&myapp, &cancel), async {
            tokio::task::yield_now().await;
            cancel.cancel();
        });

        assert!(matches!(result, Err(BuildServiceError::Cancelled(_))));
        assert_eq!(engine.calls.lock().len(), 1);
        assert!(service.pull_manager().should_pull("golang:1.11").unwrap());

        let result = service.build(&image("other", "alpine:3"), &cancel).await;
        assert!(matches!(result, Err(BuildServiceError::Cancelled(_))));
        assert_eq!(engine.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn build_all_isolates_failures() {
        let (manager, _) = manager(ImagePullPolicy::IfNotPresent);
        let engine = Arc::new(RecordingEngine {
            failing_builds: HashSet::from(["broken".to_string()]),
            ..Default::default()
        });
        let service = BuildService::new(engine.clone(), manager, context());
        let images = vec![
            image("first", "golang:1.11"),
            image("broken", "golang:1.11"),
            image("third", "alpine:3"),
        ];

        let mut results = service
            .build_all(&images, 2, &CancellationToken::new())
            .await;
        results.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(results.len(), 3);
        assert!(results[0].1.is_err());
        assert_eq!(results[0].0, "broken");
        assert!(results[1].1.is_ok());
        assert!(results[2].1.is_ok());

        let calls = engine.calls.lock();
        for name in ["first", "third"] {
            let build = calls
                .iter()
                .position(|c| matches!(c, Call::Build { image, .. } if image == name));
            let tag = calls
                .iter()
                .position(|c| matches!(c, Call::Tag { name: n, .. } if n == name));
            assert!(build.unwrap() < tag.unwrap());
        }
        assert!(!calls
            .iter()
            .any(|c| matches!(c, Call::Tag { name, .. } if name == "broken")));
    }
}
