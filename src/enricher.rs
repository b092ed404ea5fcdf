use crate::image_reference::ImageReference;
use crate::manifest::ManifestResource;
use crate::workload::Workload;
use serde::{Deserialize, Serialize};
use tracing::{Span, debug, error, warn};

/// Annotation OpenShift reads to redeploy a workload when an ImageStreamTag changes.
pub const TRIGGERS_ANNOTATION: &str = "image.openshift.io/triggers";

const IMAGE_STREAM_TAG: &str = "ImageStreamTag";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageChangeTrigger {
    pub from: TriggerSource,
    #[serde(rename = "fieldPath")]
    pub field_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSource {
    pub kind: String,
    pub name: String,
}

impl ImageChangeTrigger {
    fn for_container(container_name: &str, image: &ImageReference) -> Self {
        Self {
            from: TriggerSource {
                kind: IMAGE_STREAM_TAG.to_string(),
                name: format!("{}:{}", image.repository, image.tag()),
            },
            field_path: format!(
                "spec.template.spec.containers[?(@.name==\"{}\")].image",
                container_name
            ),
        }
    }
}

/// Adds the image change triggers annotation to generated workloads.
///
/// Local images (no registry, no user) are assumed to be ImageStreams in the same
/// namespace; every other image is left out of the trigger list.
pub struct TriggersAnnotationEnricher {
    log: Span,
}

impl TriggersAnnotationEnricher {
    pub fn new(log: Span) -> Self {
        Self { log }
    }

    /// Annotates every recognized workload in `resources`, returning how many were written.
    pub fn enrich<'a, I>(&self, resources: I) -> usize
    where
        I: IntoIterator<Item = &'a mut ManifestResource>,
    {
        resources
            .into_iter()
            .filter_map(|resource| match resource {
                ManifestResource::Workload(workload) => Some(workload),
                ManifestResource::Other(_) => None,
            })
            .map(|workload| self.enrich_workload(workload))
            .filter(|written| *written)
            .count()
    }

    /// Writes the triggers annotation unless `workload` already carries one.
    pub fn enrich_workload(&self, workload: &mut Workload) -> bool {
        if !can_write_triggers(workload) {
            debug!(
                parent: &self.log,
                "{} {} already has a {} annotation",
                workload.kind(),
                workload.name(),
                TRIGGERS_ANNOTATION
            );
            return false;
        }
        let annotation = self.serialize_triggers(&self.create_triggers(workload));
        workload.set_annotation(TRIGGERS_ANNOTATION, annotation);
        true
    }

    pub fn create_triggers(&self, workload: &Workload) -> Vec<ImageChangeTrigger> {
        workload
            .containers()
            .iter()
            .filter_map(|container| {
                let image = container.image.as_deref()?;
                match ImageReference::parse(image) {
                    Ok(reference) if reference.is_local() => {
                        Some(ImageChangeTrigger::for_container(&container.name, &reference))
                    }
                    Ok(_) => None,
                    Err(e) => {
                        warn!(
                            parent: &self.log,
                            "Skipping container {} of {} {}: {}",
                            container.name,
                            workload.kind(),
                            workload.name(),
                            e
                        );
                        None
                    }
                }
            })
            .collect()
    }

    /// Compact JSON for the annotation value, `[]` if serialization fails.
    fn serialize_triggers<T: Serialize>(&self, triggers: &[T]) -> String {
        serde_json::to_string(triggers).unwrap_or_else(|e| {
            error!(
                parent: &self.log,
                "Error while creating ImageStreamTag triggers for Kubernetes resources: {}", e
            );
            "[]".to_string()
        })
    }
}

fn can_write_triggers(workload: &Workload) -> bool {
    !workload.has_annotation(TRIGGERS_ANNOTATION)
}
