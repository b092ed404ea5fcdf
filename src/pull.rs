use crate::cache::{CacheAccessError, CacheStore};
use chrono::Utc;
use parking_lot::Mutex;
use serde::de::{self, Deserialize, Deserializer};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Whether a base image has to be fetched before building on top of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImagePullPolicy {
    Always,
    IfNotPresent,
    Never,
}

/// Legacy auto-pull switch, used to derive a policy when none is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoPullMode {
    #[default]
    On,
    Once,
    Off,
    Always,
}

impl AutoPullMode {
    pub fn default_policy(self) -> ImagePullPolicy {
        match self {
            AutoPullMode::Always => ImagePullPolicy::Always,
            AutoPullMode::Off => ImagePullPolicy::Never,
            AutoPullMode::On | AutoPullMode::Once => ImagePullPolicy::IfNotPresent,
        }
    }
}

impl FromStr for ImagePullPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "always" => Ok(ImagePullPolicy::Always),
            "ifnotpresent" => Ok(ImagePullPolicy::IfNotPresent),
            "never" => Ok(ImagePullPolicy::Never),
            _ => Err(format!("unknown image pull policy: {}", s)),
        }
    }
}

impl fmt::Display for ImagePullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImagePullPolicy::Always => write!(f, "Always"),
            ImagePullPolicy::IfNotPresent => write!(f, "IfNotPresent"),
            ImagePullPolicy::Never => write!(f, "Never"),
        }
    }
}

impl FromStr for AutoPullMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "on" | "true" => Ok(AutoPullMode::On),
            "once" => Ok(AutoPullMode::Once),
            "off" | "false" => Ok(AutoPullMode::Off),
            "always" => Ok(AutoPullMode::Always),
            _ => Err(format!("unknown auto pull mode: {}", s)),
        }
    }
}

impl<'de> Deserialize<'de> for ImagePullPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for AutoPullMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // YAML turns bare on/off/true/false into booleans
        let value = serde_yaml_ng::Value::deserialize(deserializer)?;
        match value {
            serde_yaml_ng::Value::Bool(true) => Ok(AutoPullMode::On),
            serde_yaml_ng::Value::Bool(false) => Ok(AutoPullMode::Off),
            serde_yaml_ng::Value::String(s) => s.parse().map_err(de::Error::custom),
            other => Err(de::Error::custom(format!(
                "invalid auto pull mode: {:?}",
                other
            ))),
        }
    }
}

#[derive(Debug, Default)]
struct KeyState {
    // A pull was signalled for this key and has not been acknowledged or released yet
    signalled: bool,
}

/// Decides, once per build session, whether base images need pulling.
///
/// The cache store is the only record of which images were already fetched.
/// Every key has its own lock, so the check-then-record sequence for one image
/// never races while different images proceed in parallel.
pub struct ImagePullManager {
    policy: ImagePullPolicy,
    auto_pull: AutoPullMode,
    cache: Arc<dyn CacheStore>,
    keys: Mutex<HashMap<String, Arc<Mutex<KeyState>>>>,
}

impl fmt::Debug for ImagePullManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImagePullManager")
            .field("policy", &self.policy)
            .field("auto_pull", &self.auto_pull)
            .finish()
    }
}

impl ImagePullManager {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        policy: Option<ImagePullPolicy>,
        auto_pull: AutoPullMode,
    ) -> Self {
        let policy = policy.unwrap_or_else(|| auto_pull.default_policy());
        debug!(
            "Using image pull policy {} (auto pull mode {:?})",
            policy, auto_pull
        );
        Self {
            policy,
            auto_pull,
            cache,
            keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> ImagePullPolicy {
        self.policy
    }

    pub fn auto_pull_mode(&self) -> AutoPullMode {
        self.auto_pull
    }

    fn key_state(&self, key: &str) -> Arc<Mutex<KeyState>> {
        self.keys
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Returns true when `key` has to be fetched before it can be built upon.
    ///
    /// Under `IfNotPresent` a key is signalled at most once until it is either
    /// acknowledged with [`pulled`](Self::pulled) or released with
    /// [`pull_failed`](Self::pull_failed).
    pub fn should_pull(&self, key: &str) -> Result<bool, CacheAccessError> {
        match self.policy {
            ImagePullPolicy::Always => Ok(true),
            ImagePullPolicy::Never => Ok(false),
            ImagePullPolicy::IfNotPresent => {
                let state = self.key_state(key);
                let mut state = state.lock();
                if state.signalled {
                    debug!("Pull of {} already signalled in this session", key);
                    return Ok(false);
                }
                if self.cache.get(key)?.is_some() {
                    debug!("Image {} already pulled, skipping pull", key);
                    return Ok(false);
                }
                debug!("Image {} not pulled yet, pull required", key);
                state.signalled = true;
                Ok(true)
            }
        }
    }

    /// Records a successful pull of `key`.
    pub fn pulled(&self, key: &str) -> Result<(), CacheAccessError> {
        if self.policy != ImagePullPolicy::IfNotPresent {
            return Ok(());
        }
        let state = self.key_state(key);
        let mut state = state.lock();
        // Cleared even when the write fails, so the key is not stuck as in flight
        state.signalled = false;
        self.cache.put(key, &Utc::now().to_rfc3339())
    }

    /// Releases a signalled pull that never happened, so it can be signalled again.
    pub fn pull_failed(&self, key: &str) {
        if self.policy == ImagePullPolicy::IfNotPresent {
            self.key_state(key).lock().signalled = false;
        }
    }

    /// Takes the pull decision for the base image of one build.
    pub fn decide(&self, base_image: Option<&str>) -> Result<PullDecision<'_>, CacheAccessError> {
        let required = match base_image {
            Some(image) => self.should_pull(image)?,
            None => false,
        };
        Ok(PullDecision {
            manager: self,
            base_image: base_image.map(str::to_string),
            required,
            acknowledged: AtomicBool::new(false),
        })
    }
}

/// The pull decision for one build, handed to the build engine together with the manager.
#[derive(Debug)]
pub struct PullDecision<'a> {
    manager: &'a ImagePullManager,
    base_image: Option<String>,
    required: bool,
    acknowledged: AtomicBool,
}

impl PullDecision<'_> {
    pub fn manager(&self) -> &ImagePullManager {
        self.manager
    }

    pub fn base_image(&self) -> Option<&str> {
        self.base_image.as_deref()
    }

    /// Whether the engine has to fetch the base image as part of the build.
    pub fn required(&self) -> bool {
        self.required
    }

    /// Called by the engine once the base image was fetched.
    pub fn acknowledge(&self) -> Result<(), CacheAccessError> {
        match &self.base_image {
            Some(image) if self.required && !self.acknowledged.swap(true, Ordering::SeqCst) => {
                let recorded = self.manager.pulled(image);
                if recorded.is_err() {
                    self.acknowledged.store(false, Ordering::SeqCst);
                }
                recorded
            }
            _ => Ok(()),
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::SeqCst)
    }

    pub(crate) fn release(&self) {
        if let Some(image) = &self.base_image {
            if self.required && !self.is_acknowledged() {
                self.manager.pull_failed(image);
            }
        }
    }
}
