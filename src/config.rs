use crate::engine::{BuildContext, RegistryAuth};
use crate::generator::ProjectInfo;
use crate::image_config::ImageConfiguration;
use crate::pull::{AutoPullMode, ImagePullPolicy};
use crate::secret_string::SecretString;
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::{env, fs, path::Path, path::PathBuf};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub build: BuildSettings,
    #[serde(default)]
    pub images: Vec<ImageConfiguration>,
    #[serde(default)]
    pub project: Option<ProjectInfo>,
    #[serde(default)]
    pub manifests: ManifestSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSettings {
    #[serde(default = "default_engine")]
    pub engine: String,
    pub pull_policy: Option<ImagePullPolicy>,
    #[serde(default)]
    pub auto_pull: AutoPullMode,
    /// Persists pull decisions across sessions when set.
    pub cache_file: Option<PathBuf>,
    #[serde(default = "default_context_dir")]
    pub context_dir: PathBuf,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
    #[serde(default)]
    pub no_cache: bool,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    pub registry: Option<Registry>,
}

#[derive(Debug, Deserialize)]
pub struct Registry {
    pub url: String,
    pub username: String,
    pub password: SecretString,
}

#[derive(Debug, Deserialize)]
pub struct ManifestSettings {
    #[serde(default = "default_manifest_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_manifest_include")]
    pub include: Vec<String>,
}

fn default_engine() -> String {
    "docker".to_string()
}

fn default_context_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("target/docker")
}

fn default_concurrency() -> usize {
    1
}

fn default_manifest_dir() -> PathBuf {
    PathBuf::from("target/classes/META-INF/fabric8")
}

fn default_manifest_include() -> Vec<String> {
    vec!["**/*.yml".to_string(), "**/*.yaml".to_string()]
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            pull_policy: None,
            auto_pull: AutoPullMode::default(),
            cache_file: None,
            context_dir: default_context_dir(),
            work_dir: default_work_dir(),
            build_args: BTreeMap::new(),
            no_cache: false,
            concurrency: default_concurrency(),
            registry: None,
        }
    }
}

impl Default for ManifestSettings {
    fn default() -> Self {
        Self {
            dir: default_manifest_dir(),
            include: default_manifest_include(),
        }
    }
}

impl BuildSettings {
    pub fn build_context(&self) -> BuildContext {
        BuildContext {
            context_dir: self.context_dir.clone(),
            work_dir: self.work_dir.clone(),
            build_args: self.build_args.clone(),
            no_cache: self.no_cache,
            registry_auth: self.registry.as_ref().map(|r| RegistryAuth {
                registry: r.url.clone(),
                username: r.username.clone(),
                password: r.password.clone(),
            }),
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming every missing env var.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = Vec::new();
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.push(var_name.to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable: {}", missing.join(", "));
    }
    Ok(result.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_expand_env_vars_success() {
        unsafe {
            env::set_var("KIB_TEST_VAR", "value123");
        }
        let input = "This is a test: ${KIB_TEST_VAR}";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, "This is a test: value123");
        unsafe {
            env::remove_var("KIB_TEST_VAR");
        }
    }

    #[test]
    fn test_expand_env_vars_missing_var() {
        let input = "This will fail: ${KIB_MISSING_VAR} and ${KIB_ALSO_MISSING}";
        let err = expand_env_vars(input).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing environment variable: KIB_MISSING_VAR, KIB_ALSO_MISSING"
        );
    }

    #[test]
    fn test_expand_env_vars_no_vars() {
        let input = "No variables here";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, input);
    }

    #[test]
    fn test_load_config_file() {
        unsafe {
            env::set_var("KIB_REGISTRY_PASSWORD", "secret_token");
        }
        let yaml_content = r#"
        build:
          engine: podman
          pullPolicy: IfNotPresent
          autoPull: once
          cacheFile: target/pull-cache.json
          concurrency: 4
          buildArgs:
            VERSION: "1.0"
          registry:
            url: quay.io
            username: user
            password: ${KIB_REGISTRY_PASSWORD}
        images:
          - name: myapp
            build:
              from: golang:1.11
        manifests:
          dir: target/manifests
        "#;

        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        let path = tmp_file.path();
        fs::write(path, yaml_content).expect("Failed to write to temp file");

        let config = load_config(path).expect("Should load config");
        unsafe {
            env::remove_var("KIB_REGISTRY_PASSWORD");
        }

        assert_eq!(config.build.engine, "podman");
        assert_eq!(config.build.pull_policy, Some(ImagePullPolicy::IfNotPresent));
        assert_eq!(config.build.auto_pull, AutoPullMode::Once);
        assert_eq!(config.build.concurrency, 4);
        assert_eq!(config.images.len(), 1);
        assert_eq!(config.images[0].base_image(), Some("golang:1.11"));
        assert_eq!(config.manifests.dir, PathBuf::from("target/manifests"));
        assert_eq!(config.manifests.include, default_manifest_include());

        let context = config.build.build_context();
        assert_eq!(context.build_args["VERSION"], "1.0");
        let auth = context.registry_auth.expect("Should have registry auth");
        assert_eq!(auth.registry, "quay.io");
        assert_eq!(auth.password.expose_secret(), "secret_token");
    }

    #[test]
    fn test_defaults_for_empty_sections() {
        let config: Config = serde_yaml_ng::from_str("images: []").expect("Should parse");
        assert_eq!(config.build.engine, "docker");
        assert_eq!(config.build.pull_policy, None);
        assert_eq!(config.build.auto_pull, AutoPullMode::On);
        assert_eq!(config.build.concurrency, 1);
        assert!(config.project.is_none());
        assert_eq!(
            config.manifests.dir,
            PathBuf::from("target/classes/META-INF/fabric8")
        );
    }
}
