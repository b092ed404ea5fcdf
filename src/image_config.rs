use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One image to build and tag. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageConfiguration {
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub build: Option<BuildImageConfiguration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildImageConfiguration {
    /// Base image, used as the pull cache key.
    pub from: Option<String>,
    /// Existing Dockerfile relative to the build context.
    /// Rendered from this configuration when absent.
    pub dockerfile: Option<PathBuf>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<String>,
    pub workdir: Option<String>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub assembly: Option<AssemblyConfiguration>,
}

/// Files copied from the build context into the image.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssemblyConfiguration {
    #[serde(default = "default_target_dir")]
    pub target_dir: String,
    pub sources: Vec<PathBuf>,
}

fn default_target_dir() -> String {
    "/maven".to_string()
}

impl ImageConfiguration {
    pub fn new(name: impl Into<String>, build: Option<BuildImageConfiguration>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            build,
        }
    }

    /// Short name used in log messages.
    pub fn description(&self) -> String {
        match &self.alias {
            Some(alias) => format!("{} ({})", self.name, alias),
            None => self.name.clone(),
        }
    }

    pub fn base_image(&self) -> Option<&str> {
        self.build.as_ref().and_then(|b| b.from.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_build_configuration() {
        let yaml = r#"
        name: myapp
        alias: app
        build:
          from: golang:1.11
          tags: [v1, stable]
          env:
            GOFLAGS: -mod=vendor
          ports: ["8080"]
          assembly:
            sources: [target/app]
        "#;
        let image: ImageConfiguration = serde_yaml_ng::from_str(yaml).expect("Should parse");

        assert_eq!(image.name, "myapp");
        assert_eq!(image.description(), "myapp (app)");
        assert_eq!(image.base_image(), Some("golang:1.11"));
        let build = image.build.expect("Should have build configuration");
        assert_eq!(build.tags, vec!["v1", "stable"]);
        assert_eq!(build.env["GOFLAGS"], "-mod=vendor");
        let assembly = build.assembly.expect("Should have assembly");
        assert_eq!(assembly.target_dir, "/maven");
        assert_eq!(assembly.sources, vec![PathBuf::from("target/app")]);
    }

    #[test]
    fn image_without_build_has_no_base_image() {
        let image = ImageConfiguration::new("myapp", None);
        assert_eq!(image.base_image(), None);
        assert_eq!(image.description(), "myapp");
    }
}
