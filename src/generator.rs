use crate::image_config::{AssemblyConfiguration, BuildImageConfiguration, ImageConfiguration};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

const JAVA_BASE_IMAGE: &str = "fabric8/java-jboss-openjdk8-jdk:1.5";
const JAVA_APP_DIR: &str = "/deployments";
const WILDFLY_SWARM_PLUGIN: &str = "org.wildfly.swarm:wildfly-swarm-plugin";

/// Project metadata generators derive image configurations from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    pub name: String,
    pub version: String,
    /// Build plugins as `group:artifact`.
    #[serde(default)]
    pub plugins: Vec<String>,
    /// Packaged artifact relative to the build context, e.g. `target/app.jar`.
    pub artifact: Option<PathBuf>,
    pub main_class: Option<String>,
}

impl ProjectInfo {
    pub fn has_plugin(&self, plugin: &str) -> bool {
        self.plugins.iter().any(|p| p == plugin)
    }

    /// `latest` for snapshot versions, the version itself otherwise.
    pub fn image_tag(&self) -> &str {
        if self.version.ends_with("-SNAPSHOT") || self.version.is_empty() {
            "latest"
        } else {
            &self.version
        }
    }
}

/// Synthesizes an image configuration for a kind of project.
pub trait Generator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this generator should add an image for `project` given the configured images.
    fn is_applicable(&self, project: &ProjectInfo, configs: &[ImageConfiguration]) -> bool;

    fn env(&self, project: &ProjectInfo, prepackage: bool) -> BTreeMap<String, String>;

    fn customize(&self, project: &ProjectInfo, prepackage: bool) -> ImageConfiguration;
}

/// Generators only add an image when the user configured none with a build section.
fn should_add_image_configuration(configs: &[ImageConfiguration]) -> bool {
    !configs.iter().any(|c| c.build.is_some())
}

/// Runs a plain Java application from a packaged jar.
#[derive(Debug, Default)]
pub struct JavaExecGenerator;

impl Generator for JavaExecGenerator {
    fn name(&self) -> &'static str {
        "java-exec"
    }

    fn is_applicable(&self, project: &ProjectInfo, configs: &[ImageConfiguration]) -> bool {
        should_add_image_configuration(configs) && project.artifact.is_some()
    }

    fn env(&self, project: &ProjectInfo, _prepackage: bool) -> BTreeMap<String, String> {
        let mut env = BTreeMap::from([("JAVA_APP_DIR".to_string(), JAVA_APP_DIR.to_string())]);
        if let Some(main_class) = &project.main_class {
            env.insert("JAVA_MAIN_CLASS".to_string(), main_class.clone());
        }
        env
    }

    fn customize(&self, project: &ProjectInfo, prepackage: bool) -> ImageConfiguration {
        java_image(project, self.env(project, prepackage))
    }
}

/// WildFly Swarm uber-jars run like plain Java apps, minus the agent bond.
#[derive(Debug, Default)]
pub struct WildFlySwarmGenerator {
    java: JavaExecGenerator,
}

impl Generator for WildFlySwarmGenerator {
    fn name(&self) -> &'static str {
        "wildfly-swarm"
    }

    fn is_applicable(&self, project: &ProjectInfo, configs: &[ImageConfiguration]) -> bool {
        should_add_image_configuration(configs) && project.has_plugin(WILDFLY_SWARM_PLUGIN)
    }

    fn env(&self, project: &ProjectInfo, prepackage: bool) -> BTreeMap<String, String> {
        let mut env = self.java.env(project, prepackage);
        // Agent bond breaks WildFly Swarm logging
        env.insert("AB_OFF".to_string(), "true".to_string());
        env.insert("AB_JOLOKIA_OFF".to_string(), "true".to_string());
        env
    }

    fn customize(&self, project: &ProjectInfo, prepackage: bool) -> ImageConfiguration {
        java_image(project, self.env(project, prepackage))
    }
}

fn java_image(project: &ProjectInfo, env: BTreeMap<String, String>) -> ImageConfiguration {
    let build = BuildImageConfiguration {
        from: Some(JAVA_BASE_IMAGE.to_string()),
        env,
        ports: vec!["8080".to_string(), "8778".to_string(), "9779".to_string()],
        assembly: project.artifact.as_ref().map(|artifact| AssemblyConfiguration {
            target_dir: JAVA_APP_DIR.to_string(),
            sources: vec![artifact.clone()],
        }),
        ..Default::default()
    };
    ImageConfiguration::new(
        format!("{}:{}", project.name, project.image_tag()),
        Some(build),
    )
}

/// Generators in the order they are asked, most specific first.
pub fn default_generators() -> Vec<Box<dyn Generator>> {
    vec![
        Box::new(WildFlySwarmGenerator::default()),
        Box::new(JavaExecGenerator),
    ]
}

/// Adds the image of the first applicable generator to `configs`.
pub fn generate(
    generators: &[Box<dyn Generator>],
    project: &ProjectInfo,
    mut configs: Vec<ImageConfiguration>,
) -> Vec<ImageConfiguration> {
    if let Some(generator) = generators
        .iter()
        .find(|g| g.is_applicable(project, &configs))
    {
        let image = generator.customize(project, false);
        info!(
            "Generator {} added image {} for project {}",
            generator.name(),
            image.name,
            project.name
        );
        configs.push(image);
    }
    configs
}
