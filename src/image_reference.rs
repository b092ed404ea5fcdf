use std::fmt;
use thiserror::Error;

const DEFAULT_TAG: &str = "latest";

/// A parsed container image reference such as `quay.io/foo/bar:v1` or `myapp:v2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: Option<String>,
    pub user: Option<String>,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("image reference is empty")]
    Empty,
    #[error("invalid character {1:?} in image reference {0}")]
    InvalidChar(String, char),
    #[error("invalid image format: {0}")]
    InvalidFormat(String),
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name_without_tag())?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl ImageReference {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseError::Empty);
        }
        if let Some(c) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || "/:.-_@".contains(*c)))
        {
            return Err(ParseError::InvalidChar(s.to_string(), c));
        }

        let (without_digest, digest) = match s.split_once('@') {
            Some((name, digest)) if !digest.is_empty() => (name, Some(digest.to_string())),
            Some(_) => return Err(ParseError::InvalidFormat(s.to_string())),
            None => (s, None),
        };

        // A colon after the last slash separates the tag, anything before is a registry port
        let (without_tag, tag) = match without_digest.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => {
                if tag.is_empty() {
                    return Err(ParseError::InvalidFormat(s.to_string()));
                }
                (name, Some(tag.to_string()))
            }
            _ => (without_digest, None),
        };

        let mut parts: Vec<&str> = without_tag.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }

        let registry = if parts.len() > 1 && is_registry(parts[0]) {
            Some(parts.remove(0).to_string())
        } else {
            None
        };

        let (user, repository) = match parts.as_slice() {
            [repository] => (None, repository.to_string()),
            [user, rest @ ..] => (Some(user.to_string()), rest.join("/")),
            [] => return Err(ParseError::InvalidFormat(s.to_string())),
        };

        Ok(Self {
            registry,
            user,
            repository,
            tag,
            digest,
        })
    }

    /// The tag, falling back to `latest` when none was given.
    pub fn tag(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }

    /// True when the image lives in the same namespace: no registry and no user part.
    pub fn is_local(&self) -> bool {
        self.registry.is_none() && self.user.is_none()
    }

    /// `user/repository`, or just `repository` for local images.
    pub fn simple_name(&self) -> String {
        match &self.user {
            Some(user) => format!("{}/{}", user, self.repository),
            None => self.repository.clone(),
        }
    }

    pub fn name_without_tag(&self) -> String {
        match &self.registry {
            Some(registry) => format!("{}/{}", registry, self.simple_name()),
            None => self.simple_name(),
        }
    }

    pub fn with_tag(&self, tag: &str) -> String {
        format!("{}:{}", self.name_without_tag(), tag)
    }
}

fn is_registry(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}
