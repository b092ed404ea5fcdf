use serde::Deserialize;
use std::fmt;

/// Registry password that prints as "<REDACTED, length n>" in Debug/Display, so build
/// contexts can be logged safely
#[derive(Deserialize, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    /// Access the raw secret, e.g. to pipe it into `docker login --password-stdin`
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    fn fmt_redacted_secret(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<REDACTED, length {}>", self.0.len())
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        SecretString(s.to_string())
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_redacted_secret(f)
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_redacted_secret(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_secret_in_debug_and_display() {
        let secret = SecretString::from("hunter22");
        assert_eq!(format!("{}", secret), "<REDACTED, length 8>");
        assert_eq!(format!("{:?}", secret), "<REDACTED, length 8>");
        assert_eq!(secret.expose_secret(), "hunter22");
    }
}
