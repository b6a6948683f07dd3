//! Scenario harness: one token plus one working directory
//!
//! Each scenario gets its own provisioned token and a private working
//! directory for the files the toolkit writes. Both are released when the
//! scenario is dropped, so scenarios can run in parallel without sharing
//! state.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::info;

use crate::error::TokenError;
use crate::token::TokenEnvironment;

pub struct Scenario {
    name: String,
    token: TokenEnvironment,
    workdir: TempDir,
}

impl Scenario {
    /// Provision a fresh token and working directory for `name`.
    pub async fn start(name: &str) -> Result<Self, TokenError> {
        let token = TokenEnvironment::open().await?;
        let workdir = TempDir::new()?;
        info!(
            scenario = name,
            workdir = %workdir.path().display(),
            module = %token.module_path().display(),
            "scenario started"
        );
        Ok(Self {
            name: name.to_string(),
            token,
            workdir,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &TokenEnvironment {
        &self.token
    }

    pub fn dir(&self) -> &Path {
        self.workdir.path()
    }

    /// Absolute path for a file the toolkit writes relative to the working
    /// directory.
    pub fn path(&self, relative: &str) -> PathBuf {
        self.workdir.path().join(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_joins_working_directory() {
        let scenario = Scenario {
            name: "join".to_string(),
            token: TokenEnvironment::stub(),
            workdir: TempDir::new().unwrap(),
        };
        assert_eq!(
            scenario.path("root_ca/CA.crt"),
            scenario.dir().join("root_ca").join("CA.crt")
        );
        assert_eq!(scenario.name(), "join");
    }
}
