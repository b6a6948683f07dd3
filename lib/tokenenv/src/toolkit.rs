//! Wrapper for the certificate toolkit under test
//!
//! Shapes `createca` / `createcsr` / `signcsr` invocations, substituting a
//! hardware-key locator for the usual private-key path where asked. Each call
//! runs inside the scenario's working directory with the token's process
//! environment.

use std::path::{Path, PathBuf};

use crate::error::TokenError;
use crate::exec::Invocation;
use crate::token::{KeyHandle, TokenEnvironment, MODULE_FILE};

/// Options for `createcsr`. With `ca_dir` set the toolkit issues a
/// certificate directly under that CA; without it, a plain CSR.
#[derive(Debug, Default)]
pub struct CsrOptions<'a> {
    pub subject: Option<&'a str>,
    pub cert_type: Option<&'a str>,
    pub ca_dir: Option<&'a str>,
}

/// The certificate toolkit CLI.
pub struct CertToolkit {
    binary: PathBuf,
}

impl CertToolkit {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Binary under test: `CERT_TOOLKIT_BIN`, or `x509sak` from `PATH`.
    pub fn from_env() -> Self {
        let binary = std::env::var("CERT_TOOLKIT_BIN").unwrap_or_else(|_| "x509sak".to_string());
        Self::new(binary)
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// `createca` with the CA key held inside the token.
    pub async fn create_ca(
        &self,
        token: &TokenEnvironment,
        key: &KeyHandle,
        subject: &str,
        ca_dir: &str,
        force: bool,
        cwd: &Path,
    ) -> Result<(), TokenError> {
        self.create_ca_with_uri(token, key.uri(), subject, ca_dir, force, cwd)
            .await
    }

    /// Like [`CertToolkit::create_ca`], but with a caller-supplied locator, so
    /// tests can probe references that match no key object or the wrong token.
    pub async fn create_ca_with_uri(
        &self,
        token: &TokenEnvironment,
        key_uri: &str,
        subject: &str,
        ca_dir: &str,
        force: bool,
        cwd: &Path,
    ) -> Result<(), TokenError> {
        self.create_ca_invocation(token, key_uri, subject, ca_dir, force)
            .current_dir(cwd)
            .checked()
            .await?;
        Ok(())
    }

    /// `createcsr`: software key material, optionally issued under a CA.
    pub async fn create_csr(
        &self,
        token: &TokenEnvironment,
        options: &CsrOptions<'_>,
        key_out: &str,
        out: &str,
        cwd: &Path,
    ) -> Result<(), TokenError> {
        self.create_csr_invocation(token, options, key_out, out)
            .current_dir(cwd)
            .checked()
            .await?;
        Ok(())
    }

    /// `signcsr`: sign an existing CSR under the given CA.
    pub async fn sign_csr(
        &self,
        token: &TokenEnvironment,
        subject: &str,
        cert_type: &str,
        ca_dir: &str,
        csr: &str,
        cert_out: &str,
        cwd: &Path,
    ) -> Result<(), TokenError> {
        self.sign_csr_invocation(token, subject, cert_type, ca_dir, csr, cert_out)
            .current_dir(cwd)
            .checked()
            .await?;
        Ok(())
    }

    fn create_ca_invocation(
        &self,
        token: &TokenEnvironment,
        key_uri: &str,
        subject: &str,
        ca_dir: &str,
        force: bool,
    ) -> Invocation {
        let mut invocation = Invocation::new(&self.binary).arg("createca");
        if force {
            invocation = invocation.arg("-f");
        }
        invocation
            .args([
                "-s",
                subject,
                "--pkcs11-so-search",
                token.search_path(),
                "--pkcs11-module",
                MODULE_FILE,
                "--hardware-key",
                key_uri,
                ca_dir,
            ])
            .envs(&token.process_env())
    }

    fn create_csr_invocation(
        &self,
        token: &TokenEnvironment,
        options: &CsrOptions<'_>,
        key_out: &str,
        out: &str,
    ) -> Invocation {
        let mut invocation = Invocation::new(&self.binary).arg("createcsr");
        if let Some(subject) = options.subject {
            invocation = invocation.args(["-s", subject]);
        }
        if let Some(cert_type) = options.cert_type {
            invocation = invocation.args(["-t", cert_type]);
        }
        if let Some(ca_dir) = options.ca_dir {
            invocation = invocation.args(["-c", ca_dir]);
        }
        invocation.args([key_out, out]).envs(&token.process_env())
    }

    fn sign_csr_invocation(
        &self,
        token: &TokenEnvironment,
        subject: &str,
        cert_type: &str,
        ca_dir: &str,
        csr: &str,
        cert_out: &str,
    ) -> Invocation {
        Invocation::new(&self.binary)
            .args(["signcsr", "-s", subject, "-t", cert_type, ca_dir, csr, cert_out])
            .envs(&token.process_env())
    }
}
