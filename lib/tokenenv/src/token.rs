//! Ephemeral SoftHSM2 token environments
//!
//! Each [`TokenEnvironment`] owns one isolated SoftHSM2 configuration file and
//! one object-store directory, initializes a fresh token inside them, and
//! removes both on teardown. The middleware is the source of truth for token
//! contents; this module only brackets the lifecycle and shapes the CLI
//! invocations, so the private keys never leave the token.

use std::io::Write;
use std::path::{Path, PathBuf};

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use tempfile::{Builder, NamedTempFile, TempDir};
use tracing::{debug, info, warn};

use crate::error::TokenError;
use crate::exec::Invocation;

/// Default locations scanned for the SoftHSM2 loadable module, in order.
pub const DEFAULT_MODULE_SEARCH_PATH: &str = "/usr/local/lib/softhsm:/usr/lib/softhsm:/usr/local/lib:/usr/lib:/usr/lib/x86_64-linux-gnu:/usr/lib/x86_64-linux-gnu/openssl-1.0.2/engines:/usr/lib/x86_64-linux-gnu/engines-1.1";

/// Module filename looked up along the search path.
pub const MODULE_FILE: &str = "libsofthsm2.so";

/// Fixed token parameters. Deterministic on purpose: every environment gets a
/// fresh, storage-isolated token, so the same label, slot, and PINs are safe
/// to reuse across scenarios.
pub const TOKEN_LABEL: &str = "TestToken";
pub const SLOT: &str = "0";
pub const SO_PIN: &str = "3537363231383830";
pub const USER_PIN: &str = "648219";

const INIT_TOOL: &str = "softhsm2-util";
const PKCS11_TOOL: &str = "pkcs11-tool";

/// Bytes escaped in the locator's object label: whitespace, the URI
/// delimiters, and the escape character itself. Labels routinely carry spaces
/// ("my secure key"), which would otherwise corrupt the locator.
const LABEL_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'%')
    .add(b';')
    .add(b'?')
    .add(b'#')
    .add(b'[')
    .add(b']')
    .add(b'@')
    .add(b'&')
    .add(b'=')
    .add(b'+')
    .add(b'"');

fn encode_label(label: &str) -> String {
    utf8_percent_encode(label, LABEL_ESCAPE).to_string()
}

/// Opaque reference to a key pair living inside a token. The token owns the
/// key material; callers only hold the locator string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHandle {
    id: u64,
    label: String,
    uri: String,
}

impl KeyHandle {
    fn new(id: u64, label: &str) -> Self {
        let uri = format!(
            "pkcs11:object={};type=private;pin-value={USER_PIN};token={TOKEN_LABEL}",
            encode_label(label)
        );
        Self {
            id,
            label: label.to_string(),
            uri,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Locator accepted by the certificate toolkit in place of a key path.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Locator with the object label swapped out, for probing how tools react
    /// to references that match no key object.
    pub fn uri_with_object(&self, label: &str) -> String {
        format!(
            "pkcs11:object={};type=private;pin-value={USER_PIN};token={TOKEN_LABEL}",
            encode_label(label)
        )
    }

    /// Locator pointing at a different token name.
    pub fn uri_with_token(&self, token: &str) -> String {
        format!(
            "pkcs11:object={};type=private;pin-value={USER_PIN};token={token}",
            encode_label(&self.label)
        )
    }
}

/// One provisioned, ephemeral SoftHSM2 token instance.
///
/// Either fully initialized (config written and synced, storage allocated,
/// token formatted with its PINs, slot active) or never constructed; a failure
/// at any step of [`TokenEnvironment::open`] drops whatever was already
/// allocated before the error propagates.
#[derive(Debug)]
pub struct TokenEnvironment {
    config_file: Option<NamedTempFile>,
    storage_dir: Option<TempDir>,
    config_path: PathBuf,
    module_path: PathBuf,
    search_path: String,
}

impl TokenEnvironment {
    /// Provision a token using the configured module search path
    /// (`TOKENENV_MODULE_SEARCH_PATH`, falling back to the built-in list).
    pub async fn open() -> Result<Self, TokenError> {
        let search_path = std::env::var("TOKENENV_MODULE_SEARCH_PATH")
            .unwrap_or_else(|_| DEFAULT_MODULE_SEARCH_PATH.to_string());
        Self::open_with_search_path(&search_path).await
    }

    /// Provision a token, resolving the middleware module from the given
    /// ordered, colon-separated directory list.
    pub async fn open_with_search_path(search_path: &str) -> Result<Self, TokenError> {
        Self::open_inner(search_path, INIT_TOOL, &std::env::temp_dir()).await
    }

    // Init tool and temp root are injectable so tests can force failures after
    // allocation and observe the cleanup hermetically.
    async fn open_inner(
        search_path: &str,
        init_tool: &str,
        temp_root: &Path,
    ) -> Result<Self, TokenError> {
        let module_path = find_module(search_path, MODULE_FILE).ok_or_else(|| {
            TokenError::ResourceUnavailable(format!("{MODULE_FILE} not found in {search_path}"))
        })?;

        // Both temp resources delete themselves on drop, which covers every
        // failure path below.
        let mut config_file = Builder::new()
            .prefix("softhsm_")
            .suffix(".conf")
            .tempfile_in(temp_root)?;
        let storage_dir = Builder::new().prefix("objects_").tempdir_in(temp_root)?;

        writeln!(
            config_file,
            "directories.tokendir = {}",
            storage_dir.path().display()
        )?;
        writeln!(config_file, "directories.backend = file")?;
        writeln!(config_file, "log.level = INFO")?;
        config_file.flush()?;
        // The init tool reads this file from disk; commit it first.
        config_file.as_file().sync_all()?;

        let config_path = config_file.path().to_path_buf();
        let env = vec![(
            "SOFTHSM2_CONF".to_string(),
            config_path.display().to_string(),
        )];

        Invocation::new(init_tool)
            .args([
                "--init-token",
                "--slot",
                SLOT,
                "--label",
                TOKEN_LABEL,
                "--so-pin",
                SO_PIN,
                "--pin",
                USER_PIN,
            ])
            .envs(&env)
            .checked()
            .await
            .map_err(|e| match e {
                e @ TokenError::ToolFailed { .. } => TokenError::TokenInitFailed(e.to_string()),
                other => other,
            })?;

        info!(
            module = %module_path.display(),
            config = %config_path.display(),
            "token environment initialized"
        );

        Ok(Self {
            config_file: Some(config_file),
            storage_dir: Some(storage_dir),
            config_path,
            module_path,
            search_path: search_path.to_string(),
        })
    }

    /// Generate a key pair inside the token.
    pub async fn generate_key(
        &self,
        id: u64,
        label: &str,
        key_spec: &str,
    ) -> Result<KeyHandle, TokenError> {
        let module = self.module_path.display().to_string();
        let id_hex = format!("{id:x}");

        Invocation::new(PKCS11_TOOL)
            .args([
                "--module",
                module.as_str(),
                "--login",
                "--pin",
                USER_PIN,
                "--keypairgen",
                "--key-type",
                key_spec,
                "--id",
                id_hex.as_str(),
                "--label",
                label,
            ])
            .envs(&self.process_env())
            .checked()
            .await
            .map_err(|e| match e {
                e @ TokenError::ToolFailed { .. } => TokenError::KeyGenerationFailed(e.to_string()),
                other => other,
            })?;

        info!(id, label, key_spec, "generated key pair in token");
        Ok(KeyHandle::new(id, label))
    }

    /// Read a public key back out of the token, raw DER exactly as the tool
    /// emits it. Callers wanting a textual form pipe this through an external
    /// decoder.
    pub async fn read_public_key(&self, id: u64) -> Result<Vec<u8>, TokenError> {
        let module = self.module_path.display().to_string();
        let id_hex = format!("{id:x}");

        let output = Invocation::new(PKCS11_TOOL)
            .args([
                "--module",
                module.as_str(),
                "--login",
                "--pin",
                USER_PIN,
                "--read-object",
                "--type",
                "pubkey",
                "--id",
                id_hex.as_str(),
            ])
            .envs(&self.process_env())
            .checked()
            .await
            .map_err(|e| match e {
                e @ TokenError::ToolFailed { .. } => TokenError::KeyReadFailed(e.to_string()),
                other => other,
            })?;

        Ok(output.stdout)
    }

    /// Diagnostic listing of the token's objects. Logged, never asserted on.
    pub async fn list_objects(&self) -> Result<String, TokenError> {
        let module = self.module_path.display().to_string();

        let output = Invocation::new(PKCS11_TOOL)
            .args([
                "--module",
                module.as_str(),
                "--login",
                "--pin",
                USER_PIN,
                "--list-objects",
            ])
            .envs(&self.process_env())
            .checked()
            .await?;

        let text = output.stdout_text();
        debug!(objects = %text, "token object listing");
        Ok(text)
    }

    /// Environment variables a child process needs to address this token
    /// instance.
    pub fn process_env(&self) -> Vec<(String, String)> {
        vec![(
            "SOFTHSM2_CONF".to_string(),
            self.config_path.display().to_string(),
        )]
    }

    /// Resolved path of the middleware module.
    pub fn module_path(&self) -> &Path {
        &self.module_path
    }

    /// Search path the module was resolved from, re-exposed so tool flags can
    /// use the same list.
    pub fn search_path(&self) -> &str {
        &self.search_path
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Remove the on-disk state. Idempotent, and also runs from `Drop`; this
    /// executes on unwind paths, so failures are logged and swallowed.
    pub fn teardown(&mut self) {
        if let Some(storage_dir) = self.storage_dir.take() {
            if let Err(e) = storage_dir.close() {
                warn!(error = %e, "failed to remove token storage directory");
            }
        }
        if let Some(config_file) = self.config_file.take() {
            if let Err(e) = config_file.close() {
                warn!(error = %e, "failed to remove token configuration file");
            }
        }
    }
}

impl Drop for TokenEnvironment {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// First hit wins across the ordered, colon-separated directory list.
fn find_module(search_path: &str, file_name: &str) -> Option<PathBuf> {
    search_path
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(file_name))
        .find(|candidate| candidate.exists())
}

#[cfg(test)]
impl TokenEnvironment {
    /// Environment with allocated temp state but no token behind it, for
    /// invocation-shape and teardown tests.
    pub(crate) fn stub() -> Self {
        let config_file = Builder::new()
            .prefix("stub_cfg_")
            .suffix(".conf")
            .tempfile()
            .expect("stub config file");
        let storage_dir = Builder::new()
            .prefix("stub_obj_")
            .tempdir()
            .expect("stub storage dir");
        let config_path = config_file.path().to_path_buf();
        Self {
            config_file: Some(config_file),
            storage_dir: Some(storage_dir),
            config_path,
            module_path: PathBuf::from("/usr/lib/softhsm/libsofthsm2.so"),
            search_path: "/usr/lib/softhsm".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_grammar_and_label_encoding() {
        let handle = KeyHandle::new(12345, "my secure key");
        assert_eq!(
            handle.uri(),
            "pkcs11:object=my%20secure%20key;type=private;pin-value=648219;token=TestToken"
        );
        assert_eq!(handle.id(), 12345);
        assert_eq!(handle.label(), "my secure key");
    }

    #[test]
    fn test_label_encoding_escapes_uri_delimiters() {
        let handle = KeyHandle::new(1, "a;b=c%d");
        assert!(handle.uri().contains("object=a%3Bb%3Dc%25d;"));
    }

    #[test]
    fn test_locators_distinct_for_distinct_keys() {
        let a = KeyHandle::new(1, "key one");
        let b = KeyHandle::new(2, "key two");
        let c = KeyHandle::new(3, "key three");
        assert_ne!(a.uri(), b.uri());
        assert_ne!(a.uri(), c.uri());
        assert_ne!(b.uri(), c.uri());
    }

    #[test]
    fn test_uri_substitution_helpers() {
        let handle = KeyHandle::new(12345, "my secure key");
        assert_eq!(
            handle.uri_with_object("my UNKNOWN key"),
            "pkcs11:object=my%20UNKNOWN%20key;type=private;pin-value=648219;token=TestToken"
        );
        assert_eq!(
            handle.uri_with_token("TestUNKNOWN"),
            "pkcs11:object=my%20secure%20key;type=private;pin-value=648219;token=TestUNKNOWN"
        );
    }

    #[test]
    fn test_find_module_first_match_wins() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::write(first.path().join(MODULE_FILE), b"").unwrap();
        std::fs::write(second.path().join(MODULE_FILE), b"").unwrap();

        let search = format!("{}:{}", first.path().display(), second.path().display());
        let found = find_module(&search, MODULE_FILE).unwrap();
        assert_eq!(found, first.path().join(MODULE_FILE));
    }

    #[test]
    fn test_find_module_skips_missing_directories() {
        let present = tempfile::tempdir().unwrap();
        std::fs::write(present.path().join(MODULE_FILE), b"").unwrap();

        let search = format!("/nonexistent-dir-a:/nonexistent-dir-b:{}", present.path().display());
        let found = find_module(&search, MODULE_FILE).unwrap();
        assert_eq!(found, present.path().join(MODULE_FILE));
    }

    #[tokio::test]
    async fn test_open_fails_when_module_absent() {
        let empty = tempfile::tempdir().unwrap();
        let err = TokenEnvironment::open_with_search_path(&empty.path().display().to_string())
            .await
            .unwrap_err();
        match err {
            TokenError::ResourceUnavailable(message) => {
                assert!(message.contains(MODULE_FILE));
                assert!(message.contains(&empty.path().display().to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_failed_init_leaves_no_temp_state() {
        let module_dir = tempfile::tempdir().unwrap();
        std::fs::write(module_dir.path().join(MODULE_FILE), b"").unwrap();
        let temp_root = tempfile::tempdir().unwrap();

        // Init tool path is bogus, so the failure happens after the config
        // file and storage directory were allocated.
        let err = TokenEnvironment::open_inner(
            &module_dir.path().display().to_string(),
            "/nonexistent/init-tool",
            temp_root.path(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TokenError::ResourceUnavailable(_)));

        let leftovers: Vec<_> = std::fs::read_dir(temp_root.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert!(leftovers.is_empty(), "leaked temp state: {leftovers:?}");
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let mut env = TokenEnvironment::stub();
        let config_path = env.config_path().to_path_buf();
        let storage_path = env
            .storage_dir
            .as_ref()
            .map(|dir| dir.path().to_path_buf())
            .unwrap();

        env.teardown();
        assert!(!config_path.exists());
        assert!(!storage_path.exists());

        // Second call is a no-op, as is the Drop that follows.
        env.teardown();
    }

    #[test]
    fn test_process_env_names_config_file() {
        let env = TokenEnvironment::stub();
        let vars = env.process_env();
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].0, "SOFTHSM2_CONF");
        assert_eq!(vars[0].1, env.config_path().display().to_string());
    }
}
