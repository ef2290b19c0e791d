//! Azure Blob Storage credential resolution.
//!
//! Credentials come from exactly one source, first match wins:
//!
//! 1. the JSON file named by `AZURE_APPLICATION_CREDENTIALS_JSON`
//! 2. the single `*.json` file inside `AZURE_APPLICATION_CREDENTIALS`
//! 3. the `storageAccount` and `storageKey` files inside that same directory
//!
//! A source that is present but unreadable or malformed is an error; only the
//! absence of a JSON file in the directory falls through to the discrete files.
//! Nothing is cached, every call re-reads the files.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use snapstore_common::{Result, SnapstoreError};

pub const ABS_CREDENTIAL_JSON_FILE: &str = "AZURE_APPLICATION_CREDENTIALS_JSON";
pub const ABS_CREDENTIAL_DIRECTORY: &str = "AZURE_APPLICATION_CREDENTIALS";
pub const AZURE_EMULATOR_ENABLED: &str = "AZURE_EMULATOR_ENABLED";
pub const AZURITE_ENDPOINT: &str = "AZURE_STORAGE_API_ENDPOINT";
pub const SOURCE_ENV_PREFIX: &str = "SOURCE_";
pub const AZURE_BLOB_STORAGE_HOST_NAME: &str = "blob.core.windows.net";

const STORAGE_ACCOUNT_FILE: &str = "storageAccount";
const STORAGE_KEY_FILE: &str = "storageKey";

/// The credential-related environment of one store, read once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AbsEnv {
    pub credential_json_file: Option<PathBuf>,
    pub credential_directory: Option<PathBuf>,
    /// Raw flag value; validated when the endpoint is built.
    pub emulator_enabled: Option<String>,
    pub emulator_endpoint: Option<String>,
}

impl AbsEnv {
    /// Read the process environment, `SOURCE_` prefixed for a source store.
    pub fn from_env(is_source: bool) -> Self {
        Self::from_lookup(env_prefix(is_source), |key| std::env::var(key).ok())
    }

    pub fn from_lookup(prefix: &str, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(&format!("{}{}", prefix, name));
        Self {
            credential_json_file: var(ABS_CREDENTIAL_JSON_FILE).map(PathBuf::from),
            credential_directory: var(ABS_CREDENTIAL_DIRECTORY).map(PathBuf::from),
            emulator_enabled: var(AZURE_EMULATOR_ENABLED),
            emulator_endpoint: var(AZURITE_ENDPOINT),
        }
    }
}

pub fn env_prefix(is_source: bool) -> &'static str {
    if is_source {
        SOURCE_ENV_PREFIX
    } else {
        ""
    }
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct AbsCredentials {
    #[serde(rename = "storageAccount", default)]
    pub storage_account: String,
    #[serde(rename = "storageKey", default)]
    pub storage_key: String,
    #[serde(rename = "bucketName", default)]
    pub bucket_name: Option<String>,
}

impl fmt::Debug for AbsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbsCredentials")
            .field("storage_account", &self.storage_account)
            .field("storage_key", &"<redacted>")
            .field("bucket_name", &self.bucket_name)
            .finish()
    }
}

impl AbsCredentials {
    fn ensure_complete(self) -> Result<Self> {
        if self.storage_account.is_empty() || self.storage_key.is_empty() {
            return Err(SnapstoreError::CredentialsUnavailable(
                "azure object storage credentials: storageKey or storageAccount is missing"
                    .to_string(),
            ));
        }
        Ok(self)
    }
}

/// Resolve credentials from the first configured source.
pub fn resolve_credentials(env: &AbsEnv) -> Result<AbsCredentials> {
    if let Some(file) = &env.credential_json_file {
        debug!(file = %file.display(), "Reading ABS credentials from JSON file");
        return read_credentials_json(file)
            .map_err(|e| e.context(format!("get credentials using {} file", file.display())));
    }

    if let Some(dir) = &env.credential_directory {
        if let Some(json_file) = find_json_file(dir)? {
            debug!(file = %json_file.display(), "Reading ABS credentials from JSON file in directory");
            return read_credentials_json(&json_file).map_err(|e| {
                e.context(format!(
                    "get credentials using {} JSON file in a directory",
                    json_file.display()
                ))
            });
        }

        debug!(dir = %dir.display(), "Reading ABS credentials from credential files");
        return read_credential_files(dir)
            .map_err(|e| e.context(format!("get credentials from {} dir", dir.display())));
    }

    Err(SnapstoreError::CredentialsUnavailable(format!(
        "neither {} nor {} is set",
        ABS_CREDENTIAL_JSON_FILE, ABS_CREDENTIAL_DIRECTORY
    )))
}

/// Latest modification time of the credential source `resolve_credentials` would use.
pub fn credentials_last_modified(env: &AbsEnv) -> Result<DateTime<Utc>> {
    if let Some(file) = &env.credential_json_file {
        return latest_modified(&[file.clone()]).map_err(|e| {
            e.context(format!(
                "fetch file information of the ABS JSON credential file {}",
                file.display()
            ))
        });
    }

    if let Some(dir) = &env.credential_directory {
        if let Some(json_file) = find_json_file(dir)? {
            return latest_modified(&[json_file]);
        }
        let files = [dir.join(STORAGE_ACCOUNT_FILE), dir.join(STORAGE_KEY_FILE)];
        return latest_modified(&files).map_err(|e| {
            e.context(format!(
                "get ABS credential timestamp from the directory {}",
                dir.display()
            ))
        });
    }

    Err(SnapstoreError::CredentialsUnavailable(
        "no environment variable set for the ABS credential file".to_string(),
    ))
}

/// Blob service URL for `account`, honouring the Azurite emulator settings.
pub fn construct_abs_uri(account: &str, env: &AbsEnv) -> Result<String> {
    let default_url = format!("https://{}.{}", account, AZURE_BLOB_STORAGE_HOST_NAME);

    let Some(flag) = env.emulator_enabled.as_deref() else {
        return Ok(default_url);
    };
    let is_emulator = parse_bool(flag).ok_or_else(|| {
        SnapstoreError::Configuration(format!(
            "invalid value for {}: {}",
            AZURE_EMULATOR_ENABLED, flag
        ))
    })?;
    if !is_emulator {
        return Ok(default_url);
    }

    let endpoint = env.emulator_endpoint.as_deref().ok_or_else(|| {
        SnapstoreError::Configuration(format!(
            "{} environment variable not set while {} is true",
            AZURITE_ENDPOINT, AZURE_EMULATOR_ENABLED
        ))
    })?;

    // The scheme is chosen by whoever runs the emulator.
    Ok(format!("{}/{}", endpoint.trim_end_matches('/'), account))
}

/// Boolean flag parsing: `1 t T TRUE true True` and `0 f F FALSE false False`.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

fn read_credentials_json(path: &Path) -> Result<AbsCredentials> {
    let data = std::fs::read(path)?;
    let credentials: AbsCredentials = serde_json::from_slice(&data)?;
    credentials.ensure_complete()
}

/// The single `*.json` file in `dir`, if there is one.
fn find_json_file(dir: &Path) -> Result<Option<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        SnapstoreError::from(e).context(format!(
            "find a JSON credential file in {} directory",
            dir.display()
        ))
    })?;

    let mut found = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().map_or(false, |ext| ext == "json") {
            found.push(path);
        }
    }

    match found.len() {
        0 => Ok(None),
        1 => Ok(found.pop()),
        n => Err(SnapstoreError::Configuration(format!(
            "expected at most one JSON credential file in {}, found {}",
            dir.display(),
            n
        ))),
    }
}

fn read_credential_files(dir: &Path) -> Result<AbsCredentials> {
    let read = |name: &str| -> Result<String> {
        let path = dir.join(name);
        if !path.is_file() {
            return Err(SnapstoreError::CredentialsUnavailable(format!(
                "{} is missing from {}",
                name,
                dir.display()
            )));
        }
        Ok(std::fs::read_to_string(&path)?)
    };

    AbsCredentials {
        storage_account: read(STORAGE_ACCOUNT_FILE)?,
        storage_key: read(STORAGE_KEY_FILE)?,
        bucket_name: None,
    }
    .ensure_complete()
}

fn latest_modified(files: &[PathBuf]) -> Result<DateTime<Utc>> {
    let mut latest: Option<DateTime<Utc>> = None;
    for file in files {
        let modified: DateTime<Utc> = std::fs::metadata(file)?.modified()?.into();
        latest = Some(latest.map_or(modified, |l| l.max(modified)));
    }
    latest.ok_or_else(|| {
        SnapstoreError::CredentialsUnavailable("no credential files to inspect".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::{Duration, SystemTime};

    fn write(path: &Path, contents: &str) {
        std::fs::write(path, contents).unwrap();
    }

    fn set_mtime(path: &Path, secs_after_epoch: u64) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs_after_epoch))
            .unwrap();
    }

    fn json(account: &str, key: &str) -> String {
        format!(
            r#"{{"storageAccount": "{}", "storageKey": "{}", "bucketName": "etcd"}}"#,
            account, key
        )
    }

    #[test]
    fn test_from_lookup_applies_prefix() {
        let vars: HashMap<&str, &str> = [
            ("SOURCE_AZURE_APPLICATION_CREDENTIALS_JSON", "/creds/source.json"),
            ("AZURE_APPLICATION_CREDENTIALS_JSON", "/creds/dest.json"),
            ("SOURCE_AZURE_EMULATOR_ENABLED", "true"),
        ]
        .into_iter()
        .collect();
        let lookup = |k: &str| vars.get(k).map(|v| v.to_string());

        let source = AbsEnv::from_lookup(env_prefix(true), lookup);
        assert_eq!(source.credential_json_file, Some(PathBuf::from("/creds/source.json")));
        assert_eq!(source.emulator_enabled.as_deref(), Some("true"));

        let dest = AbsEnv::from_lookup(env_prefix(false), lookup);
        assert_eq!(dest.credential_json_file, Some(PathBuf::from("/creds/dest.json")));
        assert_eq!(dest.emulator_enabled, None);
    }

    #[test]
    fn test_json_file_wins_over_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("explicit.json");
        write(&file, &json("fileaccount", "filekey"));
        let cred_dir = dir.path().join("dir");
        std::fs::create_dir(&cred_dir).unwrap();
        write(&cred_dir.join("storageAccount"), "diraccount");
        write(&cred_dir.join("storageKey"), "dirkey");

        let env = AbsEnv {
            credential_json_file: Some(file),
            credential_directory: Some(cred_dir),
            ..Default::default()
        };
        let creds = resolve_credentials(&env).unwrap();
        assert_eq!(creds.storage_account, "fileaccount");
        assert_eq!(creds.storage_key, "filekey");
    }

    #[test]
    fn test_json_file_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("credentials.json"), &json("jsonaccount", "jsonkey"));
        write(&dir.path().join("storageAccount"), "diraccount");
        write(&dir.path().join("storageKey"), "dirkey");

        let env = AbsEnv {
            credential_directory: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let creds = resolve_credentials(&env).unwrap();
        assert_eq!(creds.storage_account, "jsonaccount");
    }

    #[test]
    fn test_malformed_json_in_directory_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("credentials.json"), "{ not json");
        write(&dir.path().join("storageAccount"), "diraccount");
        write(&dir.path().join("storageKey"), "dirkey");

        let env = AbsEnv {
            credential_directory: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let err = resolve_credentials(&env).unwrap_err();
        assert!(matches!(err.root(), SnapstoreError::Json(_)), "{}", err);
    }

    #[test]
    fn test_discrete_files_without_trimming() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("storageAccount"), "account\n");
        write(&dir.path().join("storageKey"), "key");
        write(&dir.path().join("README.txt"), "not a credential");

        let env = AbsEnv {
            credential_directory: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let creds = resolve_credentials(&env).unwrap();
        assert_eq!(creds.storage_account, "account\n");
        assert_eq!(creds.storage_key, "key");
    }

    #[test]
    fn test_discrete_files_both_required() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("storageAccount"), "account");

        let env = AbsEnv {
            credential_directory: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let err = resolve_credentials(&env).unwrap_err();
        assert!(matches!(err.root(), SnapstoreError::CredentialsUnavailable(_)));
    }

    #[test]
    fn test_multiple_json_files_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("a.json"), &json("a", "a"));
        write(&dir.path().join("b.json"), &json("b", "b"));

        let env = AbsEnv {
            credential_directory: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let err = resolve_credentials(&env).unwrap_err();
        assert!(matches!(err, SnapstoreError::Configuration(_)));
    }

    #[test]
    fn test_empty_field_in_json_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("creds.json");
        write(&file, r#"{"storageAccount": "account"}"#);

        let env = AbsEnv {
            credential_json_file: Some(file),
            ..Default::default()
        };
        let err = resolve_credentials(&env).unwrap_err();
        assert!(matches!(err.root(), SnapstoreError::CredentialsUnavailable(_)));
    }

    #[test]
    fn test_missing_json_file_does_not_fall_through() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("storageAccount"), "account");
        write(&dir.path().join("storageKey"), "key");

        let env = AbsEnv {
            credential_json_file: Some(dir.path().join("missing.json")),
            credential_directory: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let err = resolve_credentials(&env).unwrap_err();
        assert!(matches!(err.root(), SnapstoreError::Io(_)));
    }

    #[test]
    fn test_nothing_configured() {
        let err = resolve_credentials(&AbsEnv::default()).unwrap_err();
        assert!(matches!(err, SnapstoreError::CredentialsUnavailable(_)));
        assert!(credentials_last_modified(&AbsEnv::default()).is_err());
    }

    #[test]
    fn test_last_modified_follows_resolution_order() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("explicit.json");
        write(&file, &json("a", "k"));
        set_mtime(&file, 1_000);

        let cred_dir = dir.path().join("dir");
        std::fs::create_dir(&cred_dir).unwrap();
        write(&cred_dir.join("storageAccount"), "a");
        write(&cred_dir.join("storageKey"), "k");
        set_mtime(&cred_dir.join("storageAccount"), 2_000);
        set_mtime(&cred_dir.join("storageKey"), 3_000);

        let env = AbsEnv {
            credential_json_file: Some(file),
            credential_directory: Some(cred_dir.clone()),
            ..Default::default()
        };
        assert_eq!(credentials_last_modified(&env).unwrap().timestamp(), 1_000);

        let env = AbsEnv {
            credential_directory: Some(cred_dir.clone()),
            ..Default::default()
        };
        assert_eq!(credentials_last_modified(&env).unwrap().timestamp(), 3_000);

        let json_in_dir = cred_dir.join("creds.json");
        write(&json_in_dir, &json("a", "k"));
        set_mtime(&json_in_dir, 1_500);
        assert_eq!(credentials_last_modified(&env).unwrap().timestamp(), 1_500);
    }

    #[test]
    fn test_last_modified_requires_both_discrete_files() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("storageKey"), "k");
        let env = AbsEnv {
            credential_directory: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        assert!(credentials_last_modified(&env).is_err());
    }

    #[test]
    fn test_construct_abs_uri() {
        let env = AbsEnv::default();
        assert_eq!(
            construct_abs_uri("acct", &env).unwrap(),
            "https://acct.blob.core.windows.net"
        );

        let env = AbsEnv {
            emulator_enabled: Some("false".to_string()),
            ..Default::default()
        };
        assert_eq!(
            construct_abs_uri("acct", &env).unwrap(),
            "https://acct.blob.core.windows.net"
        );

        let env = AbsEnv {
            emulator_enabled: Some("true".to_string()),
            emulator_endpoint: Some("http://localhost:10000/".to_string()),
            ..Default::default()
        };
        assert_eq!(
            construct_abs_uri("devstoreaccount1", &env).unwrap(),
            "http://localhost:10000/devstoreaccount1"
        );
    }

    #[test]
    fn test_construct_abs_uri_rejects_bad_flag() {
        for flag in ["yes", "TrUe", "on", ""] {
            let env = AbsEnv {
                emulator_enabled: Some(flag.to_string()),
                emulator_endpoint: Some("http://localhost:10000".to_string()),
                ..Default::default()
            };
            assert!(
                matches!(
                    construct_abs_uri("acct", &env),
                    Err(SnapstoreError::Configuration(ref msg)) if msg.starts_with("invalid value for")
                ),
                "flag {:?} accepted",
                flag
            );
        }
    }

    #[test]
    fn test_construct_abs_uri_emulator_requires_endpoint() {
        let env = AbsEnv {
            emulator_enabled: Some("1".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            construct_abs_uri("acct", &env),
            Err(SnapstoreError::Configuration(ref msg)) if msg.contains(AZURITE_ENDPOINT)
        ));
    }

    #[test]
    fn test_credentials_debug_redacts_key() {
        let creds = AbsCredentials {
            storage_account: "acct".to_string(),
            storage_key: "supersecret".to_string(),
            bucket_name: None,
        };
        assert!(!format!("{:?}", creds).contains("supersecret"));
    }
}
