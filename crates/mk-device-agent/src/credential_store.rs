//! On-disk cache of an issued credential.
//!
//! Layout under the credential directory:
//! ```text
//! device.crt          device certificate (PEM)
//! device.key          private key (PEM, mode 0600)
//! ca.crt              CA certificate (PEM)
//! registration.json   enrollment metadata (no key material)
//! ```
//! Anything short of all four files, or files that no longer validate,
//! is treated as a cache miss rather than an error.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mk_protocol::{Credential, DeviceId, EnrollmentRecord};

pub const CERT_FILE: &str = "device.crt";
pub const KEY_FILE: &str = "device.key";
pub const CA_FILE: &str = "ca.crt";
pub const RECORD_FILE: &str = "registration.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode registration record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Metadata half of an [`EnrollmentRecord`]; the PEM blocks live in
/// their own files.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Sidecar {
    device_id: DeviceId,
    authentication_name: String,
    client_name: String,
    validity_days: u32,
    mqtt_hostname: String,
    broker_port: u16,
    issuer_url: String,
    requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    app_deployment: Option<serde_json::Value>,
}

/// Credential cache rooted at one directory.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE)
    }

    pub fn ca_path(&self) -> PathBuf {
        self.dir.join(CA_FILE)
    }

    pub fn record_path(&self) -> PathBuf {
        self.dir.join(RECORD_FILE)
    }

    fn paths(&self) -> [PathBuf; 4] {
        [self.cert_path(), self.key_path(), self.ca_path(), self.record_path()]
    }

    /// True when every cache file is present.
    pub fn exists(&self) -> bool {
        self.paths().iter().all(|p| p.is_file())
    }

    /// Load a cached record for `device_id`.
    ///
    /// Returns `Ok(None)` when nothing usable is cached: no files, some
    /// files missing, an unreadable sidecar, a record for another device,
    /// or PEM material that fails validation.
    pub fn load(&self, device_id: &DeviceId) -> Result<Option<EnrollmentRecord>, StoreError> {
        let present: Vec<_> = self.paths().into_iter().filter(|p| p.is_file()).collect();
        if present.is_empty() {
            tracing::debug!(dir = %self.dir.display(), "no cached credential");
            return Ok(None);
        }
        if present.len() < 4 {
            tracing::warn!(
                dir = %self.dir.display(),
                present = present.len(),
                "partial credential cache, treating as miss"
            );
            return Ok(None);
        }

        let sidecar: Sidecar = match serde_json::from_str(&read(&self.record_path())?) {
            Ok(sidecar) => sidecar,
            Err(e) => {
                tracing::warn!(error = %e, "unreadable registration record, treating as miss");
                return Ok(None);
            }
        };
        if &sidecar.device_id != device_id {
            tracing::warn!(
                cached = %sidecar.device_id,
                requested = %device_id,
                "cached credential belongs to another device"
            );
            return Ok(None);
        }

        let credential = Credential {
            device_id: sidecar.device_id,
            authentication_name: sidecar.authentication_name,
            client_name: sidecar.client_name,
            certificate_pem: read(&self.cert_path())?,
            private_key_pem: read(&self.key_path())?,
            ca_certificate_pem: read(&self.ca_path())?,
            validity_days: sidecar.validity_days,
            broker_hostname: sidecar.mqtt_hostname,
            broker_port: sidecar.broker_port,
        };
        if let Err(e) = credential.validate() {
            tracing::warn!(error = %e, "cached credential invalid, treating as miss");
            return Ok(None);
        }

        Ok(Some(EnrollmentRecord {
            credential,
            issuer_url: sidecar.issuer_url,
            requested_at: sidecar.requested_at,
            app_deployment: sidecar.app_deployment,
        }))
    }

    /// Persist a record, replacing whatever was cached.
    ///
    /// The sidecar is written last so an interrupted save leaves a
    /// partial cache, which `load` reports as a miss.
    pub fn save(&self, record: &EnrollmentRecord) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let _ = fs::remove_file(self.record_path());

        let credential = &record.credential;
        write(&self.cert_path(), &credential.certificate_pem)?;
        write_private(&self.key_path(), &credential.private_key_pem)?;
        write(&self.ca_path(), &credential.ca_certificate_pem)?;

        let sidecar = Sidecar {
            device_id: credential.device_id.clone(),
            authentication_name: credential.authentication_name.clone(),
            client_name: credential.client_name.clone(),
            validity_days: credential.validity_days,
            mqtt_hostname: credential.broker_hostname.clone(),
            broker_port: credential.broker_port,
            issuer_url: record.issuer_url.clone(),
            requested_at: record.requested_at,
            app_deployment: record.app_deployment.clone(),
        };
        write(&self.record_path(), &serde_json::to_string_pretty(&sidecar)?)?;

        tracing::info!(
            device_id = %credential.device_id,
            dir = %self.dir.display(),
            "credential cached"
        );
        Ok(())
    }

    /// Remove every cache file. Missing files are not an error.
    pub fn clear(&self) -> Result<(), StoreError> {
        for path in self.paths() {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(StoreError::Io { path, source }),
            }
        }
        tracing::info!(dir = %self.dir.display(), "credential cache cleared");
        Ok(())
    }
}

fn read(path: &Path) -> Result<String, StoreError> {
    fs::read_to_string(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write(path: &Path, contents: &str) -> Result<(), StoreError> {
    fs::write(path, contents).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &str) -> Result<(), StoreError> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(io_err)?;
    // `mode` only applies on creation.
    file.set_permissions(fs::Permissions::from_mode(0o600))
        .map_err(io_err)?;
    file.write_all(contents.as_bytes()).map_err(io_err)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &str) -> Result<(), StoreError> {
    write(path, contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mk_protocol::testing::record_for;

    #[test]
    fn empty_dir_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        assert!(!store.exists());
        let id = DeviceId::parse("lab-01").unwrap();
        assert!(store.load(&id).unwrap().is_none());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("certs"));
        let record = record_for("lab-01");

        store.save(&record).unwrap();
        assert!(store.exists());

        let loaded = store.load(&record.credential.device_id).unwrap().unwrap();
        assert_eq!(loaded.credential, record.credential);
        assert_eq!(loaded.issuer_url, record.issuer_url);
        assert_eq!(loaded.requested_at, record.requested_at);
    }

    #[test]
    fn sidecar_has_no_key_material() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        store.save(&record_for("lab-02")).unwrap();

        let sidecar: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.record_path()).unwrap()).unwrap();
        assert_eq!(sidecar["deviceId"], "lab-02");
        assert!(sidecar.get("privateKey").is_none());
        assert!(!sidecar.to_string().contains("PRIVATE KEY"));
    }

    #[cfg(unix)]
    #[test]
    fn private_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        store.save(&record_for("lab-03")).unwrap();

        let mode = fs::metadata(store.key_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn partial_cache_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        let record = record_for("lab-04");
        store.save(&record).unwrap();
        fs::remove_file(store.ca_path()).unwrap();

        assert!(!store.exists());
        assert!(store.load(&record.credential.device_id).unwrap().is_none());
    }

    #[test]
    fn corrupted_pem_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        let record = record_for("lab-05");
        store.save(&record).unwrap();
        fs::write(store.cert_path(), "garbage").unwrap();

        assert!(store.load(&record.credential.device_id).unwrap().is_none());
    }

    #[test]
    fn other_device_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        store.save(&record_for("lab-06")).unwrap();

        let other = DeviceId::parse("lab-99").unwrap();
        assert!(store.load(&other).unwrap().is_none());
    }

    #[test]
    fn clear_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        store.save(&record_for("lab-07")).unwrap();

        store.clear().unwrap();
        assert!(!store.exists());
        assert!(!store.cert_path().exists());
        // Clearing twice is fine.
        store.clear().unwrap();
    }
}
