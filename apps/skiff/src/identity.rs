use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use skiff_proto::{DeviceClass, DeviceInfo};
use thiserror::Error;
use tracing::info;

const ID_LEN: usize = 7;
const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const MODELS: &[&str] = &["Node", "Station", "Ghost", "Core", "Unit", "Operator"];

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("unable to determine home directory")]
    NoHome,
    #[error("identity file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("identity file {path:?} is malformed: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to encode identity: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// Who this device is on the relay: a stable random id, a display name, and
/// its device class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIdentity {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub class: DeviceClass,
}

impl LocalIdentity {
    pub fn generate(class: DeviceClass) -> Self {
        Self::generate_with(&mut rand::thread_rng(), class)
    }

    pub fn generate_with<R: Rng>(rng: &mut R, class: DeviceClass) -> Self {
        let id = (0..ID_LEN)
            .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
            .collect();
        let model = MODELS.choose(rng).copied().unwrap_or("Node");
        let number: u32 = rng.gen_range(0..999);
        Self {
            id,
            name: format!("Skiff {model} {number}"),
            class,
        }
    }

    /// `~/.skiff/identity.toml`
    pub fn default_path() -> Result<PathBuf, IdentityError> {
        let base = BaseDirs::new().ok_or(IdentityError::NoHome)?;
        Ok(base.home_dir().join(".skiff").join("identity.toml"))
    }

    /// Load the identity at `path`, creating and saving a fresh one if the
    /// file does not exist. `class` overrides the stored device class.
    pub fn load_or_create(path: &Path, class: Option<DeviceClass>) -> Result<Self, IdentityError> {
        if path.exists() {
            let raw = fs::read_to_string(path).map_err(|source| IdentityError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let mut identity: LocalIdentity =
                toml::from_str(&raw).map_err(|source| IdentityError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?;
            if let Some(class) = class {
                if class != identity.class {
                    identity.class = class;
                    identity.save(path)?;
                }
            }
            return Ok(identity);
        }

        let identity = Self::generate(class.unwrap_or_default());
        identity.save(path)?;
        info!(id = %identity.id, name = %identity.name, path = %path.display(), "created identity");
        Ok(identity)
    }

    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        let io_err = |source| IdentityError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let serialized = toml::to_string_pretty(self)?;
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path).map_err(io_err)?;
        file.write_all(serialized.as_bytes()).map_err(io_err)?;
        Ok(())
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            model: self.name.clone(),
            class: self.class,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn generated_identity_has_expected_shape() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let identity = LocalIdentity::generate_with(&mut rng, DeviceClass::Tablet);
            assert_eq!(identity.id.len(), ID_LEN);
            assert!(identity
                .id
                .bytes()
                .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase()));

            let parts: Vec<&str> = identity.name.split(' ').collect();
            assert_eq!(parts.len(), 3);
            assert_eq!(parts[0], "Skiff");
            assert!(MODELS.contains(&parts[1]));
            assert!(parts[2].parse::<u32>().unwrap() < 999);
            assert_eq!(identity.class, DeviceClass::Tablet);
        }
    }

    #[test]
    fn identity_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("identity.toml");

        let first = LocalIdentity::load_or_create(&path, None).unwrap();
        assert_eq!(first.class, DeviceClass::Desktop);
        let second = LocalIdentity::load_or_create(&path, None).unwrap();
        assert_eq!(first, second);

        let mobile = LocalIdentity::load_or_create(&path, Some(DeviceClass::Mobile)).unwrap();
        assert_eq!(mobile.id, first.id);
        assert_eq!(mobile.class, DeviceClass::Mobile);
        let reloaded = LocalIdentity::load_or_create(&path, None).unwrap();
        assert_eq!(reloaded.class, DeviceClass::Mobile);
    }

    #[test]
    fn malformed_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.toml");
        fs::write(&path, "id = [").unwrap();
        assert!(matches!(
            LocalIdentity::load_or_create(&path, None),
            Err(IdentityError::Parse { .. })
        ));
    }

    #[test]
    fn device_info_carries_name_and_class() {
        let identity = LocalIdentity {
            id: "k2z".into(),
            name: "Skiff Core 12".into(),
            class: DeviceClass::Mobile,
        };
        let info = identity.device_info();
        assert_eq!(info.model, "Skiff Core 12");
        assert_eq!(info.class, DeviceClass::Mobile);
    }
}
