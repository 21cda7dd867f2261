//! Key generation and persistent key files.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use ssh_key::private::{KeypairData, RsaKeypair};
use ssh_key::{Algorithm, EcdsaCurve, LineEnding, PrivateKey};
use tracing::{debug, info};

use crate::error::{ImpError, ImpResult};
use crate::identity::fingerprint;

/// RSA modulus size used when none is requested.
pub const DEFAULT_RSA_BITS: usize = 4096;

/// Smallest RSA modulus that will be generated.
pub const MIN_RSA_BITS: usize = 2048;

/// Largest RSA modulus that will be generated.
pub const MAX_RSA_BITS: usize = 16384;

/// Supported key algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Rsa,
    Dsa,
    Ecdsa,
    Ed25519,
}

impl FromStr for KeyType {
    type Err = ImpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rsa" | "ssh-rsa" => Ok(KeyType::Rsa),
            "dsa" | "ssh-dss" => Ok(KeyType::Dsa),
            "ecdsa" => Ok(KeyType::Ecdsa),
            "ed25519" | "ssh-ed25519" => Ok(KeyType::Ed25519),
            other => Err(ImpError::InvalidParameters(format!("illegal key type: {other:?}"))),
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KeyType::Rsa => "rsa",
            KeyType::Dsa => "dsa",
            KeyType::Ecdsa => "ecdsa",
            KeyType::Ed25519 => "ed25519",
        })
    }
}

/// Elliptic curves available for ECDSA keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EllipticCurve {
    #[serde(rename = "p256")]
    P256,
    #[serde(rename = "p384")]
    P384,
    #[default]
    #[serde(rename = "p521")]
    P521,
}

impl FromStr for EllipticCurve {
    type Err = ImpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "").as_str() {
            "p256" | "nistp256" => Ok(EllipticCurve::P256),
            "p384" | "nistp384" => Ok(EllipticCurve::P384),
            "p521" | "nistp521" => Ok(EllipticCurve::P521),
            other => Err(ImpError::InvalidParameters(format!("illegal elliptic curve: {other:?}"))),
        }
    }
}

impl From<EllipticCurve> for EcdsaCurve {
    fn from(c: EllipticCurve) -> Self {
        match c {
            EllipticCurve::P256 => EcdsaCurve::NistP256,
            EllipticCurve::P384 => EcdsaCurve::NistP384,
            EllipticCurve::P521 => EcdsaCurve::NistP521,
        }
    }
}

/// DSA domain parameter sizes (`L` bits of `p`, `N` bits of `q`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DsaParameterSize {
    #[default]
    L1024N160,
    L2048N224,
    L2048N256,
    L3072N256,
}

/// What kind of key to generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRequirement {
    pub key_type: KeyType,
    /// RSA modulus size; defaults to [`DEFAULT_RSA_BITS`].
    #[serde(default)]
    pub bit_size: Option<usize>,
    #[serde(default)]
    pub dsa_parameter_size: Option<DsaParameterSize>,
    /// ECDSA curve; defaults to P-521.
    #[serde(default)]
    pub curve: Option<EllipticCurve>,
}

impl Default for KeyRequirement {
    fn default() -> Self {
        Self::new(KeyType::Ed25519)
    }
}

impl KeyRequirement {
    pub fn new(key_type: KeyType) -> Self {
        Self {
            key_type,
            bit_size: None,
            dsa_parameter_size: None,
            curve: None,
        }
    }

    /// Generate a fresh private key.
    pub fn generate(&self) -> ImpResult<PrivateKey> {
        let mut rng = OsRng;
        let key = match self.key_type {
            KeyType::Rsa => {
                let bits = self.bit_size.unwrap_or(DEFAULT_RSA_BITS);
                if !(MIN_RSA_BITS..=MAX_RSA_BITS).contains(&bits) {
                    return Err(ImpError::InvalidParameters(format!(
                        "rsa key size of {bits} bits is outside {MIN_RSA_BITS}..={MAX_RSA_BITS}"
                    )));
                }
                let keypair = RsaKeypair::random(&mut rng, bits)
                    .map_err(|e| ImpError::InvalidParameters(format!("cannot generate rsa key: {e}")))?;
                PrivateKey::new(KeypairData::from(keypair), "")?
            }
            KeyType::Dsa => {
                let params = self.dsa_parameter_size.unwrap_or_default();
                if params != DsaParameterSize::L1024N160 {
                    return Err(ImpError::InvalidParameters(format!(
                        "ssh-dss keys only support L1024N160 parameters, got {params:?}"
                    )));
                }
                PrivateKey::random(&mut rng, Algorithm::Dsa)?
            }
            KeyType::Ecdsa => {
                let curve = self.curve.unwrap_or_default();
                PrivateKey::random(
                    &mut rng,
                    Algorithm::Ecdsa {
                        curve: curve.into(),
                    },
                )?
            }
            KeyType::Ed25519 => PrivateKey::random(&mut rng, Algorithm::Ed25519)?,
        };
        Ok(key)
    }

    /// Load the key stored at `path`, or generate and persist a new one.
    ///
    /// A present but unreadable key file is an error and is never overwritten.
    /// New files are written atomically with mode `0400`.
    pub fn ensure_file(&self, path: &Path) -> ImpResult<PrivateKey> {
        match fs::read_to_string(path) {
            Ok(content) => {
                let key = PrivateKey::from_openssh(content.as_bytes()).map_err(|e| {
                    ImpError::Format(format!("cannot parse key file {}: {e}", path.display()))
                })?;
                if key.is_encrypted() {
                    return Err(ImpError::Format(format!(
                        "key file {} is encrypted",
                        path.display()
                    )));
                }
                debug!(path = %path.display(), fingerprint = %fingerprint(key.public_key()), "loaded key file");
                Ok(key)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let key = self.generate()?;
                write_key_file(path, &key)?;
                info!(
                    path = %path.display(),
                    key_type = %self.key_type,
                    fingerprint = %fingerprint(key.public_key()),
                    "generated new key file"
                );
                Ok(key)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn write_key_file(path: &Path, key: &PrivateKey) -> ImpResult<()> {
    let encoded = key.to_openssh(LineEnding::LF)?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        create_private_dir(dir)?;
    }

    let tmp = temp_path_for(path);
    let result = (|| -> io::Result<()> {
        let mut file = open_private(&tmp)?;
        file.write_all(encoded.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    Ok(result?)
}

fn temp_path_for(path: &Path) -> PathBuf {
    let suffix: u32 = rand::thread_rng().gen();
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{suffix:08x}.tmp"));
    path.with_file_name(name)
}

#[cfg(unix)]
fn open_private(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o400)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create_new(true).open(path)
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}
