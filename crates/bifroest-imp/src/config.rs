//! Imp configuration: TOML file + environment + CLI overrides.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::info;

use bifroest_core::identity::decode_public_key;
use bifroest_core::{AccessToken, ImpError, ImpResult, KeyRequirement, PublicKey, Restriction, DEFAULT_PORT};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub imp: ImpSection,
    #[serde(default)]
    pub restriction: Restriction,
    /// Key to generate when the key file does not exist yet.
    #[serde(default)]
    pub key: Option<KeyRequirement>,
}

/// `[imp]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ImpSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_key_file")]
    pub key_file: String,
    /// OpenSSH encoding of the only master key accepted.
    #[serde(default)]
    pub master_public_key: Option<String>,
    /// Hex encoded access token.
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub allow_unauthenticated: bool,
    #[serde(default)]
    pub exit_code_dir: Option<String>,
    #[serde(default)]
    pub socket_dir: Option<String>,
    /// Seconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
}

impl Default for ImpSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            key_file: default_key_file(),
            master_public_key: None,
            access_token: None,
            allow_unauthenticated: false,
            exit_code_dir: None,
            socket_dir: None,
            handshake_timeout: default_handshake_timeout(),
        }
    }
}

fn default_listen() -> String {
    format!("0.0.0.0:{DEFAULT_PORT}")
}
fn default_key_file() -> String {
    "~/.bifroest/imp.key".to_string()
}
fn default_handshake_timeout() -> u64 {
    30
}

/// Values given on the command line or through the environment; they win
/// over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<String>,
    pub key_file: Option<String>,
    pub master_public_key: Option<String>,
    pub access_token: Option<String>,
    pub allow_unauthenticated: bool,
    pub exit_code_dir: Option<String>,
    pub socket_dir: Option<String>,
}

/// Resolved imp configuration (paths expanded, keys decoded).
#[derive(Debug, Clone)]
pub struct ImpConfig {
    pub listen: String,
    pub key_file: PathBuf,
    pub key_requirement: KeyRequirement,
    pub trust_anchor: Option<PublicKey>,
    pub access_token: Option<AccessToken>,
    pub allow_unauthenticated: bool,
    pub restriction: Restriction,
    pub exit_code_dir: Option<PathBuf>,
    pub socket_dir: Option<PathBuf>,
    pub handshake_timeout: std::time::Duration,
}

impl ImpConfig {
    /// Load the TOML file at `path` (missing means defaults), then apply
    /// `overrides`.
    pub fn load(path: &Path, overrides: Overrides) -> ImpResult<Self> {
        let expanded = expand_tilde(path);
        let file = if expanded.exists() {
            info!(path = %expanded.display(), "loading config file");
            let content = std::fs::read_to_string(&expanded)?;
            parse(&content)?
        } else {
            info!(path = %expanded.display(), "config file not found, using defaults");
            ConfigFile::default()
        };
        Self::resolve(file, overrides)
    }

    /// Merge `overrides` into a parsed file.
    pub fn resolve(file: ConfigFile, overrides: Overrides) -> ImpResult<Self> {
        let imp = file.imp;
        let trust_anchor = overrides
            .master_public_key
            .or(imp.master_public_key)
            .filter(|k| !k.trim().is_empty())
            .map(|k| decode_public_key(k.trim()))
            .transpose()?;
        let access_token = overrides
            .access_token
            .or(imp.access_token)
            .filter(|t| !t.trim().is_empty())
            .map(|t| t.parse::<AccessToken>())
            .transpose()?;

        Ok(Self {
            listen: overrides.listen.unwrap_or(imp.listen),
            key_file: expand_tilde_str(&overrides.key_file.unwrap_or(imp.key_file)),
            key_requirement: file.key.unwrap_or_default(),
            trust_anchor,
            access_token,
            allow_unauthenticated: overrides.allow_unauthenticated || imp.allow_unauthenticated,
            restriction: file.restriction,
            exit_code_dir: overrides
                .exit_code_dir
                .or(imp.exit_code_dir)
                .map(|d| expand_tilde_str(&d)),
            socket_dir: overrides
                .socket_dir
                .or(imp.socket_dir)
                .map(|d| expand_tilde_str(&d)),
            handshake_timeout: std::time::Duration::from_secs(imp.handshake_timeout),
        })
    }
}

/// Parse the content of a config file.
pub fn parse(content: &str) -> ImpResult<ConfigFile> {
    toml::from_str(content).map_err(|e| ImpError::Format(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    expand_tilde_str(&path.to_string_lossy())
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bifroest_core::identity::encode_public_key;
    use bifroest_core::keygen::KeyType;
    use bifroest_core::restriction::{EcdsaRestriction, RsaRestriction};

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = ImpConfig::resolve(parse("").unwrap(), Overrides::default()).unwrap();
        assert_eq!(cfg.listen, "0.0.0.0:8683");
        assert!(cfg.key_file.ends_with(".bifroest/imp.key"));
        assert!(cfg.trust_anchor.is_none());
        assert!(!cfg.allow_unauthenticated);
        assert_eq!(cfg.restriction, Restriction::default());
        assert_eq!(cfg.key_requirement.key_type, KeyType::Ed25519);
        assert_eq!(cfg.handshake_timeout.as_secs(), 30);
    }

    #[test]
    fn file_sections_are_read() {
        let file = parse(
            r#"
            [imp]
            listen = "127.0.0.1:9000"
            exit_code_dir = "/var/lib/bifroest/exit"
            handshake_timeout = 5

            [restriction]
            rsa = "at-least-2048-bits"
            ecdsa = "256"

            [key]
            key_type = "ecdsa"
            "#,
        )
        .unwrap();
        let cfg = ImpConfig::resolve(file, Overrides::default()).unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:9000");
        assert_eq!(cfg.exit_code_dir, Some(PathBuf::from("/var/lib/bifroest/exit")));
        assert_eq!(cfg.restriction.rsa, RsaRestriction::AtLeast2048Bits);
        assert_eq!(cfg.restriction.ecdsa, EcdsaRestriction::AtLeast256Bits);
        assert_eq!(cfg.key_requirement.key_type, KeyType::Ecdsa);
        assert_eq!(cfg.handshake_timeout.as_secs(), 5);
    }

    #[test]
    fn overrides_win_over_file() {
        let master = KeyRequirement::default().generate().unwrap();
        let encoded = encode_public_key(master.public_key()).unwrap();
        let file = parse(
            r#"
            [imp]
            listen = "127.0.0.1:9000"
            master_public_key = "not a key"
            "#,
        )
        .unwrap();
        let cfg = ImpConfig::resolve(
            file,
            Overrides {
                listen: Some("127.0.0.1:9001".into()),
                master_public_key: Some(encoded),
                access_token: Some("00ff".repeat(16)),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:9001");
        assert!(cfg.trust_anchor.is_some());
        assert!(cfg.access_token.is_some());
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(parse("[restriction]\nrsa = \"17 bits\"").is_err());
        let file = parse("[imp]\nmaster_public_key = \"garbage\"").unwrap();
        assert!(ImpConfig::resolve(file, Overrides::default()).is_err());
    }
}
