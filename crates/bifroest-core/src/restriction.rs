//! Per-algorithm minimum key strength policy.
//!
//! Each algorithm has its own restriction enum (`none` forbids the algorithm,
//! `all` accepts any strength, `at-least-N-bits` sets a floor). [`Restriction`]
//! bundles the four and is consulted at handshake time for the peer's key.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ImpError, ImpResult};
use crate::identity::{fingerprint, key_strength, KeyStrength, PublicKey};

macro_rules! restriction {
    (
        $(#[$meta:meta])*
        $name:ident, $label:literal, default = $default:ident,
        { $($variant:ident = $bits:literal),* $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            None,
            All,
            $($variant,)*
        }

        impl $name {
            const LEVELS: &'static [($name, u32)] = &[$(($name::$variant, $bits),)*];

            /// Whether a key of `bits` strength passes this restriction.
            pub fn bits_allowed(&self, bits: u32) -> bool {
                match self {
                    $name::None => false,
                    $name::All => true,
                    other => Self::LEVELS
                        .iter()
                        .any(|(level, floor)| level == other && bits >= *floor),
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                $name::$default
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $name::None => f.write_str("none"),
                    $name::All => f.write_str("all"),
                    other => {
                        let bits = Self::LEVELS
                            .iter()
                            .find(|(level, _)| level == other)
                            .map(|(_, bits)| *bits)
                            .unwrap_or_default();
                        write!(f, "at-least-{bits}-bits")
                    }
                }
            }
        }

        impl FromStr for $name {
            type Err = ImpError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let lower = s.trim().to_lowercase();
                match lower.as_str() {
                    "" | "none" | "forbidden" => return Ok($name::None),
                    "all" | "unrestricted" => return Ok($name::All),
                    _ => {}
                }
                Self::LEVELS
                    .iter()
                    .find(|(_, bits)| bits_aliases(*bits).iter().any(|a| *a == lower))
                    .map(|(level, _)| *level)
                    .ok_or_else(|| {
                        ImpError::InvalidParameters(format!(
                            concat!("illegal ", $label, " key restriction: {:?}"),
                            s
                        ))
                    })
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let text = String::deserialize(deserializer)?;
                text.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Every spelling accepted for an "at least `bits` bits" level.
fn bits_aliases(bits: u32) -> [String; 8] {
    [
        format!("at-least-{bits}-bits"),
        format!("atleast{bits}bits"),
        format!("at_least_{bits}_bits"),
        format!("at-least-{bits}"),
        format!("atleast{bits}"),
        format!("at_least_{bits}"),
        format!("{bits}"),
        format!("{bits}bits"),
    ]
}

restriction!(
    /// Restriction for `ssh-rsa` keys, by modulus size.
    RsaRestriction, "rsa", default = AtLeast4096Bits,
    {
        AtLeast1024Bits = 1024,
        AtLeast2048Bits = 2048,
        AtLeast3072Bits = 3072,
        AtLeast4096Bits = 4096,
    }
);

restriction!(
    /// Restriction for `ssh-dss` keys, by size of the prime `p`. Disabled by default.
    DsaRestriction, "dsa", default = None,
    {
        AtLeast1024Bits = 1024,
        AtLeast2048Bits = 2048,
        AtLeast3072Bits = 3072,
    }
);

restriction!(
    /// Restriction for `ecdsa-sha2-*` keys, by curve size.
    EcdsaRestriction, "ecdsa", default = AtLeast384Bits,
    {
        AtLeast256Bits = 256,
        AtLeast384Bits = 384,
        AtLeast521Bits = 521,
    }
);

restriction!(
    /// Restriction for `ssh-ed25519` keys; these always have 256 bits.
    Ed25519Restriction, "ed25519", default = All,
    {
        AtLeast256Bits = 256,
    }
);

/// Combined policy over all supported key algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restriction {
    #[serde(default)]
    pub rsa: RsaRestriction,
    #[serde(default)]
    pub dsa: DsaRestriction,
    #[serde(default)]
    pub ecdsa: EcdsaRestriction,
    #[serde(default)]
    pub ed25519: Ed25519Restriction,
}

impl Restriction {
    /// Whether `key` satisfies the policy for its algorithm.
    pub fn key_allowed(&self, key: &PublicKey) -> bool {
        match key_strength(key) {
            KeyStrength::Rsa { bits } => self.rsa.bits_allowed(bits),
            KeyStrength::Dsa { bits } => self.dsa.bits_allowed(bits),
            KeyStrength::Ecdsa { bits } => self.ecdsa.bits_allowed(bits),
            KeyStrength::Ed25519 => self.ed25519.bits_allowed(256),
            KeyStrength::Other => false,
        }
    }

    /// Like [`Restriction::key_allowed`] but yields an authentication error.
    pub fn check(&self, key: &PublicKey) -> ImpResult<()> {
        if self.key_allowed(key) {
            Ok(())
        } else {
            Err(ImpError::AuthenticationFailed(format!(
                "key {} ({}) is not allowed by key restriction",
                fingerprint(key),
                key.algorithm()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::tests::{dsa_public_key, ed25519_key, rsa_public_key};

    #[test]
    fn defaults() {
        let r = Restriction::default();
        assert_eq!(r.rsa, RsaRestriction::AtLeast4096Bits);
        assert_eq!(r.dsa, DsaRestriction::None);
        assert_eq!(r.ecdsa, EcdsaRestriction::AtLeast384Bits);
        assert_eq!(r.ed25519, Ed25519Restriction::All);
    }

    #[test]
    fn rsa_floor_is_inclusive() {
        let r = Restriction::default();
        assert!(r.key_allowed(&rsa_public_key(4096)));
        assert!(!r.key_allowed(&rsa_public_key(4095)));

        let r = Restriction {
            rsa: RsaRestriction::AtLeast2048Bits,
            ..Default::default()
        };
        assert!(r.key_allowed(&rsa_public_key(2048)));
        assert!(!r.key_allowed(&rsa_public_key(2047)));
    }

    #[test]
    fn every_rsa_level_boundary() {
        for (level, floor) in RsaRestriction::LEVELS {
            assert!(level.bits_allowed(*floor), "{level} should allow {floor}");
            assert!(!level.bits_allowed(floor - 1), "{level} should reject {}", floor - 1);
        }
    }

    #[test]
    fn dsa_disabled_by_default() {
        let r = Restriction::default();
        assert!(!r.key_allowed(&dsa_public_key(3072)));
        let r = Restriction {
            dsa: DsaRestriction::AtLeast1024Bits,
            ..Default::default()
        };
        assert!(r.key_allowed(&dsa_public_key(1024)));
        assert!(!r.key_allowed(&dsa_public_key(1023)));
    }

    #[test]
    fn ed25519_unconditional_unless_forbidden() {
        let key = ed25519_key();
        assert!(Restriction::default().key_allowed(key.public_key()));
        let r = Restriction {
            ed25519: Ed25519Restriction::None,
            ..Default::default()
        };
        assert!(matches!(
            r.check(key.public_key()),
            Err(ImpError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn ecdsa_levels() {
        assert!(EcdsaRestriction::AtLeast384Bits.bits_allowed(384));
        assert!(EcdsaRestriction::AtLeast384Bits.bits_allowed(521));
        assert!(!EcdsaRestriction::AtLeast384Bits.bits_allowed(256));
        assert!(!EcdsaRestriction::None.bits_allowed(521));
    }

    #[test]
    fn parse_aliases() {
        for text in ["at-least-4096-bits", "atleast4096bits", "4096", "4096bits", "AT_LEAST_4096"] {
            assert_eq!(
                text.parse::<RsaRestriction>().unwrap(),
                RsaRestriction::AtLeast4096Bits,
                "{text}"
            );
        }
        assert_eq!("forbidden".parse::<DsaRestriction>().unwrap(), DsaRestriction::None);
        assert_eq!("".parse::<DsaRestriction>().unwrap(), DsaRestriction::None);
        assert_eq!("unrestricted".parse::<EcdsaRestriction>().unwrap(), EcdsaRestriction::All);
        assert!("4097".parse::<RsaRestriction>().is_err());
        assert!("512".parse::<Ed25519Restriction>().is_err());
    }

    #[test]
    fn display_is_canonical() {
        assert_eq!(RsaRestriction::AtLeast3072Bits.to_string(), "at-least-3072-bits");
        assert_eq!(EcdsaRestriction::None.to_string(), "none");
        assert_eq!(Ed25519Restriction::All.to_string(), "all");
    }

    #[test]
    fn restriction_travels_as_text() {
        let r = Restriction {
            rsa: RsaRestriction::AtLeast2048Bits,
            ecdsa: EcdsaRestriction::AtLeast521Bits,
            ..Default::default()
        };
        let bytes = crate::codec::cbor_encode(&r).unwrap();
        let back: Restriction = crate::codec::cbor_decode(&bytes).unwrap();
        assert_eq!(back, r);
    }
}
