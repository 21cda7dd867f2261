//! `bifroest-imp keygen` — ensure a key file and print its public key.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use bifroest_core::identity::encode_public_key;
use bifroest_core::keygen::{DsaParameterSize, EllipticCurve};
use bifroest_core::{fingerprint, KeyRequirement, KeyType};

#[derive(Args)]
pub struct KeygenArgs {
    /// Key type (rsa, dsa, ecdsa, ed25519)
    #[arg(long = "type", default_value = "ed25519")]
    key_type: KeyType,

    /// RSA modulus size
    #[arg(long)]
    bits: Option<usize>,

    /// ECDSA curve (p256, p384, p521)
    #[arg(long)]
    curve: Option<EllipticCurve>,

    /// Key file to load or create
    #[arg(long)]
    file: PathBuf,
}

/// Load or generate the key and print it in OpenSSH form.
pub fn run(args: KeygenArgs) -> Result<Option<i32>> {
    let requirement = KeyRequirement {
        key_type: args.key_type,
        bit_size: args.bits,
        dsa_parameter_size: matches!(args.key_type, KeyType::Dsa).then_some(DsaParameterSize::L1024N160),
        curve: args.curve,
    };
    let key = requirement
        .ensure_file(&args.file)
        .with_context(|| format!("cannot ensure key file {}", args.file.display()))?;
    let public = encode_public_key(key.public_key()).context("cannot encode public key")?;

    info!(path = %args.file.display(), fingerprint = %fingerprint(key.public_key()), "key ready");
    println!("{public}");
    Ok(None)
}
