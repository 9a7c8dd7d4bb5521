use anyhow::{Context as _, Result};
use bitcoin::NetworkKind;
use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::secp256k1::rand::RngCore as _;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};

const PREIMAGE_TAG: &[u8] = b"swap-preimage";
const SEED_LEN: usize = 32;

/// Root entropy every per-job secret is derived from. Kept in memory only.
#[derive(Clone, PartialEq, Eq)]
pub struct MasterSeed(Vec<u8>);

impl MasterSeed {
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; SEED_LEN];
        bitcoin::secp256k1::rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        anyhow::ensure!(
            (16..=64).contains(&bytes.len()),
            "master seed must be 16..=64 bytes, got {}",
            bytes.len()
        );
        Ok(Self(bytes))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim()).context("decode master seed hex")?;
        Self::from_bytes(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for MasterSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterSeed(..)")
    }
}

/// Key material of one swap job: the claim/refund key and the swap preimage.
#[derive(Clone)]
pub struct SwapSecret {
    pub key_index: u32,
    secret_key: SecretKey,
    public_key: PublicKey,
    preimage: [u8; 32],
}

impl SwapSecret {
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn preimage(&self) -> [u8; 32] {
        self.preimage
    }

    pub fn preimage_hash(&self) -> [u8; 32] {
        sha256::Hash::hash(&self.preimage).to_byte_array()
    }
}

impl std::fmt::Debug for SwapSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapSecret")
            .field("key_index", &self.key_index)
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct SecretDeriver {
    master: Xpriv,
    secp: Secp256k1<All>,
}

impl SecretDeriver {
    pub fn new(seed: &MasterSeed) -> Result<Self> {
        // The network only affects xprv serialization, never the derived keys.
        let master =
            Xpriv::new_master(NetworkKind::Main, seed.as_bytes()).context("derive master xprv")?;
        Ok(Self {
            master,
            secp: Secp256k1::new(),
        })
    }

    pub fn derive(&self, key_index: u32) -> Result<SwapSecret> {
        let path = DerivationPath::from(vec![
            ChildNumber::from_hardened_idx(key_index >> 16).context("invalid derivation index")?,
            ChildNumber::from_hardened_idx(key_index & 0xffff)
                .context("invalid derivation index")?,
        ]);
        let xprv = self
            .master
            .derive_priv(&self.secp, &path)
            .with_context(|| format!("derive xprv for key index {key_index}"))?;

        let secret_key = xprv.private_key;
        let public_key = PublicKey::from_secret_key(&self.secp, &secret_key);

        let mut data = Vec::with_capacity(PREIMAGE_TAG.len() + 32);
        data.extend_from_slice(PREIMAGE_TAG);
        data.extend_from_slice(&secret_key.secret_bytes());
        let preimage = sha256::Hash::hash(&data).to_byte_array();

        Ok(SwapSecret {
            key_index,
            secret_key,
            public_key,
            preimage,
        })
    }
}

pub fn derive(seed: &MasterSeed, key_index: u32) -> Result<SwapSecret> {
    SecretDeriver::new(seed)?.derive(key_index)
}
