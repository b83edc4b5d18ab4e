use anyhow::{Context, Result};
use k256::ecdsa::{
    signature::{Signer, Verifier},
    Signature, SigningKey, VerifyingKey,
};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

/// SHA-256 of a canonical string, as lowercase hex.
pub fn hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

pub fn generate_private_key() -> String {
    hex::encode(SigningKey::random(&mut OsRng).to_bytes())
}

/// Derives the uncompressed secp256k1 public key (hex, `04` + X + Y) from a
/// hex-encoded private key.
pub fn public_key_for(private_key_hex: &str) -> Result<String> {
    let bytes = hex::decode(private_key_hex).context("private key is not valid hex")?;
    let key = SigningKey::from_slice(&bytes).context("private key is not a valid scalar")?;
    let point = key.verifying_key().to_encoded_point(false);
    Ok(hex::encode(point.as_bytes()))
}

/// Signs a hex-encoded message with a hex-encoded private key, returning the
/// ASN.1 DER encoding of the (r, s) pair as hex.
pub fn sign(message_hex: &str, private_key_hex: &str) -> Result<String> {
    let message = hex::decode(message_hex).context("message is not valid hex")?;
    let bytes = hex::decode(private_key_hex).context("private key is not valid hex")?;
    let key = SigningKey::from_slice(&bytes).context("private key is not a valid scalar")?;
    let signature: Signature = key.sign(&message);
    Ok(hex::encode(signature.to_der().as_bytes()))
}

/// Verifies a DER-encoded signature against a hex message and an uncompressed
/// public key. Malformed input of any kind verifies as false; peer-supplied
/// signatures must never fault the validator.
pub fn verify(message_hex: &str, signature_hex: &str, public_key_hex: &str) -> bool {
    let Ok(message) = hex::decode(message_hex) else {
        return false;
    };
    let Ok(signature_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(public_key_bytes) = hex::decode(public_key_hex) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_sec1_bytes(&public_key_bytes) else {
        return false;
    };
    let Ok(signature) = Signature::from_der(&signature_bytes) else {
        return false;
    };
    key.verify(&message, &signature).is_ok()
}

pub fn base58_encode(hex_str: &str) -> Result<String> {
    let bytes = hex::decode(hex_str).context("base58 input is not valid hex")?;
    Ok(bs58::encode(bytes).into_string())
}

pub fn base58_decode(encoded: &str) -> Result<String> {
    let bytes = bs58::decode(encoded)
        .into_vec()
        .context("invalid base58 string")?;
    Ok(hex::encode(bytes))
}

/// An address is valid iff it base58-decodes to the 130-hex-character
/// uncompressed public key form (leading `04`).
pub fn is_valid_address(address: &str) -> bool {
    match base58_decode(address) {
        Ok(decoded) => decoded.len() == 130 && decoded.starts_with("04"),
        Err(_) => false,
    }
}

/// Proof-of-work predicate: the binary expansion of the hex hash must begin
/// with at least `difficulty` zero bits.
pub fn hash_matches_difficulty(hash_hex: &str, difficulty: u32) -> bool {
    let Ok(bytes) = hex::decode(hash_hex) else {
        return false;
    };
    let mut needed = difficulty;
    for byte in bytes {
        if needed == 0 {
            return true;
        }
        if byte == 0 {
            needed = needed.saturating_sub(8);
        } else {
            return byte.leading_zeros() >= needed;
        }
    }
    needed == 0
}
