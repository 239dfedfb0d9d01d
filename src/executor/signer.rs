//! Operator key & EIP-1559 transaction signing
//!
//! Type-2 transactions only: RLP payload, keccak over the 0x02-prefixed
//! preimage, secp256k1 recoverable signature, then the final raw wire
//! encoding whose keccak is the tx hash relays and blocks will report.

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_rlp::{Encodable, Header};
use k256::ecdsa::SigningKey;

use crate::error::{MipError, MipResult};
use crate::models::SignedRawTx;

/// An unsigned type-2 transaction ready for the operator key.
#[derive(Debug, Clone)]
pub struct TxRequest {
    pub chain_id: u64,
    pub nonce: u64,
    pub max_priority_fee_per_gas: u128,
    pub max_fee_per_gas: u128,
    pub gas_limit: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
}

impl TxRequest {
    /// RLP-encode the shared field prefix (everything before the
    /// signature), access list always empty.
    fn encode_fields(&self, payload: &mut Vec<u8>) {
        self.chain_id.encode(payload);
        self.nonce.encode(payload);
        self.max_priority_fee_per_gas.encode(payload);
        self.max_fee_per_gas.encode(payload);
        self.gas_limit.encode(payload);
        match self.to {
            Some(addr) => addr.encode(payload),
            None => Bytes::new().encode(payload),
        }
        self.value.encode(payload);
        self.data.encode(payload);
        // Empty access list.
        Header {
            list: true,
            payload_length: 0,
        }
        .encode(payload);
    }

    /// keccak(0x02 || rlp(fields)) — the signing preimage.
    fn signing_hash(&self) -> B256 {
        let mut payload = Vec::new();
        self.encode_fields(&mut payload);

        let mut preimage = vec![0x02u8];
        Header {
            list: true,
            payload_length: payload.len(),
        }
        .encode(&mut preimage);
        preimage.extend_from_slice(&payload);
        keccak256(&preimage)
    }

    fn raw_with_signature(&self, y_parity: bool, r: U256, s: U256) -> Bytes {
        let mut payload = Vec::new();
        self.encode_fields(&mut payload);
        (y_parity as u8).encode(&mut payload);
        r.encode(&mut payload);
        s.encode(&mut payload);

        let mut raw = vec![0x02u8];
        Header {
            list: true,
            payload_length: payload.len(),
        }
        .encode(&mut raw);
        raw.extend_from_slice(&payload);
        Bytes::from(raw)
    }
}

/// The operator signing key, loaded once from the configured env var.
pub struct OperatorSigner {
    key: SigningKey,
    address: Address,
}

impl OperatorSigner {
    pub fn from_env(var: &str) -> MipResult<Self> {
        let hex_key = std::env::var(var)
            .map_err(|_| MipError::Config(format!("operator key env var {var} not set")))?;
        Self::from_hex(&hex_key)
    }

    pub fn from_hex(hex_key: &str) -> MipResult<Self> {
        let bytes = hex::decode(hex_key.trim().trim_start_matches("0x"))
            .map_err(|e| MipError::Config(format!("operator key: {e}")))?;
        let key = SigningKey::from_slice(&bytes)
            .map_err(|e| MipError::Config(format!("operator key: {e}")))?;

        let point = key.verifying_key().to_encoded_point(false);
        let address = Address::from_slice(&keccak256(&point.as_bytes()[1..])[12..]);
        Ok(Self { key, address })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn sign(&self, request: &TxRequest) -> MipResult<SignedRawTx> {
        let hash = request.signing_hash();
        let (sig, recid) = self
            .key
            .sign_prehash_recoverable(hash.as_slice())
            .map_err(|e| MipError::InvariantViolation(format!("signing failed: {e}")))?;

        let r = U256::from_be_slice(&sig.r().to_bytes());
        let s = U256::from_be_slice(&sig.s().to_bytes());
        let raw = request.raw_with_signature(recid.is_y_odd(), r, s);
        let tx_hash = keccak256(&raw);

        Ok(SignedRawTx {
            hash: tx_hash,
            raw,
            sender: self.address,
            nonce: request.nonce,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> OperatorSigner {
        OperatorSigner::from_hex(
            "0101010101010101010101010101010101010101010101010101010101010101",
        )
        .unwrap()
    }

    fn request(nonce: u64) -> TxRequest {
        TxRequest {
            chain_id: 1,
            nonce,
            max_priority_fee_per_gas: 2_000_000_000,
            max_fee_per_gas: 60_000_000_000,
            gas_limit: 250_000,
            to: Some(Address::repeat_byte(0x42)),
            value: U256::ZERO,
            data: Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]),
        }
    }

    #[test]
    fn address_derivation_is_stable() {
        let a = signer().address();
        let b = signer().address();
        assert_eq!(a, b);
        assert_ne!(a, Address::ZERO);
    }

    #[test]
    fn raw_tx_is_type_two_and_deterministic() {
        let s = signer();
        let one = s.sign(&request(7)).unwrap();
        let two = s.sign(&request(7)).unwrap();
        assert_eq!(one.raw[0], 0x02);
        assert_eq!(one.raw, two.raw);
        assert_eq!(one.hash, two.hash);
        assert_eq!(one.nonce, 7);
        assert_eq!(one.sender, s.address());
    }

    #[test]
    fn nonce_changes_the_hash() {
        let s = signer();
        let a = s.sign(&request(1)).unwrap();
        let b = s.sign(&request(2)).unwrap();
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn deployment_tx_encodes_empty_recipient() {
        let s = signer();
        let mut req = request(0);
        req.to = None;
        // Must sign cleanly; the recipient slot is the empty byte string.
        let signed = s.sign(&req).unwrap();
        assert_eq!(signed.raw[0], 0x02);
    }

    #[test]
    fn bad_key_material_is_a_config_error() {
        assert!(OperatorSigner::from_hex("nope").is_err());
        assert!(OperatorSigner::from_hex("0x00").is_err());
    }
}
