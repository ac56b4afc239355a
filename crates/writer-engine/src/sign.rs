//! Posting-key handling and transaction signing for broadcast.
//!
//! Keys arrive from the operator as WIF strings and are only validated and
//! used; the writer never derives or stores key material.

use chrono::{DateTime, NaiveDateTime, Utc};
use k256::ecdsa::SigningKey;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::hive::ChainError;
use crate::publisher::CustomJsonOperation;

/// Mainnet chain id mixed into every transaction digest.
const HIVE_CHAIN_ID: [u8; 32] = [
    0xbe, 0xea, 0xb0, 0xde, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00,
];

/// Serialized operation discriminant for `custom_json`.
const CUSTOM_JSON_OP_ID: u64 = 18;

/// Transaction lifetime relative to the referenced head block.
const TX_EXPIRATION_SECS: i64 = 60;

/// Expiration bumps to try before giving up on a canonical signature.
const MAX_CANONICAL_ATTEMPTS: i64 = 32;

const EXPIRATION_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// A validated WIF posting key.
#[derive(Clone)]
pub(crate) struct WifKey {
    key: SigningKey,
}

impl WifKey {
    /// Decode and checksum-validate a WIF string.
    pub(crate) fn from_wif(wif: &str) -> Result<Self, ChainError> {
        let raw = bs58::decode(wif.trim())
            .into_vec()
            .map_err(|err| ChainError::BadKey(err.to_string()))?;
        if raw.len() != 37 {
            return Err(ChainError::BadKey(format!(
                "unexpected decoded length {}",
                raw.len()
            )));
        }
        let (payload, checksum) = raw.split_at(33);
        let digest = Sha256::digest(Sha256::digest(payload));
        if digest[..4] != *checksum {
            return Err(ChainError::BadKey("checksum mismatch".to_string()));
        }
        if payload[0] != 0x80 {
            return Err(ChainError::BadKey(format!(
                "unexpected version byte {:#04x}",
                payload[0]
            )));
        }
        let key = SigningKey::from_slice(&payload[1..33])
            .map_err(|err| ChainError::BadKey(err.to_string()))?;
        Ok(Self { key })
    }
}

impl std::fmt::Debug for WifKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WifKey").finish_non_exhaustive()
    }
}

/// Head-block reference a transaction is anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RefBlock {
    pub(crate) num: u16,
    pub(crate) prefix: u32,
    pub(crate) head_time: DateTime<Utc>,
}

/// Extract the reference block from `get_dynamic_global_properties` output.
pub(crate) fn ref_block_from_props(props: &serde_json::Value) -> Result<RefBlock, ChainError> {
    let head_block_number = props
        .get("head_block_number")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| ChainError::Protocol("missing head_block_number".to_string()))?;
    let head_block_id = props
        .get("head_block_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ChainError::Protocol("missing head_block_id".to_string()))?;
    let time = props
        .get("time")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ChainError::Protocol("missing head block time".to_string()))?;

    let id_bytes = hex::decode(head_block_id)
        .map_err(|err| ChainError::Protocol(format!("bad head_block_id: {err}")))?;
    if id_bytes.len() < 8 {
        return Err(ChainError::Protocol("head_block_id too short".to_string()));
    }
    let prefix = u32::from_le_bytes(
        id_bytes[4..8]
            .try_into()
            .map_err(|_| ChainError::Protocol("head_block_id too short".to_string()))?,
    );

    let head_time = NaiveDateTime::parse_from_str(time, EXPIRATION_FORMAT)
        .map_err(|err| ChainError::Protocol(format!("bad head block time {time:?}: {err}")))?
        .and_utc();

    Ok(RefBlock {
        num: (head_block_number & 0xffff) as u16,
        prefix,
        head_time,
    })
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn write_string(out: &mut Vec<u8>, value: &str) {
    write_varint(out, value.len() as u64);
    out.extend_from_slice(value.as_bytes());
}

/// Hive wire serialization of a single-operation transaction.
pub(crate) fn serialize_transaction(
    ref_block: &RefBlock,
    expiration: DateTime<Utc>,
    op: &CustomJsonOperation,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(op.json.len() + 64);
    out.extend_from_slice(&ref_block.num.to_le_bytes());
    out.extend_from_slice(&ref_block.prefix.to_le_bytes());
    out.extend_from_slice(&(expiration.timestamp() as u32).to_le_bytes());
    write_varint(&mut out, 1);
    write_varint(&mut out, CUSTOM_JSON_OP_ID);
    write_varint(&mut out, op.required_auths.len() as u64);
    for account in &op.required_auths {
        write_string(&mut out, account);
    }
    write_varint(&mut out, op.required_posting_auths.len() as u64);
    for account in &op.required_posting_auths {
        write_string(&mut out, account);
    }
    write_string(&mut out, &op.id);
    write_string(&mut out, &op.json);
    write_varint(&mut out, 0);
    out
}

/// Graphene canonical-form check on a 64-byte `r || s` signature.
fn is_canonical(sig: &[u8; 64]) -> bool {
    sig[0] & 0x80 == 0
        && !(sig[0] == 0 && sig[1] & 0x80 == 0)
        && sig[32] & 0x80 == 0
        && !(sig[32] == 0 && sig[33] & 0x80 == 0)
}

/// Build the broadcastable transaction JSON, signed with `key`.
///
/// The chain rejects non-canonical signatures; since signing is
/// deterministic, the expiration is bumped one second at a time until the
/// resulting digest signs canonically.
pub(crate) fn signed_transaction_json(
    key: &WifKey,
    ref_block: &RefBlock,
    op: &CustomJsonOperation,
) -> Result<serde_json::Value, ChainError> {
    let base_expiration = ref_block.head_time + chrono::Duration::seconds(TX_EXPIRATION_SECS);

    for bump in 0..MAX_CANONICAL_ATTEMPTS {
        let expiration = base_expiration + chrono::Duration::seconds(bump);
        let serialized = serialize_transaction(ref_block, expiration, op);

        let mut hasher = Sha256::new();
        hasher.update(HIVE_CHAIN_ID);
        hasher.update(&serialized);
        let digest = hasher.finalize();

        let (signature, recovery_id) = key
            .key
            .sign_prehash_recoverable(digest.as_slice())
            .map_err(|err| ChainError::Protocol(format!("signing failed: {err}")))?;
        let sig_bytes: [u8; 64] = signature
            .to_bytes()
            .as_slice()
            .try_into()
            .map_err(|_| ChainError::Protocol("unexpected signature length".to_string()))?;
        if !is_canonical(&sig_bytes) {
            continue;
        }

        let mut compact = [0u8; 65];
        compact[0] = 27 + 4 + recovery_id.to_byte();
        compact[1..].copy_from_slice(&sig_bytes);

        return Ok(json!({
            "ref_block_num": ref_block.num,
            "ref_block_prefix": ref_block.prefix,
            "expiration": expiration.format(EXPIRATION_FORMAT).to_string(),
            "operations": [["custom_json", op]],
            "extensions": [],
            "signatures": [hex::encode(compact)],
        }));
    }

    Err(ChainError::Protocol(
        "could not produce a canonical signature".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    // The classic uncompressed-WIF test vector for secret key
    // 0c28fca386c7a227600b2fe50b7cae11ec86d3bf1fbe471be89827e19d72aa1d.
    const VALID_WIF: &str = "5HueCGU8rMjxEXxiPuD5BDku4MkFqeZyd4dZ1jvhTVqvbTLvyTJ";

    fn sample_op() -> CustomJsonOperation {
        CustomJsonOperation {
            required_auths: Vec::new(),
            required_posting_auths: vec!["podping.test".to_string()],
            id: "pp_podcast_update".to_string(),
            json: r#"{"medium":"podcast","reason":"update","iris":[]}"#.to_string(),
        }
    }

    fn sample_ref_block() -> RefBlock {
        RefBlock {
            num: 0x1234,
            prefix: 0x89ab_cdef,
            head_time: NaiveDateTime::parse_from_str("2024-05-01T12:00:00", EXPIRATION_FORMAT)
                .unwrap()
                .and_utc(),
        }
    }

    #[test]
    fn wif_round_trip_accepts_known_vector() {
        assert!(WifKey::from_wif(VALID_WIF).is_ok());
        assert!(WifKey::from_wif(&format!("  {VALID_WIF}\n")).is_ok());
    }

    #[test]
    fn wif_rejects_corruption() {
        // Flip the trailing character so the checksum no longer matches.
        let mut corrupted = VALID_WIF.to_string();
        corrupted.pop();
        corrupted.push('K');
        assert!(matches!(
            WifKey::from_wif(&corrupted),
            Err(ChainError::BadKey(_))
        ));

        assert!(matches!(
            WifKey::from_wif("not-base58-0OIl"),
            Err(ChainError::BadKey(_))
        ));
        assert!(matches!(WifKey::from_wif("3yZe7d"), Err(ChainError::BadKey(_))));
    }

    #[test]
    fn varint_encoding_matches_leb128() {
        let mut out = Vec::new();
        write_varint(&mut out, 0);
        write_varint(&mut out, 127);
        write_varint(&mut out, 128);
        write_varint(&mut out, 300);
        assert_eq!(out, vec![0x00, 0x7f, 0x80, 0x01, 0xac, 0x02]);
    }

    #[test]
    fn ref_block_parses_dynamic_global_properties() {
        let props = serde_json::json!({
            "head_block_number": 0x00a1_1234u64,
            "head_block_id": "00a11234efcdab8900000000000000000000000000000000",
            "time": "2024-05-01T12:00:00",
        });
        let ref_block = ref_block_from_props(&props).unwrap();
        assert_eq!(ref_block.num, 0x1234);
        assert_eq!(ref_block.prefix, 0x89ab_cdef);
        assert_eq!(ref_block.head_time.timestamp(), 1_714_564_800);

        let missing = serde_json::json!({ "head_block_number": 1 });
        assert!(ref_block_from_props(&missing).is_err());
    }

    #[test]
    fn transaction_serialization_layout() {
        let op = sample_op();
        let ref_block = sample_ref_block();
        let expiration = ref_block.head_time + chrono::Duration::seconds(60);
        let bytes = serialize_transaction(&ref_block, expiration, &op);

        // ref_block_num, ref_block_prefix, expiration: little-endian header.
        assert_eq!(&bytes[..2], &0x1234u16.to_le_bytes());
        assert_eq!(&bytes[2..6], &0x89ab_cdefu32.to_le_bytes());
        assert_eq!(
            &bytes[6..10],
            &(expiration.timestamp() as u32).to_le_bytes()
        );
        // One operation, discriminant 18, no active auths, one posting auth.
        assert_eq!(&bytes[10..13], &[1, 18, 0]);
        assert_eq!(bytes[13], 1);
        assert_eq!(bytes[14] as usize, "podping.test".len());
        assert_eq!(&bytes[15..27], b"podping.test");
        // Trailing byte is the empty extensions vector.
        assert_eq!(bytes[bytes.len() - 1], 0);
        assert!(bytes.windows(op.json.len()).any(|w| w == op.json.as_bytes()));
    }

    #[test]
    fn canonical_check_rejects_high_bits() {
        let mut sig = [1u8; 64];
        assert!(is_canonical(&sig));
        sig[0] = 0x80;
        assert!(!is_canonical(&sig));
        sig[0] = 0x00;
        sig[1] = 0x01;
        assert!(!is_canonical(&sig));
        // A leading zero byte is fine when the next byte has its high bit set.
        sig[1] = 0x80;
        assert!(is_canonical(&sig));
        sig[0] = 0x01;
        sig[1] = 0x01;
        sig[32] = 0x80;
        assert!(!is_canonical(&sig));
    }

    #[test]
    fn signed_transaction_has_canonical_signature() {
        let key = WifKey::from_wif(VALID_WIF).unwrap();
        let trx = signed_transaction_json(&key, &sample_ref_block(), &sample_op()).unwrap();

        assert_eq!(trx["ref_block_num"], 0x1234);
        assert_eq!(trx["operations"][0][0], "custom_json");
        assert_eq!(trx["operations"][0][1]["id"], "pp_podcast_update");
        assert_eq!(trx["extensions"].as_array().unwrap().len(), 0);

        let signature = trx["signatures"][0].as_str().unwrap();
        let raw = hex::decode(signature).unwrap();
        assert_eq!(raw.len(), 65);
        assert!(raw[0] >= 31);
        let body: [u8; 64] = raw[1..].try_into().unwrap();
        assert!(is_canonical(&body));
    }
}
