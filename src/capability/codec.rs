//! Capability transport encoding: base64 of gzip-compressed JSON.

use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};

use super::model::Capability;
use crate::types::{KmsError, Result};

/// Upper bound on the decompressed JSON.
const MAX_DECODED_LEN: u64 = 64 * 1024;

pub fn encode(capability: &Capability) -> Result<String> {
    let json = serde_json::to_vec(capability)?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;

    Ok(STANDARD.encode(compressed))
}

pub fn decode(encoded: &str) -> Result<Capability> {
    let compressed = STANDARD
        .decode(encoded.trim())
        .map_err(|e| KmsError::Validation(format!("capability is not base64: {e}")))?;

    let mut json = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .take(MAX_DECODED_LEN)
        .read_to_end(&mut json)
        .map_err(|e| KmsError::Validation(format!("capability is not gzip: {e}")))?;

    serde_json::from_slice(&json)
        .map_err(|e| KmsError::Validation(format!("capability is not valid JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::model::Action;
    use chrono::Utc;

    #[test]
    fn test_decoded_payload_keeps_invoker() {
        let cap = Capability {
            id: Capability::new_id(),
            parent_capability: None,
            invoker: "did:example:123456789".into(),
            delegator: "did:key:z6Mk".into(),
            invocation_target: "ks-1".into(),
            allowed_action: Action::all(),
            expires: Utc::now(),
            proof: None,
        };

        let encoded = encode(&cap).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.invoker, "did:example:123456789");
        assert_eq!(decoded, cap);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(decode("!!!"), Err(KmsError::Validation(_))));
        assert!(matches!(
            decode(&STANDARD.encode(b"not gzip")),
            Err(KmsError::Validation(_))
        ));
    }
}
