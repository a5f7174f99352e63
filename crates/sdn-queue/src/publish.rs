use sdn_core::{Cid, Pnm, SignatureType, Timestamp};
use sdn_crypto::NodeSigner;

/// Build a signed publication notification for a locally stored record.
///
/// The producer signs the hex CID text and the decimal timestamp text
/// separately so receivers can verify availability claims without the
/// record bytes.
pub fn build_pnm(
    signer: &NodeSigner,
    cid: Cid,
    schema: &str,
    multi_addr: &str,
    file_name: Option<String>,
) -> Pnm {
    build_pnm_at(signer, cid, schema, multi_addr, file_name, chrono::Utc::now().timestamp())
}

pub fn build_pnm_at(
    signer: &NodeSigner,
    cid: Cid,
    schema: &str,
    multi_addr: &str,
    file_name: Option<String>,
    now: Timestamp,
) -> Pnm {
    Pnm {
        cid,
        schema_name: schema.to_string(),
        file_name,
        multi_addr: multi_addr.to_string(),
        publish_timestamp: now,
        cid_signature: signer.sign(cid.to_hex().as_bytes()),
        timestamp_signature: signer.sign(now.to_string().as_bytes()),
        signature_type: SignatureType::Ed25519,
        producer: signer.peer_id(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_pnm_signatures_verify() {
        let signer = NodeSigner::generate();
        let cid = Cid::of(b"payload");
        let pnm = build_pnm_at(&signer, cid, "OMM", "/ip4/127.0.0.1/tcp/4001", None, 1_700_000_000);
        sdn_crypto::verify_from_peer(&pnm.producer, &pnm.cid_signing_bytes(), &pnm.cid_signature)
            .unwrap();
        sdn_crypto::verify_from_peer(
            &pnm.producer,
            &pnm.timestamp_signing_bytes(),
            &pnm.timestamp_signature,
        )
        .unwrap();
    }
}
