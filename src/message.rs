//! Whiteflag message types as they cross the relay.
//!
//! The relay does not interpret message semantics: the encoded message stays
//! an opaque hex string, and only the metadata header is populated from the
//! carrying transaction. Decoding header and body fields against the message
//! schema happens outside this crate.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Leading octets of every on-chain Whiteflag transaction payload: "WF".
pub const WHITEFLAG_PREFIX: [u8; 2] = [0x57, 0x46];

/// Metadata binding a Whiteflag message to its carrying transaction.
///
/// All hex fields are in canonical API form: lowercase, no `0x` prefix,
/// addresses with their original case. The originator public key is SEC
/// uncompressed, 130 hex characters with a leading `04`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaHeader {
    /// Name of the chain the transaction was observed on.
    pub blockchain: String,
    pub block_number: u64,
    pub transaction_hash: String,
    /// ISO-8601 block timestamp, when the block carries one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_time: Option<String>,
    pub originator_address: String,
    pub originator_pub_key: String,
    /// The complete Whiteflag message as hex, starting with `5746`.
    pub encoded_message: String,
}

/// A Whiteflag message observed on, or destined for, a blockchain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WfMessage {
    pub meta_header: MetaHeader,
    /// Protocol-defined message header, opaque to the relay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_header: Option<Map<String, Value>>,
    /// Protocol-defined message body, opaque to the relay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_body: Option<Map<String, Value>>,
}

impl WfMessage {
    /// Wraps a metadata header into a message with no decoded fields.
    pub fn from_meta_header(meta_header: MetaHeader) -> Self {
        WfMessage {
            meta_header,
            message_header: None,
            message_body: None,
        }
    }
}

/// The payload signed during authentication (Whiteflag A1 method).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WfSignPayload {
    /// Blockchain address of the originator, canonical API form.
    pub addr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orgname: Option<String>,
    /// URL pointing to the authentication resource.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extpubkey: Option<String>,
}

impl WfSignPayload {
    /// Serializes to a JSON object map for use as a JWS payload.
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Returns true when the octets begin with the Whiteflag marker.
pub fn is_whiteflag_payload(data: &[u8]) -> bool {
    data.starts_with(&WHITEFLAG_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_matches_wf_ascii() {
        assert_eq!(&WHITEFLAG_PREFIX, b"WF");
        assert!(is_whiteflag_payload(&[0x57, 0x46, 0x01, 0x00]));
        assert!(!is_whiteflag_payload(&[0xde, 0xad, 0xbe, 0xef]));
        assert!(!is_whiteflag_payload(&[0x57]));
    }

    #[test]
    fn meta_header_serializes_camel_case() {
        let meta = MetaHeader {
            blockchain: "ethereum-sepolia".to_owned(),
            block_number: 1024,
            transaction_hash: "aa".repeat(32),
            transaction_time: None,
            originator_address: "bb".repeat(20),
            originator_pub_key: format!("04{}", "cc".repeat(64)),
            encoded_message: "5746010000".to_owned(),
        };
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["blockNumber"], 1024);
        assert!(value["encodedMessage"].as_str().unwrap().starts_with("5746"));
        assert!(value.get("transactionTime").is_none());
    }

    #[test]
    fn sign_payload_omits_absent_fields() {
        let payload = WfSignPayload {
            addr: "1a2b".to_owned(),
            orgname: Some("example".to_owned()),
            url: None,
            extpubkey: None,
        };
        let map = payload.to_map();
        assert_eq!(map.len(), 2);
        assert!(map.contains_key("addr"));
        assert!(map.contains_key("orgname"));
    }
}
