//! Per-chain state: node identity, volatile status, and accounts.
//!
//! One [`ChainState`] record exists per configured chain. It is created at
//! init, mutated by the node monitor (parameters/status), the account
//! manager (accounts) and the block listener (block heights), and persisted
//! to the external state store after every material change. Private keys are
//! never part of this record.

use alloy_primitives::U256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Node identity snapshot: semi-static facts about the chain node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeParameters {
    /// RPC endpoint with credentials elided.
    pub url: String,
    pub chain_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    /// Node software identifier, e.g. `Geth/v1.13.x`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_info: Option<String>,
}

/// Sync progress as reported by the node while catching up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub starting_block: u64,
    pub current_block: u64,
    pub highest_block: u64,
}

/// Volatile node status, refreshed on a fixed interval.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_count: Option<u64>,
    #[serde(default)]
    pub syncing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_progress: Option<SyncProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<u128>,
    /// Highest block known to the node.
    #[serde(default)]
    pub highest_block: u64,
    /// Last block processed by the listener: the cursor.
    #[serde(default)]
    pub current_block: u64,
}

/// An on-chain account owned by this relay.
///
/// Address and public key are canonical API form. Balance and transaction
/// count stay unset until the first refresh. The private key lives in the
/// secret store, never here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub address: String,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_count: Option<u64>,
}

/// Per-chain root record as persisted to the state store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainState {
    pub parameters: NodeParameters,
    pub status: NodeStatus,
    #[serde(default)]
    pub accounts: Vec<Account>,
}

impl ChainState {
    /// Looks up an account by address, ignoring case.
    pub fn account(&self, address: &str) -> Option<&Account> {
        self.accounts
            .iter()
            .find(|a| a.address.eq_ignore_ascii_case(address))
    }

    pub fn account_mut(&mut self, address: &str) -> Option<&mut Account> {
        self.accounts
            .iter_mut()
            .find(|a| a.address.eq_ignore_ascii_case(address))
    }

    /// Removes and returns the account with the given address, if present.
    pub fn remove_account(&mut self, address: &str) -> Option<Account> {
        let index = self
            .accounts
            .iter()
            .position(|a| a.address.eq_ignore_ascii_case(address))?;
        Some(self.accounts.remove(index))
    }
}

/// Recursive update: folds `source` into `target`.
///
/// Arrays on both sides become their set union, target order first, new
/// entries appended. Objects on both sides recurse per key. Any other
/// pairing replaces the target value with the source value.
pub fn merge(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Array(target_items), Value::Array(source_items)) => {
            for item in source_items {
                if !target_items.contains(item) {
                    target_items.push(item.clone());
                }
            }
        }
        (Value::Object(target_map), Value::Object(source_map)) => {
            for (key, source_value) in source_map {
                match target_map.get_mut(key) {
                    Some(target_value) => merge(target_value, source_value),
                    None => {
                        target_map.insert(key.clone(), source_value.clone());
                    }
                }
            }
        }
        (target_value, source_value) => *target_value = source_value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_unions_arrays_preserving_target_order() {
        let mut target = json!(["a", "b"]);
        merge(&mut target, &json!(["b", "c", "a", "d"]));
        assert_eq!(target, json!(["a", "b", "c", "d"]));
    }

    #[test]
    fn merge_recurses_into_objects() {
        let mut target = json!({"status": {"peerCount": 3, "syncing": false}});
        merge(&mut target, &json!({"status": {"peerCount": 5}}));
        assert_eq!(
            target,
            json!({"status": {"peerCount": 5, "syncing": false}})
        );
    }

    #[test]
    fn merge_replaces_mismatched_shapes() {
        let mut target = json!({"balance": null});
        merge(&mut target, &json!({"balance": "0x10"}));
        assert_eq!(target, json!({"balance": "0x10"}));

        let mut target = json!({"value": ["a"]});
        merge(&mut target, &json!({"value": "scalar"}));
        assert_eq!(target, json!({"value": "scalar"}));
    }

    #[test]
    fn merge_inserts_new_keys() {
        let mut target = json!({"address": "ab"});
        merge(&mut target, &json!({"transactionCount": 7}));
        assert_eq!(target, json!({"address": "ab", "transactionCount": 7}));
    }

    #[test]
    fn account_lookup_ignores_case() {
        let state = ChainState {
            accounts: vec![Account {
                address: "7cB57B5A97eAbe94205C07890BE4c1aD31E486A8".to_owned(),
                public_key: format!("04{}", "ab".repeat(64)),
                balance: None,
                transaction_count: None,
            }],
            ..ChainState::default()
        };
        assert!(
            state
                .account("7cb57b5a97eabe94205c07890be4c1ad31e486a8")
                .is_some()
        );
        assert!(state.account("0000000000000000000000000000000000000000").is_none());
    }

    #[test]
    fn persisted_record_uses_camel_case_members() {
        let state = ChainState {
            parameters: NodeParameters {
                url: "http://node.example.org:8545".to_owned(),
                chain_id: 11155111,
                ..NodeParameters::default()
            },
            status: NodeStatus {
                highest_block: 1000,
                current_block: 998,
                ..NodeStatus::default()
            },
            accounts: vec![],
        };
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["parameters"]["chainId"], 11155111);
        assert_eq!(value["status"]["currentBlock"], 998);
        assert_eq!(value["status"]["highestBlock"], 1000);
        assert!(value["accounts"].as_array().unwrap().is_empty());
    }
}
