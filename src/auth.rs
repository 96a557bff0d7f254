//! Detached authentication signatures bound to blockchain identities.
//!
//! Whiteflag authentication method 1 publishes a URL whose content is a
//! JWS over the originator's address and organization details, signed with
//! the same secp256k1 key that controls the on-chain account. Issuing uses
//! ES256K over the JWS sign input; verification additionally cross-checks
//! that the presented public key actually controls the presented address.

use k256::ecdsa::Signature;
use k256::ecdsa::signature::{Signer, Verifier};
use serde_json::Value;
use std::sync::Arc;

use crate::accounts::{AccountError, AccountManager};
use crate::chain::ChainContext;
use crate::chain::evm::{self, EvmError};
use crate::jws::{self, FlattenedJws, JwsError};
use crate::message::WfSignPayload;
use crate::util::{b64, hexstr};

/// JWS algorithm for secp256k1 chains.
pub const JWS_ALGORITHM: &str = "ES256K";

/// Authentication signature failure.
#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    /// Verification failed; every disagreement is listed.
    #[error("signature verification failed: {}", mismatches.join("; "))]
    SignError { mismatches: Vec<String> },
    /// The signature member is not a decodable ES256K signature.
    #[error("malformed signature: {0}")]
    Malformed(String),
    #[error(transparent)]
    Jws(#[from] JwsError),
    #[error(transparent)]
    Account(#[from] AccountError),
    #[error(transparent)]
    Evm(#[from] EvmError),
}

/// Issues and verifies authentication signatures for one chain.
#[derive(Debug)]
pub struct AuthSigner {
    ctx: Arc<ChainContext>,
    accounts: Arc<AccountManager>,
}

impl AuthSigner {
    pub fn new(ctx: Arc<ChainContext>, accounts: Arc<AccountManager>) -> Self {
        AuthSigner { ctx, accounts }
    }

    /// Signs an authentication payload with the key of the account named
    /// by `payload.addr`.
    ///
    /// The address is replaced with its canonical form, an `iat` claim is
    /// stamped into the payload, and the result is a flattened JWS whose
    /// members are all base64url strings.
    pub async fn request_signature(
        &self,
        payload: WfSignPayload,
    ) -> Result<FlattenedJws, SignatureError> {
        let account = self
            .accounts
            .get(&hexstr::address_to_api_form(&payload.addr))
            .await?;
        let mut payload = payload;
        payload.addr = account.address.clone();

        let full = jws::create_sign_input(payload.to_map(), JWS_ALGORITHM, true);
        let sign_input = jws::serialize_sign_input(&full)?;

        let secret = self.accounts.private_key(&account.address).await?;
        let key = evm::signing_key(&secret);
        drop(secret);
        let signature: Signature = key?.sign(sign_input.as_bytes());

        let mut flat = full.to_flattened()?;
        flat.signature = b64::encode(signature.to_bytes());
        tracing::debug!(
            chain = %self.ctx.name,
            address = %account.address,
            "issued authentication signature"
        );
        Ok(flat)
    }

    /// Verifies a flattened JWS against a public key and address.
    ///
    /// The sign input is reconstructed from the serialized members exactly
    /// as received. Disagreements — signature not matching the key, or the
    /// key not controlling the address — are accumulated and reported
    /// together.
    pub async fn verify_signature(
        &self,
        jws_value: &Value,
        address: &str,
        public_key: &str,
    ) -> Result<WfSignPayload, SignatureError> {
        // Validates member presence and shape, enumerating all failures.
        let full = jws::decode(jws_value)?;
        let flat: FlattenedJws =
            serde_json::from_value(jws_value.clone()).map_err(JwsError::Json)?;

        let verifying_key = evm::verifying_key(public_key)?;
        let signature_bytes = b64::decode(&flat.signature)
            .map_err(|e| SignatureError::Malformed(e.to_string()))?;
        let signature = Signature::from_slice(&signature_bytes)
            .map_err(|e| SignatureError::Malformed(e.to_string()))?;

        let sign_input = format!("{}.{}", flat.protected, flat.payload);
        let mut mismatches = Vec::new();
        if verifying_key
            .verify(sign_input.as_bytes(), &signature)
            .is_err()
        {
            mismatches.push("signature does not match public key".to_owned());
        }

        let derived_address = evm::address_from_public_key(&verifying_key);
        let address = hexstr::address_to_api_form(address);
        if !derived_address.eq_ignore_ascii_case(&address) {
            mismatches.push(format!(
                "public key controls address {derived_address}, not {address}"
            ));
        }

        let payload: WfSignPayload =
            serde_json::from_value(Value::Object(full.payload)).map_err(JwsError::Json)?;
        if !hexstr::address_to_api_form(&payload.addr).eq_ignore_ascii_case(&address) {
            mismatches.push(format!(
                "signed payload names address {}, not {address}",
                payload.addr
            ));
        }

        if !mismatches.is_empty() {
            return Err(SignatureError::SignError { mismatches });
        }
        Ok(payload)
    }
}
