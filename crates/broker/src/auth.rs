// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! JWT minting and verification for the `/token` endpoint and every
//! authenticated request thereafter.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::model::Uid;

/// Claims carried by a broker-issued JWT: the user id and the device name
/// the token was minted for, plus standard expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub uid: String,
    pub device_name: String,
    pub exp: i64,
}

pub fn mint_token(secret: &str, uid: &Uid, device_name: &str, ttl_secs: i64) -> Result<String, BrokerError> {
    let exp = chrono::Utc::now().timestamp() + ttl_secs;
    let claims = Claims { uid: uid.as_str().to_owned(), device_name: device_name.to_owned(), exp };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|e| BrokerError::Auth(format!("failed to mint token: {e}")))
}

pub fn verify_token(secret: &str, token: &str) -> Result<Claims, BrokerError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| BrokerError::Auth(format!("invalid token: {e}")))?;
    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_then_verify_round_trips() -> anyhow::Result<()> {
        let secret = "test-secret";
        let uid = Uid::from("u1");
        let token = mint_token(secret, &uid, "laptop-1", 3600)?;
        let claims = verify_token(secret, &token)?;
        assert_eq!(claims.uid, "u1");
        assert_eq!(claims.device_name, "laptop-1");
        Ok(())
    }

    #[test]
    fn verify_rejects_wrong_secret() -> anyhow::Result<()> {
        let uid = Uid::from("u1");
        let token = mint_token("secret-a", &uid, "laptop-1", 3600)?;
        assert!(verify_token("secret-b", &token).is_err());
        Ok(())
    }
}
