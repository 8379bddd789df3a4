// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `TokenCheck` for `/events` (SPEC_FULL.md §4.7): verify the bearer's
//! signature, then require its `device_name` claim to match the device the
//! caller is connecting as. `/send`, `/kick`, `/info`, and `/token` carry no
//! additional authorization layer — per spec.md §1's Non-goals,
//! authorization beyond this token/device-name check is explicitly out of
//! scope, so there is no bearer-header middleware guarding the rest of the
//! request surface here.

use crate::auth::{verify_token, Claims};
use crate::error::BrokerError;

/// Verify `token`'s signature and require its `device_name` claim to equal
/// `device_name`. Returns the decoded claims (carrying `uid`) on success.
pub fn token_check(jwt_secret: &str, token: &str, device_name: &str) -> Result<Claims, BrokerError> {
    let claims = verify_token(jwt_secret, token)?;
    if claims.device_name != device_name {
        return Err(BrokerError::Auth("token device name does not match request".into()));
    }
    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::mint_token;
    use crate::model::Uid;

    #[test]
    fn matching_device_name_passes() -> anyhow::Result<()> {
        let token = mint_token("secret", &Uid::from("u1"), "laptop-1", 3600)?;
        let claims = token_check("secret", &token, "laptop-1")?;
        assert_eq!(claims.uid, "u1");
        Ok(())
    }

    #[test]
    fn mismatched_device_name_is_rejected() -> anyhow::Result<()> {
        let token = mint_token("secret", &Uid::from("u1"), "laptop-1", 3600)?;
        assert!(token_check("secret", &token, "laptop-2").is_err());
        Ok(())
    }

    #[test]
    fn bad_signature_is_rejected() -> anyhow::Result<()> {
        let token = mint_token("secret-a", &Uid::from("u1"), "laptop-1", 3600)?;
        assert!(token_check("secret-b", &token, "laptop-1").is_err());
        Ok(())
    }
}
