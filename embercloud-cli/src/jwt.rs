//! Service-account assertion minting.

use std::path::Path;

use anyhow::{bail, Context, Result};
use embercloud_core::auth::{JwtAudience, JwtBuilder};
use embercloud_core::config::DEFAULT_SCOPES;
use embercloud_core::ServiceAccount;

/// Build the audience from command-line options.
///
/// A `uid` selects a custom token; otherwise an access-token grant for
/// `scopes` (or the default scopes) is built.
pub fn audience(uid: Option<String>, claims: Option<&str>, scopes: Vec<String>) -> Result<JwtAudience> {
    match uid {
        Some(uid) => {
            if !scopes.is_empty() {
                bail!("--scope applies to access tokens only; drop --uid to use it");
            }
            let claims = claims
                .map(serde_json::from_str::<serde_json::Value>)
                .transpose()
                .context("--claims must be a JSON object")?;
            if claims.as_ref().is_some_and(|c| !c.is_object()) {
                bail!("--claims must be a JSON object");
            }
            Ok(JwtAudience::CustomToken { uid, claims })
        }
        None if claims.is_some() => bail!("--claims requires --uid"),
        None if scopes.is_empty() => Ok(JwtAudience::AccessToken {
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
        }),
        None => Ok(JwtAudience::AccessToken { scopes }),
    }
}

/// Encode and sign an assertion issued at `now_epoch`.
pub fn mint(account_path: &Path, audience: JwtAudience, now_epoch: i64) -> Result<String> {
    let account = ServiceAccount::from_file(account_path)
        .with_context(|| format!("Failed to load service account from {:?}", account_path))?;
    tracing::info!("Signing assertion for {}", account.client_email);

    let mut builder = JwtBuilder::new(account, audience);
    builder.encode_header_payload(now_epoch)?;
    builder.sign()?;
    let Some(assertion) = builder.assertion() else {
        bail!("signing produced no assertion");
    };
    Ok(assertion.expose().to_string())
}
