//! # Authorizer
//!
//! Unconditional classification step in front of every admission: each
//! connection attempt passes through `authorize` exactly once, token or not.
//! There is no parameter-dependent bypass — skipping the authorizer based on
//! the shape of the request is how a speaker silently becomes a listener.

use crate::auth::token::TokenValidator;
use crate::auth::Principal;
use crate::error::AuthError;
use std::sync::Arc;
use tracing::{debug, warn};

/// Produces the `Principal` for a connection attempt.
pub struct Authorizer {
    validator: Arc<TokenValidator>,
}

impl Authorizer {
    pub fn new(validator: Arc<TokenValidator>) -> Self {
        Self { validator }
    }

    /// Classify one connection attempt.
    ///
    /// - Token present: validate it. Success yields the speaker principal;
    ///   failure denies the attempt (this path is only taken by speakers).
    /// - No token: allowed unconditionally as `Principal::Anonymous` — the
    ///   account-less listener path.
    pub async fn authorize(&self, bearer_token: Option<&str>) -> Result<Principal, AuthError> {
        match bearer_token {
            None => {
                debug!("No credential presented, admitting as anonymous");
                Ok(Principal::Anonymous)
            }
            Some(token) => match self.validator.validate(token).await {
                Ok(claims) => {
                    debug!(subject = %claims.sub, "Speaker credential verified");
                    Ok(Principal::Speaker {
                        subject: claims.sub,
                        email: claims.email,
                    })
                }
                Err(err) => {
                    warn!(error = %err, "Credential rejected");
                    Err(err)
                }
            },
        }
    }
}
