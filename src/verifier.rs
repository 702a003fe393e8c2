use anyhow::Result;

use crate::message::Message;

/// Signature / authorization check, delegated to an external verifier.
/// Returning `false` rejects the message as unauthorized; an `Err` is a
/// verifier outage and is treated the same way (fail closed).
#[async_trait::async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, message: &Message) -> Result<bool>;
}

/// Verifier that accepts everything. Default for assemblies where
/// authenticity is enforced upstream.
pub struct AcceptAllVerifier;

#[async_trait::async_trait]
impl Verifier for AcceptAllVerifier {
    async fn verify(&self, _message: &Message) -> Result<bool> {
        Ok(true)
    }
}
