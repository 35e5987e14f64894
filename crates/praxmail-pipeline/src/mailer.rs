//! Outbound mail contract. `correlation_id` is the draft's row id; an
//! adapter must be idempotent by it (a resend of the same draft after a
//! crash must not produce a second delivery).

use async_trait::async_trait;

use praxmail_core::error::MailError;
use praxmail_core::types::RowId;

#[derive(Clone, Debug)]
pub struct SendOutcome {
    pub provider_id: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        correlation_id: RowId,
    ) -> Result<SendOutcome, MailError>;
}
