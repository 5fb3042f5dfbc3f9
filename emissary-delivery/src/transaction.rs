//! Driving a started session through the transactions for one batch.

use emissary_common::{Address, DeliveryOutcome, Message};
use emissary_smtp::{SessionError, SmtpSession};

/// What became of one attempt against one host.
#[derive(Debug)]
pub enum HostAttempt {
    /// The host took part in the exchange; individual rejections are in the
    /// outcome's failed list.
    Delivered(DeliveryOutcome),
    /// The attempt as a whole failed and the next host should be tried.
    Failed(SessionError),
}

impl From<Result<DeliveryOutcome, SessionError>> for HostAttempt {
    fn from(value: Result<DeliveryOutcome, SessionError>) -> Self {
        match value {
            Ok(outcome) => Self::Delivered(outcome),
            Err(error) => Self::Failed(error),
        }
    }
}

/// Delivers one copy of `message`: a transaction for all of `primary`,
/// then one transaction per `bcc` address so that no blind recipient
/// shares an envelope with anyone else.
///
/// # Errors
///
/// Any error means the host attempt failed; recipients already counted
/// are discarded by the caller along with the attempt.
pub async fn send_copy(
    session: &mut SmtpSession,
    message: &dyn Message,
    reverse_path: &Address,
    primary: &[Address],
    bcc: &[Address],
) -> Result<DeliveryOutcome, SessionError> {
    let mut outcome = DeliveryOutcome::default();

    if !primary.is_empty() {
        outcome.absorb(
            session
                .send_envelope(message, reverse_path, primary)
                .await?,
        );
    }

    for address in bcc {
        outcome.absorb(
            session
                .send_envelope(message, reverse_path, std::slice::from_ref(address))
                .await?,
        );
    }

    Ok(outcome)
}
