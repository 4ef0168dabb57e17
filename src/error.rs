use thiserror::Error;

use crate::addresses::AddressError;
use crate::audio::AudioError;
use crate::auth::AuthError;
use crate::display::DisplayError;
use crate::store::StoreError;

/// Crate-level error taxonomy.
///
/// Components never throw across the event-channel boundary: transient
/// authentication failures are retried once locally and only surfaced when
/// the retry fails; everything else becomes an `Error` event on the owning
/// channel. The manager is the final backstop, so no error here is fatal to
/// the process; at worst a session is reported disconnected and the user can
/// reconnect.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Display(#[from] DisplayError),
    #[error(transparent)]
    Audio(#[from] AudioError),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The remote workload no longer exists; its local record was pruned.
    #[error("The desktop session has ended")]
    SessionGone,
}
