use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::Frame;

/// This enum contains all error messages this library can return. Most API functions will generally return a [`Result<(), RollnetError>`].
///
/// [`Result<(), RollnetError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq, Hash)]
pub enum RollnetError {
    /// The session is not synchronized with all remote peers yet. Start the session and keep calling `idle()` to let the clients synchronize.
    NotSynchronized,
    /// The operation is forbidden while the session is replaying frames after a rollback.
    InRollback,
    /// Accepting this input would put the session more than the maximum prediction frames ahead of a remote peer.
    /// Idle until remote inputs arrive, then try again.
    PredictionThreshold,
    /// The provided player handle does not refer to a player usable for this operation.
    InvalidHandle,
    /// The player you tried to disconnect has already been disconnected.
    PlayerDisconnected,
    /// You made an invalid request, usually by using wrong parameters for function calls or by
    /// calling an operation this session variant does not support.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// In a [`SyncTestSession`], this error is returned if checksums of resimulated frames do not match the original checksums.
    ///
    /// [`SyncTestSession`]: crate::SyncTestSession
    MismatchedChecksum {
        /// The frame at which the mismatch occurred.
        frame: Frame,
    },
    /// The spectator got so far behind the host that catching up is impossible.
    SpectatorTooFarBehind,
}

impl Display for RollnetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollnetError::NotSynchronized => {
                write!(
                    f,
                    "The session is not yet synchronized with all remote sessions."
                )
            }
            RollnetError::InRollback => {
                write!(
                    f,
                    "The requested operation is not allowed during a rollback."
                )
            }
            RollnetError::PredictionThreshold => {
                write!(
                    f,
                    "Prediction threshold is reached, cannot proceed without catching up."
                )
            }
            RollnetError::InvalidHandle => {
                write!(f, "The player handle you provided is invalid.")
            }
            RollnetError::PlayerDisconnected => {
                write!(f, "The player you are trying to disconnect is already disconnected.")
            }
            RollnetError::InvalidRequest { info } => {
                write!(f, "Invalid request: {}", info)
            }
            RollnetError::MismatchedChecksum { frame } => {
                write!(
                    f,
                    "Detected checksum mismatch during rollback on frame {}.",
                    frame
                )
            }
            RollnetError::SpectatorTooFarBehind => {
                write!(
                    f,
                    "The spectator got so far behind the host that catching up is impossible."
                )
            }
        }
    }
}

impl Error for RollnetError {}
