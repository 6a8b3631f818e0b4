//! Staged participants and their expiry timers.
//!
//! A staged participant holds the media of a dropped connection for the
//! grace window. Its [`ExpiryTimer`] is owned by the record: dropping the
//! record (restore, finalize, shutdown) cancels the timer, so a stale
//! expiry can never fire against a newer record. The generation check in
//! the channel actor covers the remaining race where the timer already
//! fired and its message is still queued.

use super::{ConnectionId, ParticipantMedia, StageReason};

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancelable handle to a pending finalize.
#[derive(Debug)]
pub struct ExpiryTimer {
    token: CancellationToken,
    generation: u64,
}

impl ExpiryTimer {
    /// Spawn a timer that runs `fire` after `grace` unless cancelled first.
    ///
    /// The timer token is a child of `parent`, so shutting down the owning
    /// channel cancels every pending expiry.
    pub fn arm<F>(parent: &CancellationToken, generation: u64, grace: Duration, fire: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = parent.child_token();
        let task_token = token.clone();

        tokio::spawn(async move {
            tokio::select! {
                () = task_token.cancelled() => {}
                () = tokio::time::sleep(grace) => fire.await,
            }
        });

        Self { token, generation }
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for ExpiryTimer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// A participant inside the grace window.
#[derive(Debug)]
pub struct StagedParticipant {
    pub user_id: String,
    /// Connection the media was detached from (latest one when merged).
    pub previous_connection: ConnectionId,
    pub media: ParticipantMedia,
    pub reason: StageReason,
    pub staged_at: Instant,
    timer: ExpiryTimer,
}

impl StagedParticipant {
    #[must_use]
    pub fn new(
        user_id: String,
        previous_connection: ConnectionId,
        media: ParticipantMedia,
        reason: StageReason,
        staged_at: Instant,
        timer: ExpiryTimer,
    ) -> Self {
        Self {
            user_id,
            previous_connection,
            media,
            reason,
            staged_at,
            timer,
        }
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.timer.generation()
    }

    /// Replace the pending timer. The old one is cancelled on drop.
    pub fn refresh(
        &mut self,
        previous_connection: ConnectionId,
        reason: StageReason,
        staged_at: Instant,
        timer: ExpiryTimer,
    ) {
        self.previous_connection = previous_connection;
        self.reason = reason;
        self.staged_at = staged_at;
        self.timer = timer;
    }

    /// Split into the media snapshot, cancelling the timer.
    #[must_use]
    pub fn into_media(self) -> ParticipantMedia {
        self.media
    }
}
