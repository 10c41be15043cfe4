//! Reaction to credential changes.
//!
//! The credential provider is opaque; all the client sees is a stream of
//! [`AuthState`] values. Each change is classified into a
//! [`SessionTransition`] which the client then applies.

use stoop_core::{AuthState, Identity};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::client::WeakSyncClient;

/// What a change in authentication state requires of the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTransition {
    /// Nothing to do.
    Unchanged,
    /// A user signed in from the signed-out state.
    SignedIn(Identity),
    /// Same user, new credentials.
    Refreshed,
    /// A different user took over the session.
    SwitchedUser(Identity),
    /// The session ended.
    SignedOut,
}

/// Classify the change from `previous` to `next`.
pub fn classify(previous: &AuthState, next: &AuthState) -> SessionTransition {
    match (previous, next) {
        (AuthState::SignedOut, AuthState::SignedOut) => SessionTransition::Unchanged,
        (AuthState::SignedOut, AuthState::SignedIn(identity)) => {
            SessionTransition::SignedIn(identity.clone())
        }
        (AuthState::SignedIn(_), AuthState::SignedOut) => SessionTransition::SignedOut,
        (AuthState::SignedIn(before), AuthState::SignedIn(after)) => {
            if before.user_id == after.user_id {
                SessionTransition::Refreshed
            } else {
                SessionTransition::SwitchedUser(after.clone())
            }
        }
    }
}

/// Follow `auth_rx` from `previous` and apply every transition to the client.
///
/// Stops on shutdown, when the provider goes away, or when the client has
/// been dropped.
pub(crate) fn spawn_session_watcher(
    client: WeakSyncClient,
    mut previous: AuthState,
    mut auth_rx: watch::Receiver<AuthState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                changed = auth_rx.changed() => {
                    if changed.is_err() {
                        tracing::debug!("Credential provider closed");
                        break;
                    }
                    let next = auth_rx.borrow_and_update().clone();
                    let transition = classify(&previous, &next);
                    previous = next;

                    let Some(client) = client.upgrade() else {
                        break;
                    };
                    client.apply_session(transition).await;
                }
            }
        }
        tracing::debug!("Session watcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoop_core::UserId;

    fn identity() -> Identity {
        Identity::new(UserId::now_v7())
    }

    #[test]
    fn test_classify_transitions() {
        let ana = identity();
        let ben = identity();
        let signed_in = |i: &Identity| AuthState::SignedIn(i.clone());

        assert_eq!(
            classify(&AuthState::SignedOut, &AuthState::SignedOut),
            SessionTransition::Unchanged
        );
        assert_eq!(
            classify(&AuthState::SignedOut, &signed_in(&ana)),
            SessionTransition::SignedIn(ana.clone())
        );
        assert_eq!(
            classify(&signed_in(&ana), &signed_in(&ana)),
            SessionTransition::Refreshed
        );
        assert_eq!(
            classify(&signed_in(&ana), &signed_in(&ben)),
            SessionTransition::SwitchedUser(ben.clone())
        );
        assert_eq!(
            classify(&signed_in(&ana), &AuthState::SignedOut),
            SessionTransition::SignedOut
        );
    }
}
