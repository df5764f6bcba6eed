/// Optimistic reaction updates
///
/// A reaction is applied to the local tally at once, then written to the
/// store. While the write is in flight and for a short cooldown after it
/// settles, further reactions on the same control are ignored. A rejected
/// write restores the tally captured before the optimistic change.
use crate::{
    aggregate::ReactionTally,
    backend::{DataStore, Filter},
    error::{WallError, WallResult},
    model::{collections, Identity, ReactionKind, Session},
};
use serde_json::json;
use tracing::{debug, warn};

/// Per-control mutation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionState {
    Idle,
    Pending {
        /// Tally to restore if the write fails
        snapshot: ReactionTally,
        /// The remote write has completed (either way)
        settled: bool,
    },
}

/// Local effect of reacting with `kind`
///
/// Reacting with the current selection clears it; reacting with the other
/// kind moves the viewer's vote. Counts never drop below zero.
pub fn apply_toggle(current: ReactionTally, kind: ReactionKind) -> ReactionTally {
    let mut next = current;
    match current.viewer_selection {
        Some(held) if held == kind => {
            let count = next.count_mut(kind);
            *count = count.saturating_sub(1);
            next.viewer_selection = None;
        }
        held => {
            *next.count_mut(kind) += 1;
            if let Some(held) = held {
                let count = next.count_mut(held);
                *count = count.saturating_sub(1);
            }
            next.viewer_selection = Some(kind);
        }
    }
    next
}

/// Replace the viewer's contribution in `remote` with `selection`
fn rebase(remote: ReactionTally, selection: Option<ReactionKind>) -> ReactionTally {
    let mut merged = remote;
    if let Some(held) = remote.viewer_selection {
        let count = merged.count_mut(held);
        *count = count.saturating_sub(1);
    }
    if let Some(kind) = selection {
        *merged.count_mut(kind) += 1;
    }
    merged.viewer_selection = selection;
    merged
}

/// Remote write equivalent to one reaction toggle
///
/// The store keeps no uniqueness constraint on (post, user), so the write
/// deletes every existing row of the pair and then inserts the new one, if
/// any. Two devices racing may interleave; the last pair to run wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionWrite {
    pub post_id: Identity,
    pub user_id: Identity,
    pub selection: Option<ReactionKind>,
}

impl ReactionWrite {
    pub fn plan(post_id: Identity, user_id: Identity, selection: Option<ReactionKind>) -> Self {
        Self {
            post_id,
            user_id,
            selection,
        }
    }

    pub async fn execute(&self, store: &dyn DataStore) -> WallResult<()> {
        store
            .delete(
                collections::REACTIONS,
                &[
                    Filter::eq("post_id", &self.post_id),
                    Filter::eq("user_id", &self.user_id),
                ],
            )
            .await
            .map_err(WallError::into_persistence)?;

        if let Some(kind) = self.selection {
            store
                .insert(
                    collections::REACTIONS,
                    json!({
                        "post_id": self.post_id,
                        "user_id": self.user_id,
                        "type": kind,
                    }),
                )
                .await
                .map_err(WallError::into_persistence)?;
        }
        Ok(())
    }
}

/// Reaction control of one post for the current viewer
#[derive(Debug, Clone)]
pub struct ReactionController {
    post_id: Identity,
    tally: ReactionTally,
    state: ReactionState,
}

impl ReactionController {
    pub fn new(post_id: Identity) -> Self {
        Self {
            post_id,
            tally: ReactionTally::default(),
            state: ReactionState::Idle,
        }
    }

    pub fn tally(&self) -> ReactionTally {
        self.tally
    }

    pub fn state(&self) -> ReactionState {
        self.state
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, ReactionState::Pending { .. })
    }

    /// Start a reaction
    ///
    /// Without a session nothing changes and `AuthRequired` is returned,
    /// pending or not. Otherwise returns the write to issue, or `None` when
    /// a previous reaction is still pending.
    pub fn begin(
        &mut self,
        session: Option<&Session>,
        kind: ReactionKind,
    ) -> WallResult<Option<ReactionWrite>> {
        let Some(session) = session else {
            return Err(WallError::AuthRequired(
                "Please sign in to react.".to_string(),
            ));
        };
        if self.is_pending() {
            debug!("Reaction on post {} ignored while pending", self.post_id);
            return Ok(None);
        }

        let snapshot = self.tally;
        self.tally = apply_toggle(snapshot, kind);
        self.state = ReactionState::Pending {
            snapshot,
            settled: false,
        };

        Ok(Some(ReactionWrite::plan(
            self.post_id.clone(),
            session.user_id().clone(),
            self.tally.viewer_selection,
        )))
    }

    /// Record the outcome of the write issued by `begin`
    pub fn settle(&mut self, outcome: &WallResult<()>) {
        let ReactionState::Pending { snapshot, .. } = self.state else {
            return;
        };
        if let Err(e) = outcome {
            warn!("Reaction on post {} rolled back: {}", self.post_id, e);
            self.tally = snapshot;
        }
        self.state = ReactionState::Pending {
            snapshot,
            settled: true,
        };
    }

    pub fn cooldown_elapsed(&mut self) {
        self.state = ReactionState::Idle;
    }

    /// Merge a tally recomputed from the store
    ///
    /// While idle the remote tally wins outright. While pending, other
    /// users' reactions come from the remote tally and the viewer's own vote
    /// stays the optimistic one; the rollback snapshot is rebased the same
    /// way so a later rollback keeps other users' changes.
    pub fn apply_remote(&mut self, remote: ReactionTally) {
        match self.state {
            ReactionState::Idle => self.tally = remote,
            ReactionState::Pending { snapshot, settled } => {
                self.tally = rebase(remote, self.tally.viewer_selection);
                self.state = ReactionState::Pending {
                    snapshot: rebase(remote, snapshot.viewer_selection),
                    settled,
                };
            }
        }
    }
}
