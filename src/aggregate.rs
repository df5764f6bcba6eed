/// Reaction tallies derived from the raw reaction set of one post
use crate::model::{Identity, Reaction, ReactionKind};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Display-ready reaction counts plus the viewer's own choice
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReactionTally {
    pub approve: u32,
    pub disapprove: u32,
    pub viewer_selection: Option<ReactionKind>,
}

impl ReactionTally {
    pub fn new(approve: u32, disapprove: u32, viewer_selection: Option<ReactionKind>) -> Self {
        Self {
            approve,
            disapprove,
            viewer_selection,
        }
    }

    pub fn count(&self, kind: ReactionKind) -> u32 {
        match kind {
            ReactionKind::Approve => self.approve,
            ReactionKind::Disapprove => self.disapprove,
        }
    }

    pub(crate) fn count_mut(&mut self, kind: ReactionKind) -> &mut u32 {
        match kind {
            ReactionKind::Approve => &mut self.approve,
            ReactionKind::Disapprove => &mut self.disapprove,
        }
    }
}

/// Fold the reaction set into a tally
///
/// The result does not depend on the order of `reactions`. When the viewer
/// holds more than one row (two devices racing), the row with the greatest
/// (created_at, kind) key is taken as the viewer's selection.
pub fn aggregate(reactions: &[Reaction], viewer: Option<&Identity>) -> ReactionTally {
    let mut tally = ReactionTally::default();
    let mut viewer_key: Option<(Option<DateTime<Utc>>, ReactionKind)> = None;

    for reaction in reactions {
        *tally.count_mut(reaction.kind) += 1;

        if viewer == Some(&reaction.user_id) {
            let key = (reaction.created_at, reaction.kind);
            if viewer_key.map_or(true, |current| key > current) {
                viewer_key = Some(key);
            }
        }
    }

    tally.viewer_selection = viewer_key.map(|(_, kind)| kind);
    tally
}
