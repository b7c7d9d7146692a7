// Copyright 2026 The DSM Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Mutex;

use crate::{PageIndex, PageState};

/// What this node knows about one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LocalPage {
    pub state: PageState,
    /// Directory version of the last installed grant.
    pub version: u64,
    /// Highest directory transaction seen for this page.
    pub seen_seq: u64,
    /// Transaction of the latest accepted Invalidate.
    pub invalidated_at: u64,
    /// Transaction of the latest accepted Downgrade.
    pub downgraded_at: u64,
    /// The content left in the region was written here while owning `version`. Survives
    /// revocations, so a holder whose answer got lost can hand the content out again.
    pub writer: bool,
}

impl LocalPage {
    fn new(state: PageState) -> Self {
        LocalPage {
            state,
            version: 0,
            seen_seq: 0,
            invalidated_at: 0,
            downgraded_at: 0,
            writer: state == PageState::ExclusiveWrite,
        }
    }

    /// Whether a revocation issued by transaction `seq` is older than something already seen.
    pub fn is_stale(&self, seq: u64) -> bool {
        seq < self.seen_seq
    }

    /// Records a revocation down to `state` issued by transaction `seq`.
    pub fn revoke(&mut self, seq: u64, state: PageState) {
        self.seen_seq = self.seen_seq.max(seq);
        match state {
            PageState::Invalid => self.invalidated_at = self.invalidated_at.max(seq),
            PageState::SharedRead => self.downgraded_at = self.downgraded_at.max(seq),
            PageState::ExclusiveWrite => (),
        }
    }

    /// State a grant from transaction `seq` may install when it entitles `wanted`: revocations
    /// issued by later transactions win over it.
    pub fn admit(&mut self, seq: u64, wanted: PageState) -> PageState {
        self.seen_seq = self.seen_seq.max(seq);
        if self.invalidated_at > seq {
            PageState::Invalid
        } else if self.downgraded_at > seq {
            wanted.min(PageState::SharedRead)
        } else {
            wanted
        }
    }
}

#[derive(Debug)]
pub(crate) struct PageSlot {
    /// Held for the whole of a locally initiated transaction.
    pub txn: Mutex<()>,
    /// Held only briefly; remote revocations take this one alone.
    pub local: Mutex<LocalPage>,
}

#[derive(Debug)]
pub(crate) struct PageTable {
    slots: Box<[PageSlot]>,
}

impl PageTable {
    pub fn new(num_pages: usize, initial: impl Fn(PageIndex) -> PageState) -> Self {
        PageTable {
            slots: (0..num_pages)
                .map(|page| PageSlot {
                    txn: Mutex::new(()),
                    local: Mutex::new(LocalPage::new(initial(page))),
                })
                .collect(),
        }
    }

    pub fn slot(&self, page: PageIndex) -> Option<&PageSlot> {
        self.slots.get(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_without_revocation() {
        let mut page = LocalPage::new(PageState::Invalid);
        assert_eq!(page.admit(3, PageState::ExclusiveWrite), PageState::ExclusiveWrite);
        assert_eq!(page.seen_seq, 3);
        assert!(page.is_stale(2));
        assert!(!page.is_stale(3));
    }

    #[test]
    fn test_later_revocations_cap_grant() {
        let mut page = LocalPage::new(PageState::Invalid);
        page.revoke(5, PageState::SharedRead);
        assert_eq!(page.admit(4, PageState::ExclusiveWrite), PageState::SharedRead);
        assert_eq!(page.admit(4, PageState::SharedRead), PageState::SharedRead);

        page.revoke(6, PageState::Invalid);
        assert_eq!(page.admit(4, PageState::SharedRead), PageState::Invalid);
        // A grant issued after both revocations is unaffected.
        assert_eq!(page.admit(7, PageState::ExclusiveWrite), PageState::ExclusiveWrite);
    }

    #[test]
    fn test_earlier_revocations_do_not_cap_grant() {
        let mut page = LocalPage::new(PageState::SharedRead);
        page.revoke(2, PageState::Invalid);
        assert_eq!(page.admit(3, PageState::SharedRead), PageState::SharedRead);
    }
}
