// Copyright 2026 The DSM Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Initial page ownership.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{NodeId, PageIndex};

/// How pages are owned before the first fault.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Placement {
    /// Node `i` owns `[floor(i / n * pages), floor((i + 1) / n * pages))`.
    #[default]
    RangeSplit,
    /// Node 0 owns every page; others start with nothing.
    SingleOwner,
}

/// Contiguous block of pages assigned to `node` when `num_pages` pages are divided among
/// `total_nodes` nodes.
pub fn range_split(node: NodeId, num_pages: usize, total_nodes: usize) -> Range<PageIndex> {
    let start = node * num_pages / total_nodes;
    let end = (node + 1) * num_pages / total_nodes;
    start..end
}

/// The node whose [`range_split`] block contains `page`.
pub fn range_split_owner(page: PageIndex, num_pages: usize, total_nodes: usize) -> NodeId {
    // Largest `i` such that `i * num_pages / total_nodes <= page`.
    ((page + 1) * total_nodes - 1) / num_pages
}

impl Placement {
    /// The node that owns `page` at startup.
    pub fn initial_owner(self, page: PageIndex, num_pages: usize, total_nodes: usize) -> NodeId {
        match self {
            Placement::RangeSplit => range_split_owner(page, num_pages, total_nodes),
            Placement::SingleOwner => 0,
        }
    }

    /// Pages `node` owns at startup, granted read/write.
    pub fn initial_pages(
        self,
        node: NodeId,
        num_pages: usize,
        total_nodes: usize,
    ) -> Range<PageIndex> {
        match self {
            Placement::RangeSplit => range_split(node, num_pages, total_nodes),
            Placement::SingleOwner if node == 0 => 0..num_pages,
            Placement::SingleOwner => 0..0,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_range_split() {
        assert_eq!(range_split(0, 4, 2), 0..2);
        assert_eq!(range_split(1, 4, 2), 2..4);
        assert_eq!(range_split(0, 3, 2), 0..1);
        assert_eq!(range_split(1, 3, 2), 1..3);
        // More nodes than pages leaves some nodes without pages.
        assert_eq!(range_split(0, 2, 3), 0..0);
        assert_eq!(range_split(1, 2, 3), 0..1);
        assert_eq!(range_split(2, 2, 3), 1..2);
    }

    #[test]
    fn test_single_owner() {
        assert_eq!(Placement::SingleOwner.initial_pages(0, 5, 3), 0..5);
        assert_eq!(Placement::SingleOwner.initial_pages(2, 5, 3), 0..0);
        for page in 0..5 {
            assert_eq!(Placement::SingleOwner.initial_owner(page, 5, 3), 0);
        }
    }

    proptest! {
        #[test]
        fn test_range_split_partitions_pages(num_pages in 1usize..512, total_nodes in 1usize..16) {
            let mut next = 0;
            for node in 0..total_nodes {
                let range = range_split(node, num_pages, total_nodes);
                prop_assert_eq!(range.start, next);
                for page in range.clone() {
                    prop_assert_eq!(range_split_owner(page, num_pages, total_nodes), node);
                }
                next = range.end;
            }
            prop_assert_eq!(next, num_pages);
        }
    }
}
