// Copyright 2026 The DSM Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Programs run on every node of the cluster at once. They touch the shared region only through
//! ordinary loads and stores; coherence happens in the fault interceptor.

use std::sync::Barrier;

use clap::ValueEnum;
use dsm::config::ClusterConfig;
use dsm::placement::range_split;
use dsm::{Node, NodeId, PageIndex};

#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum WorkloadError {
    /// The workload needs {needed} pages but the region has {available}
    Capacity {
        /// Pages required.
        needed: usize,
        /// Pages reserved.
        available: usize,
    },
    /// Node {node} read {found:#x} from page {page}, expected {expected:#x}
    Stamp {
        /// Reading node.
        node: NodeId,
        /// Page read.
        page: PageIndex,
        /// Value written last.
        expected: u64,
        /// Value observed.
        found: u64,
    },
    /// C[{row}][{col}] is {found}, expected {expected}
    Product {
        /// Row of the wrong element.
        row: usize,
        /// Column of the wrong element.
        col: usize,
        /// Locally computed value.
        expected: i32,
        /// Value in the shared region.
        found: i32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Workload {
    /// Stamp, cross-read and overwrite every page from every node.
    Selfcheck,
    /// Distributed integer matrix multiplication.
    Matmul,
}

impl Workload {
    /// Checks that the region is large enough before any node starts.
    pub fn check(self, config: &ClusterConfig, dim: usize) -> Result<(), WorkloadError> {
        let needed = match self {
            Workload::Selfcheck => 1,
            Workload::Matmul => 3 * Matrices::pages_per_matrix(dim, dsm::utils::host_page_size()),
        };
        if needed > config.num_pages {
            return Err(WorkloadError::Capacity {
                needed,
                available: config.num_pages,
            });
        }
        Ok(())
    }

    /// Runs this workload as `node`. Every node of the cluster must call it.
    pub fn run(self, node: &Node, barrier: &Barrier, dim: usize) -> Result<(), WorkloadError> {
        match self {
            Workload::Selfcheck => selfcheck(node, barrier),
            Workload::Matmul => matmul(node, barrier, dim),
        }
    }
}

fn word_addr(node: &Node, byte_offset: usize) -> usize {
    node.region().base() + byte_offset
}

fn load_u64(node: &Node, page: PageIndex) -> u64 {
    let addr = word_addr(node, page * node.region().page_size());
    // SAFETY: The page is inside the node's region and faults on it are intercepted.
    unsafe { std::ptr::read_volatile(addr as *const u64) }
}

fn store_u64(node: &Node, page: PageIndex, value: u64) {
    let addr = word_addr(node, page * node.region().page_size());
    // SAFETY: See `load_u64`.
    unsafe { std::ptr::write_volatile(addr as *mut u64, value) }
}

fn stamp(writer: NodeId, page: PageIndex, round: usize) -> u64 {
    let [writer, page, round] = [writer, page, round].map(dsm::utils::usize_to_u64);
    (round << 48) | (writer << 32) | page
}

/// Every node stamps the pages it owns and all nodes verify every page; then each node in turn
/// overwrites every page while the others wait, and everyone verifies again.
fn selfcheck(node: &Node, barrier: &Barrier) -> Result<(), WorkloadError> {
    let cluster = &node.config().cluster;
    let (pages, nodes) = (cluster.num_pages, cluster.total_nodes);
    let mut first_error = None;
    let mut verify = |round: usize, writer: &dyn Fn(PageIndex) -> NodeId| {
        for page in 0..pages {
            let expected = stamp(writer(page), page, round);
            let found = load_u64(node, page);
            if found != expected && first_error.is_none() {
                first_error = Some(WorkloadError::Stamp {
                    node: node.id(),
                    page,
                    expected,
                    found,
                });
            }
        }
    };

    for page in cluster.placement.initial_pages(node.id(), pages, nodes) {
        store_u64(node, page, stamp(node.id(), page, 0));
    }
    barrier.wait();
    verify(0, &|page| cluster.placement.initial_owner(page, pages, nodes));
    barrier.wait();

    for writer in 0..nodes {
        if writer == node.id() {
            for page in 0..pages {
                store_u64(node, page, stamp(writer, page, writer + 1));
            }
        }
        barrier.wait();
        verify(writer + 1, &|_| writer);
        barrier.wait();
    }
    log::info!("Node {}: selfcheck over {} pages done", node.id(), pages);
    first_error.map_or(Ok(()), Err)
}

/// Square `i32` matrices A, B and C laid out page-aligned at the start of the region.
struct Matrices<'a> {
    node: &'a Node,
    dim: usize,
    stride: usize,
}

impl<'a> Matrices<'a> {
    fn pages_per_matrix(dim: usize, page_size: usize) -> usize {
        (dim * dim * size_of::<i32>()).div_ceil(page_size)
    }

    fn new(node: &'a Node, dim: usize) -> Self {
        let page_size = node.region().page_size();
        Matrices {
            node,
            dim,
            stride: Self::pages_per_matrix(dim, page_size) * page_size,
        }
    }

    fn addr(&self, matrix: usize, row: usize, col: usize) -> usize {
        word_addr(
            self.node,
            matrix * self.stride + (row * self.dim + col) * size_of::<i32>(),
        )
    }

    fn get(&self, matrix: usize, row: usize, col: usize) -> i32 {
        // SAFETY: The element lies inside the region, as checked by `Workload::check`.
        unsafe { std::ptr::read_volatile(self.addr(matrix, row, col) as *const i32) }
    }

    fn set(&self, matrix: usize, row: usize, col: usize, value: i32) {
        // SAFETY: See `get`.
        unsafe { std::ptr::write_volatile(self.addr(matrix, row, col) as *mut i32, value) }
    }
}

const A: usize = 0;
const B: usize = 1;
const C: usize = 2;

fn element_a(row: usize, col: usize) -> i32 {
    i32::try_from((row + col) % 7).unwrap_or_default()
}

fn element_b(row: usize, col: usize) -> i32 {
    i32::try_from((row * col) % 5 + 1).unwrap_or_default()
}

/// Node 0 fills A and B, every node computes its block of rows of C = A * B and node 0 checks
/// the result against a product computed in private memory.
fn matmul(node: &Node, barrier: &Barrier, dim: usize) -> Result<(), WorkloadError> {
    let matrices = Matrices::new(node, dim);
    if node.id() == 0 {
        for row in 0..dim {
            for col in 0..dim {
                matrices.set(A, row, col, element_a(row, col));
                matrices.set(B, row, col, element_b(row, col));
            }
        }
    }
    barrier.wait();

    let rows = range_split(node.id(), dim, node.config().cluster.total_nodes);
    log::info!("Node {}: computing rows {:?} of C", node.id(), rows);
    for row in rows {
        for col in 0..dim {
            let sum = (0..dim).fold(0i32, |sum, k| {
                sum.wrapping_add(matrices.get(A, row, k).wrapping_mul(matrices.get(B, k, col)))
            });
            matrices.set(C, row, col, sum);
        }
    }
    barrier.wait();

    if node.id() != 0 {
        return Ok(());
    }
    for row in 0..dim {
        for col in 0..dim {
            let expected = (0..dim).fold(0i32, |sum, k| {
                sum.wrapping_add(element_a(row, k).wrapping_mul(element_b(k, col)))
            });
            let found = matrices.get(C, row, col);
            if found != expected {
                return Err(WorkloadError::Product {
                    row,
                    col,
                    expected,
                    found,
                });
            }
        }
    }
    log::info!("Node 0: verified {dim}x{dim} product");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_is_unique() {
        assert_ne!(stamp(0, 1, 0), stamp(1, 0, 0));
        assert_ne!(stamp(1, 1, 1), stamp(1, 1, 2));
        assert_eq!(stamp(2, 5, 3), 0x0003_0002_0000_0005);
    }

    #[test]
    fn test_capacity() {
        let page_size = dsm::utils::host_page_size();
        let dim = 64;
        let per_matrix = Matrices::pages_per_matrix(dim, page_size);
        assert_eq!(per_matrix, (dim * dim * 4).div_ceil(page_size));

        let config = ClusterConfig::new(3 * per_matrix - 1, 2);
        assert!(matches!(
            Workload::Matmul.check(&config, dim),
            Err(WorkloadError::Capacity { .. })
        ));
        let config = ClusterConfig::new(3 * per_matrix, 2);
        Workload::Matmul.check(&config, dim).unwrap();
        Workload::Selfcheck.check(&config, dim).unwrap();
    }
}
