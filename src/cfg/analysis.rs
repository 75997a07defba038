//! Graph analyses over a [`CfgNodePool`]: DFS ordering with back edge
//! detection, immediate (post-)dominators, dominance frontiers and a
//! reachability bitset.
//!
//! Loop back edges are taken out of the `succ`/`pred` lists while visiting
//! and parked in `succ_back_edge`/`pred_back_edge`, so everything else here
//! works on an acyclic graph.

use std::collections::VecDeque;

use hashbrown::HashSet;

use super::{node::NodeId, pool::CfgNodePool};
use crate::index::Index;

/// Clears all analysis state and rebuilds the edges from the terminators of
/// every node. Back edges come back as ordinary edges until the next visit.
pub fn reset_traversal(pool: &mut CfgNodePool) {
    pool.rebuild_edges();

    pool.for_each_node(|node| {
        node.immediate_dominator = None;
        node.immediate_post_dominator = None;
        node.forward_post_visit_order = None;
        node.backward_post_visit_order = None;
        node.traversing = false;
        node.dominance_frontier.clear();
    });
}

/// Depth first traversal from `entry`. Returns the nodes in post-visit order
/// and records loop back edges.
pub fn visit(pool: &mut CfgNodePool, entry: NodeId) -> Vec<NodeId> {
    let mut order = Vec::new();
    // (node, index of the next successor to look at)
    let mut stack = vec![(entry, 0)];

    pool.node_mut(entry).traversing = true;

    while let Some((id, next)) = stack.pop() {
        let succ = pool.node(id).succ.get(next).copied();

        let Some(target) = succ else {
            let node = pool.node_mut(id);
            node.traversing = false;
            node.forward_post_visit_order = Some(order.len());
            order.push(id);
            continue;
        };

        let target_node = pool.node(target);

        if target_node.traversing {
            // Back edge, park it and look at the same slot again
            if let Some(existing) = pool.node(id).succ_back_edge {
                panic!(
                    "node `{}` has a second back edge to `{}` (already has one to `{}`)",
                    pool.node(id).name,
                    pool.node(target).name,
                    pool.node(existing).name
                );
            }

            pool.remove_branch(id, target);
            pool.node_mut(id).succ_back_edge = Some(target);
            pool.node_mut(target).pred_back_edge = Some(id);
            stack.push((id, next));
            continue;
        }

        stack.push((id, next + 1));

        if !target_node.visited() {
            pool.node_mut(target).traversing = true;
            stack.push((target, 0));
        }
    }

    order
}

/// Every `(latch, header)` edge which targets a node still on the DFS stack.
/// Unlike [`visit`] this leaves the graph alone and allows one node to carry
/// several back edges.
pub fn find_back_edges(pool: &CfgNodePool, entry: NodeId) -> Vec<(NodeId, NodeId)> {
    let mut back_edges = Vec::new();
    let mut on_stack: HashSet<NodeId> = HashSet::from([entry]);
    let mut done = HashSet::new();
    let mut stack = vec![(entry, 0)];

    while let Some((id, next)) = stack.pop() {
        let Some(target) = pool.node(id).succ.get(next).copied() else {
            on_stack.remove(&id);
            done.insert(id);
            continue;
        };

        stack.push((id, next + 1));

        if on_stack.contains(&target) {
            back_edges.push((id, target));
        } else if !done.contains(&target) {
            on_stack.insert(target);
            stack.push((target, 0));
        }
    }

    back_edges
}

/// Post-visit order of the reversed graph, starting from a virtual exit that
/// every terminal node branches to
pub fn backwards_visit(pool: &mut CfgNodePool, forward_order: &[NodeId]) -> Vec<NodeId> {
    let mut order = Vec::new();
    let mut seen = HashSet::new();

    // Walk sinks in reverse post order so the result is deterministic
    let sinks = forward_order
        .iter()
        .rev()
        .copied()
        .filter(|id| pool.node(*id).succ.is_empty())
        .collect::<Vec<_>>();

    for sink in sinks {
        if !seen.insert(sink) {
            continue;
        }

        let mut stack = vec![(sink, 0)];

        while let Some((id, next)) = stack.pop() {
            match pool.node(id).pred.get(next).copied() {
                Some(pred) => {
                    stack.push((id, next + 1));

                    // Nodes the forward visit never reached stay out
                    if pool.node(pred).visited() && seen.insert(pred) {
                        stack.push((pred, 0));
                    }
                }
                None => {
                    pool.node_mut(id).backward_post_visit_order = Some(order.len());
                    order.push(id);
                }
            }
        }
    }

    order
}

/// Cooper, Harvey and Kennedy's iterative algorithm over reverse post order
pub fn build_immediate_dominators(pool: &mut CfgNodePool, entry: NodeId, forward_order: &[NodeId]) {
    let order_of = |pool: &CfgNodePool, id: NodeId| {
        pool.node(id)
            .forward_post_visit_order
            .expect("dominators are only computed for visited nodes")
    };

    let mut idom = vec![None; pool.capacity()];
    idom[entry.index()] = Some(entry);

    let intersect = |idom: &[Option<NodeId>], mut a: NodeId, mut b: NodeId| {
        while a != b {
            while order_of(pool, a) < order_of(pool, b) {
                a = idom[a.index()].expect("intersect only walks processed nodes");
            }
            while order_of(pool, b) < order_of(pool, a) {
                b = idom[b.index()].expect("intersect only walks processed nodes");
            }
        }
        a
    };

    let mut changed = true;

    while changed {
        changed = false;

        for id in forward_order.iter().rev().copied() {
            if id == entry {
                continue;
            }

            let mut new_idom = None;

            for pred in pool.node(id).pred.iter().copied() {
                if idom[pred.index()].is_none() {
                    continue;
                }

                new_idom = Some(match new_idom {
                    None => pred,
                    Some(current) => intersect(&idom, pred, current),
                });
            }

            if new_idom.is_some() && idom[id.index()] != new_idom {
                idom[id.index()] = new_idom;
                changed = true;
            }
        }
    }

    for id in forward_order {
        pool.node_mut(*id).immediate_dominator = if *id == entry {
            None
        } else {
            idom[id.index()]
        };
    }
}

/// Same as [`build_immediate_dominators`] on the reversed graph. A `None`
/// post-dominator stands for the virtual exit node.
pub fn build_immediate_post_dominators(pool: &mut CfgNodePool, backward_order: &[NodeId]) {
    // Positions in `backward_order`, the virtual exit sits right after the end
    let exit = backward_order.len();
    let position = |pool: &CfgNodePool, id: NodeId| {
        pool.node(id)
            .backward_post_visit_order
            .expect("post-dominators are only computed for visited nodes")
    };

    let mut ipdom = vec![None; exit + 1];
    ipdom[exit] = Some(exit);

    let intersect = |ipdom: &[Option<usize>], mut a: usize, mut b: usize| {
        while a != b {
            while a < b {
                a = ipdom[a].expect("intersect only walks processed nodes");
            }
            while b < a {
                b = ipdom[b].expect("intersect only walks processed nodes");
            }
        }
        a
    };

    let mut changed = true;

    while changed {
        changed = false;

        for id in backward_order.iter().rev().copied() {
            let node = pool.node(id);

            let successors = if node.succ.is_empty() {
                vec![exit]
            } else {
                node.succ.iter().map(|s| position(pool, *s)).collect()
            };

            let mut new_ipdom = None;

            for succ in successors {
                if ipdom[succ].is_none() {
                    continue;
                }

                new_ipdom = Some(match new_ipdom {
                    None => succ,
                    Some(current) => intersect(&ipdom, succ, current),
                });
            }

            let slot = position(pool, id);
            if new_ipdom.is_some() && ipdom[slot] != new_ipdom {
                ipdom[slot] = new_ipdom;
                changed = true;
            }
        }
    }

    for (slot, id) in backward_order.iter().enumerate() {
        pool.node_mut(*id).immediate_post_dominator = match ipdom[slot] {
            Some(p) if p != exit => Some(backward_order[p]),
            _ => None,
        };
    }
}

/// Cytron et al. Loop back edges count as incoming edges of the header.
pub fn compute_dominance_frontier(pool: &mut CfgNodePool, forward_order: &[NodeId]) {
    for id in forward_order.iter().copied() {
        let preds = pool.node(id).all_preds();

        if preds.len() < 2 {
            continue;
        }

        let idom = pool.node(id).immediate_dominator;

        for pred in preds {
            let mut runner = Some(pred);

            while let Some(current) = runner {
                if Some(current) == idom {
                    break;
                }

                let node = pool.node_mut(current);
                if !node.dominance_frontier.contains(&id) {
                    node.dominance_frontier.push(id);
                }

                runner = node.immediate_dominator;
            }
        }
    }
}

pub fn dominates(pool: &CfgNodePool, dominator: NodeId, node: NodeId) -> bool {
    let mut current = Some(node);

    while let Some(id) = current {
        if id == dominator {
            return true;
        }
        current = pool.node(id).immediate_dominator;
    }

    false
}

pub fn post_dominates(pool: &CfgNodePool, post_dominator: NodeId, node: NodeId) -> bool {
    let mut current = Some(node);

    while let Some(id) = current {
        if id == post_dominator {
            return true;
        }
        current = pool.node(id).immediate_post_dominator;
    }

    false
}

/// Nearest node dominating both `a` and `b`
pub fn find_common_dominator(pool: &CfgNodePool, a: NodeId, b: NodeId) -> NodeId {
    let mut ancestors = HashSet::new();
    let mut current = Some(a);

    while let Some(id) = current {
        ancestors.insert(id);
        current = pool.node(id).immediate_dominator;
    }

    let mut current = b;
    loop {
        if ancestors.contains(&current) {
            return current;
        }

        current = pool
            .node(current)
            .immediate_dominator
            .unwrap_or_else(|| panic!("`{}` is not dominated by the entry", pool.node(b).name));
    }
}

/// Nearest node post-dominating every candidate. `None` if only the virtual
/// exit does.
pub fn find_common_post_dominator(pool: &CfgNodePool, candidates: &[NodeId]) -> Option<NodeId> {
    let (first, rest) = candidates.split_first()?;
    let mut common = *first;

    for candidate in rest {
        let mut ancestors = HashSet::new();
        let mut current = Some(common);

        while let Some(id) = current {
            ancestors.insert(id);
            current = pool.node(id).immediate_post_dominator;
        }

        let mut current = Some(*candidate);
        loop {
            match current {
                Some(id) if ancestors.contains(&id) => {
                    common = id;
                    break;
                }
                Some(id) => current = pool.node(id).immediate_post_dominator,
                None => return None,
            }
        }
    }

    Some(common)
}

/// Transitive closure of the forward graph, one bit row per node
#[derive(Debug, Default, Clone)]
pub struct Reachability {
    stride: usize,
    bits: Vec<u64>,
}

impl Reachability {
    pub fn build(pool: &CfgNodePool, forward_order: &[NodeId]) -> Self {
        let stride = pool.capacity().div_ceil(64);
        let mut reachability = Self {
            stride,
            bits: vec![0; stride * pool.capacity()],
        };

        // Successors come before their predecessors in post order
        for id in forward_order.iter().copied() {
            reachability.set(id, id);

            for succ in pool.node(id).succ.iter().copied() {
                let (row, succ_row) = (id.index() * stride, succ.index() * stride);

                for word in 0..stride {
                    reachability.bits[row + word] |= reachability.bits[succ_row + word];
                }
            }
        }

        reachability
    }

    fn set(&mut self, from: NodeId, to: NodeId) {
        let word = from.index() * self.stride + to.index() / 64;
        self.bits[word] |= 1 << (to.index() % 64);
    }

    /// Whether `to` can be reached from `from` without taking a back edge
    pub fn query(&self, from: NodeId, to: NodeId) -> bool {
        if from == to {
            return true;
        }

        let word = from.index() * self.stride + to.index() / 64;
        self.bits
            .get(word)
            .is_some_and(|bits| bits & (1 << (to.index() % 64)) != 0)
    }
}

/// Breadth first search over the forward graph from `start`, never passing
/// through `stop` (which may still be the destination)
fn search(
    pool: &CfgNodePool,
    start: NodeId,
    through_back_edges: bool,
    stop: Option<NodeId>,
    mut found: impl FnMut(NodeId) -> bool,
) -> bool {
    let mut queue = VecDeque::from([start]);
    let mut seen: HashSet<NodeId> = HashSet::from([start]);

    while let Some(id) = queue.pop_front() {
        let node = pool.node(id);
        let succs = if through_back_edges {
            node.all_succs()
        } else {
            node.succ.clone()
        };

        for succ in succs {
            if found(succ) {
                return true;
            }

            if Some(succ) != stop && seen.insert(succ) {
                queue.push_back(succ);
            }
        }
    }

    false
}

/// Reachability where loop back edges may be taken as well
pub fn query_reachability_through_back_edges(pool: &CfgNodePool, from: NodeId, to: NodeId) -> bool {
    from == to || search(pool, from, true, None, |id| id == to)
}

/// Reachability over paths which do not pass through the loop header
/// `end_node`
pub fn query_reachability_split_loop_header(
    pool: &CfgNodePool,
    from: NodeId,
    to: NodeId,
    end_node: NodeId,
) -> bool {
    if from == to {
        return true;
    }

    if from == end_node {
        return false;
    }

    search(pool, from, true, Some(end_node), |id| id == to)
}

/// Whether `end_block` can be reached from `start_block` over a path that
/// does not contain `stop_block` other than as its final node
pub fn exists_path_in_cfg_without_intermediate_node(
    pool: &CfgNodePool,
    start_block: NodeId,
    end_block: NodeId,
    stop_block: NodeId,
) -> bool {
    if start_block == stop_block {
        return false;
    }

    if start_block == end_block {
        return true;
    }

    search(pool, start_block, false, Some(stop_block), |id| id == end_block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cfg::node::{Terminator, TerminatorKind},
        lir::{BlockId, Operand},
    };

    /// Builds a pool from `(node, successors)` pairs, node 0 is the entry
    fn graph(edges: &[&[usize]]) -> (CfgNodePool, Vec<NodeId>) {
        let mut pool = CfgNodePool::new();
        let ids = (0..edges.len())
            .map(|n| pool.create_node(format!("n{n}"), BlockId::new(n)))
            .collect::<Vec<_>>();

        for (from, succs) in edges.iter().enumerate() {
            pool.node_mut(ids[from]).ir.terminator = match succs {
                [] => Terminator::Return { value: None },
                [target] => Terminator::Branch {
                    target: ids[*target],
                },
                [a, b] => Terminator::Condition {
                    condition: Operand::UNDEF,
                    true_block: ids[*a],
                    false_block: ids[*b],
                },
                _ => unreachable!(),
            };
        }

        reset_traversal(&mut pool);
        (pool, ids)
    }

    fn analyze(pool: &mut CfgNodePool, entry: NodeId) -> (Vec<NodeId>, Reachability) {
        let forward = visit(pool, entry);
        let backward = backwards_visit(pool, &forward);
        build_immediate_dominators(pool, entry, &forward);
        build_immediate_post_dominators(pool, &backward);
        compute_dominance_frontier(pool, &forward);
        let reachability = Reachability::build(pool, &forward);
        (forward, reachability)
    }

    #[test]
    fn diamond_dominators() {
        // 0 -> {1, 2} -> 3
        let (mut pool, n) = graph(&[&[1, 2], &[3], &[3], &[]]);
        analyze(&mut pool, n[0]);

        assert_eq!(pool.node(n[3]).immediate_dominator, Some(n[0]));
        assert_eq!(pool.node(n[0]).immediate_post_dominator, Some(n[3]));
        assert_eq!(pool.node(n[3]).immediate_post_dominator, None);
        assert_eq!(pool.node(n[1]).dominance_frontier, vec![n[3]]);
        assert_eq!(find_common_post_dominator(&pool, &[n[1], n[2]]), Some(n[3]));
        assert_eq!(find_common_dominator(&pool, n[1], n[2]), n[0]);
    }

    #[test]
    fn loop_back_edge_is_parked() {
        // 0 -> 1 -> 2 -> {1, 3}
        let (mut pool, n) = graph(&[&[1], &[2], &[1, 3], &[]]);
        let (_, reachability) = analyze(&mut pool, n[0]);

        assert_eq!(pool.node(n[2]).succ_back_edge, Some(n[1]));
        assert_eq!(pool.node(n[1]).pred_back_edge, Some(n[2]));
        assert_eq!(pool.node(n[2]).succ, vec![n[3]]);
        assert!(pool.node(n[1]).dominance_frontier.contains(&n[1]));

        assert!(reachability.query(n[1], n[3]));
        assert!(!reachability.query(n[2], n[1]));
        assert!(query_reachability_through_back_edges(&pool, n[2], n[1]));
        assert!(query_reachability_split_loop_header(&pool, n[2], n[1], n[1]));
        assert!(!query_reachability_split_loop_header(&pool, n[0], n[3], n[1]));
    }

    #[test]
    fn back_edges_found_without_touching_edges() {
        // 0 -> 1 -> 2 -> {1, 0}, so node 2 closes two loops at once
        let (pool, n) = graph(&[&[1], &[2], &[1, 0]]);

        let mut back_edges = find_back_edges(&pool, n[0]);
        back_edges.sort();

        assert_eq!(back_edges, vec![(n[2], n[0]), (n[2], n[1])]);
        assert_eq!(pool.node(n[2]).succ, vec![n[1], n[0]]);
    }

    #[test]
    fn reachability_matches_paths() {
        // 0 -> {1, 2}, 1 -> 3, 2 -> 4 (return), 3 returns
        let (mut pool, n) = graph(&[&[1, 2], &[3], &[4], &[], &[]]);
        let (_, reachability) = analyze(&mut pool, n[0]);

        assert!(reachability.query(n[0], n[4]));
        assert!(reachability.query(n[1], n[3]));
        assert!(!reachability.query(n[1], n[4]));
        assert!(!reachability.query(n[3], n[0]));
        assert_eq!(find_common_post_dominator(&pool, &[n[3], n[4]]), None);
    }

    #[test]
    fn paths_avoiding_a_node() {
        // 0 -> {1, 2}, 1 -> 2, 2 returns
        let (mut pool, n) = graph(&[&[1, 2], &[2], &[]]);
        analyze(&mut pool, n[0]);

        assert!(exists_path_in_cfg_without_intermediate_node(&pool, n[0], n[2], n[1]));
        assert!(!exists_path_in_cfg_without_intermediate_node(&pool, n[1], n[2], n[1]));
        assert!(exists_path_in_cfg_without_intermediate_node(&pool, n[1], n[2], n[2]));
        assert_eq!(pool.node(n[2]).ir.terminator.kind(), TerminatorKind::Return);
    }
}
