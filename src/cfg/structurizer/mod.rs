//! Rewrites the CFG of one function until every branch and loop has a
//! single, unambiguous merge point.
//!
//! Every pass recomputes all analyses, classifies loops and selections and
//! then runs the rewriting stages in order. A stage that changes the graph
//! ends the pass, the next one starts over on fresh analyses. Once a pass
//! goes through without changes the merge classification of every node is
//! final and the PHIs are repaired for the new shape of the graph.

use hashbrown::{HashMap, HashSet};
use itertools::Itertools;
use log::{debug, info, log_enabled, trace};

use super::{
    analysis::{
        Reachability, backwards_visit, build_immediate_dominators, build_immediate_post_dominators,
        compute_dominance_frontier, dominates, reset_traversal, visit,
    },
    node::{NodeId, Terminator},
    pool::CfgNodePool,
};
use crate::{config::StructurizerOptions, error::CfgError, lir::Function};

mod cleanup;
mod duplicate;
mod ladder;
mod loops;
mod phi;
mod selection;

/// A natural loop found in the current pass
#[derive(Debug, Clone)]
struct LoopInfo {
    header: NodeId,
    /// Source of the only back edge, doubles as the continue block
    latch: NodeId,
    body: HashSet<NodeId>,
    merge: Option<NodeId>,
    /// Exit edges without a usable common merge, funnelled through a selector
    /// ladder unless a transposed inner loop is fixed first
    exit_ladder: Vec<(NodeId, NodeId)>,
}

/// Where a helper block goes in the function layout
#[derive(Debug, Clone, Copy)]
enum Placement {
    Before(NodeId),
    After(NodeId),
}

pub struct Structurizer<'a> {
    function: &'a mut Function,
    pool: &'a mut CfgNodePool,
    entry: NodeId,
    options: &'a StructurizerOptions,

    forward_post_visit_order: Vec<NodeId>,
    backward_post_visit_order: Vec<NodeId>,
    reachability: Reachability,

    loops: Vec<LoopInfo>,
    /// Index into `loops` of the innermost loop containing a node
    innermost_loop: HashMap<NodeId, usize>,
    /// Nodes rewritten during the current pass. Constructs touching them are
    /// left for the next pass, when the analyses are up to date again.
    touched: HashSet<NodeId>,
}

impl<'a> Structurizer<'a> {
    pub fn new(
        function: &'a mut Function,
        pool: &'a mut CfgNodePool,
        entry: NodeId,
        options: &'a StructurizerOptions,
    ) -> Self {
        Self {
            function,
            pool,
            entry,
            options,
            forward_post_visit_order: Vec::new(),
            backward_post_visit_order: Vec::new(),
            reachability: Reachability::default(),
            loops: Vec::new(),
            innermost_loop: HashMap::new(),
            touched: HashSet::new(),
        }
    }

    /// Structurizes the pool in place and returns the (possibly new) entry
    /// node
    pub fn run(mut self) -> Result<NodeId, CfgError> {
        self.rewrite_multiple_back_edges();
        self.recompute_cfg();

        if !self.pool.node(self.entry).all_preds().is_empty() {
            self.create_entry_helper();
            self.recompute_cfg();
        }

        if self.prune_dead_preds() {
            self.recompute_cfg();
        }

        if self.eliminate_degenerate_blocks() {
            self.recompute_cfg();
        }

        self.find_loop_bodies()?;
        if self.duplicate_impossible_merge_constructs() {
            self.recompute_cfg();
        }

        self.log_cfg("before structurizing");

        let mut passes = 0;

        loop {
            if passes == self.options.max_passes {
                return Err(CfgError::NoConvergence { passes });
            }

            passes += 1;

            if !self.structurize(passes)? {
                break;
            }

            self.log_cfg(&format!("after pass {passes}"));
        }

        info!(
            "structurized `{}` in {passes} passes ({} nodes)",
            self.function.name,
            self.pool.len()
        );

        self.insert_phis();
        self.fixup_broken_value_dominance();

        self.log_cfg("after structurizing");

        Ok(self.entry)
    }

    /// One pass. Returns whether the graph was changed.
    fn structurize(&mut self, pass: usize) -> Result<bool, CfgError> {
        debug!("structurizer pass {pass} on `{}`", self.function.name);

        self.recompute_cfg();
        self.touched.clear();
        self.pool.for_each_node(|node| node.reset_merge_classification());

        if self.find_loops()? {
            return Ok(true);
        }

        if self.rewrite_transposed_loops() {
            return Ok(true);
        }

        if self.create_loop_exit_ladders() {
            return Ok(true);
        }

        if self.find_switch_blocks() {
            return Ok(true);
        }

        self.find_selection_merges();

        if self.fixup_broken_selection_merges() {
            return Ok(true);
        }

        Ok(self.split_merge_blocks())
    }

    fn recompute_cfg(&mut self) {
        reset_traversal(self.pool);

        self.forward_post_visit_order = visit(self.pool, self.entry);
        self.backward_post_visit_order = backwards_visit(self.pool, &self.forward_post_visit_order);

        build_immediate_dominators(self.pool, self.entry, &self.forward_post_visit_order);
        build_immediate_post_dominators(self.pool, &self.backward_post_visit_order);
        compute_dominance_frontier(self.pool, &self.forward_post_visit_order);

        self.reachability = Reachability::build(self.pool, &self.forward_post_visit_order);
    }

    /// Visited nodes in reverse post order, so every node comes before its
    /// successors
    fn reverse_post_order(&self) -> Vec<NodeId> {
        self.forward_post_visit_order.iter().rev().copied().collect()
    }

    fn post_order(&self, id: NodeId) -> usize {
        self.pool
            .node(id)
            .forward_post_visit_order
            .unwrap_or_else(|| panic!("node `{}` was not visited", self.pool.node(id).name))
    }

    fn dominates(&self, dominator: NodeId, node: NodeId) -> bool {
        dominates(self.pool, dominator, node)
    }

    /// Whether `start` and everything reachable from it is dominated by
    /// `header`. Such a region can only end the function.
    fn dominated_region(&self, header: NodeId, start: NodeId) -> bool {
        self.dominates(header, start)
            && self
                .forward_post_visit_order
                .iter()
                .filter(|id| self.reachability.query(start, **id))
                .all(|id| self.dominates(header, *id))
    }

    /// Loops containing `id`, innermost last
    fn enclosing_loops(&self, id: NodeId) -> impl Iterator<Item = &LoopInfo> + '_ {
        self.loops.iter().filter(move |info| info.body.contains(&id))
    }

    fn innermost_loop(&self, id: NodeId) -> Option<&LoopInfo> {
        self.innermost_loop.get(&id).map(|index| &self.loops[*index])
    }

    fn is_touched(&self, nodes: &[NodeId]) -> bool {
        nodes.iter().any(|id| self.touched.contains(id))
    }

    /// A node with a fresh block of its own
    fn create_helper_node(&mut self, name: &str, placement: Placement, terminator: Terminator) -> NodeId {
        let block = match placement {
            Placement::Before(node) => self
                .function
                .create_block_before(name, self.pool.node(node).block),
            Placement::After(node) => self
                .function
                .create_block_after(name, self.pool.node(node).block),
        };

        let id = self.pool.create_node(self.function.block_name(block), block);

        for target in terminator.targets() {
            self.pool.add_branch(id, target);
        }

        self.pool.node_mut(id).ir.terminator = terminator;
        self.touched.insert(id);

        trace!("created helper node `{}`", self.pool.node(id).name);

        id
    }

    /// The entry block may not be a loop header, so a new entry jumping to
    /// the old one is put in front of it
    fn create_entry_helper(&mut self) {
        let entry = self.entry;
        let name = format!("{}.pred", self.pool.node(entry).name);

        self.entry = self.create_helper_node(&name, Placement::Before(entry), Terminator::Branch { target: entry });

        debug!("entry `{}` is a loop header, added `{name}`", self.pool.node(entry).name);
    }

    fn log_cfg(&self, tag: &str) {
        if !log_enabled!(log::Level::Trace) {
            return;
        }

        trace!("cfg of `{}` {tag}:", self.function.name);

        let name = |id: &NodeId| self.pool.node(*id).name.clone();

        for id in self.reverse_post_order() {
            let node = self.pool.node(id);

            trace!(
                "  {} ({}) -> [{}]{}{}",
                node.name,
                node.merge,
                node.succ.iter().map(name).join(", "),
                node.succ_back_edge
                    .map(|target| format!(" back to {}", name(&target)))
                    .unwrap_or_default(),
                node.selection_merge_block
                    .or(node.ir.merge_info.merge_block)
                    .map(|merge| format!(" merges at {}", name(&merge)))
                    .unwrap_or_default(),
            );
        }
    }
}
