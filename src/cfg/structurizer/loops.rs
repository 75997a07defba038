use std::cmp::Reverse;

use hashbrown::HashSet;
use itertools::Itertools;
use log::debug;
use strum::Display;

use super::{LoopInfo, Placement, Structurizer};
use crate::{
    cfg::{
        analysis::{
            find_back_edges, find_common_post_dominator, query_reachability_split_loop_header, reset_traversal,
        },
        node::{MergeInfo, MergeType, NodeId, Terminator, TerminatorKind},
    },
    error::CfgError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
enum ExitKind {
    /// Leaves straight from the header
    Direct,
    /// Leaves from the header of a nested loop
    InnerDirect,
    /// Ends the function in a region only this loop reaches
    Dominated,
    /// Same as [`ExitKind::Dominated`], taken from inside a nested loop
    InnerDominated,
    /// Target is reachable without going through the loop
    NonDominated,
    /// Continues an enclosing loop
    DominatedContinue,
    /// Any other edge leaving the loop body
    Body,
}

#[derive(Debug, Clone, Copy)]
struct LoopExit {
    from: NodeId,
    target: NodeId,
    kind: ExitKind,
}

impl LoopExit {
    fn is_terminal(&self) -> bool {
        matches!(self.kind, ExitKind::Dominated | ExitKind::InnerDominated)
    }
}

enum LoopMerge {
    Merge(Option<NodeId>),
    /// The exits have no usable common merge and need a selector ladder
    Ladder(Vec<(NodeId, NodeId)>),
}

impl Structurizer<'_> {
    /// Gives every header a single back edge coming from a latch with no
    /// other successor. Headers with several latches, or latches which also
    /// branch elsewhere, get a dedicated continue node all back edges go
    /// through.
    pub(super) fn rewrite_multiple_back_edges(&mut self) -> bool {
        reset_traversal(self.pool);

        let mut latches: Vec<(NodeId, Vec<NodeId>)> = Vec::new();

        for (latch, header) in find_back_edges(self.pool, self.entry) {
            match latches.iter_mut().find(|(h, _)| *h == header) {
                Some((_, existing)) => existing.push(latch),
                None => latches.push((header, vec![latch])),
            }
        }

        let mut changed = false;

        for (header, latches) in latches {
            let needs_continue =
                latches.len() > 1 || latches.iter().any(|latch| self.pool.node(*latch).succ.len() > 1);

            if !needs_continue {
                continue;
            }

            let Some(last) = latches.last().copied() else {
                continue;
            };

            let name = format!("{}.continue", self.pool.node(header).name);
            let continue_node =
                self.create_helper_node(&name, Placement::After(last), Terminator::Branch { target: header });

            for latch in &latches {
                self.pool.retarget_branch(*latch, header, continue_node);
            }

            debug!(
                "routed {} back edge(s) of `{}` through `{}`",
                latches.len(),
                self.pool.node(header).name,
                self.pool.node(continue_node).name
            );

            changed = true;
        }

        changed
    }

    /// Finds every natural loop of the current graph, outermost first
    pub(super) fn find_loop_bodies(&mut self) -> Result<(), CfgError> {
        self.loops.clear();
        self.innermost_loop.clear();

        for header in self.reverse_post_order() {
            let Some(latch) = self.pool.node(header).pred_back_edge else {
                continue;
            };

            if !self.dominates(header, latch) {
                return Err(CfgError::IrreducibleLoop {
                    header: self.pool.node(header).name.clone(),
                    latch: self.pool.node(latch).name.clone(),
                });
            }

            let body = self.natural_loop_body(header, latch);

            self.loops.push(LoopInfo {
                header,
                latch,
                body,
                merge: None,
                exit_ladder: Vec::new(),
            });
        }

        // Nested loops come after the loops around them
        for (index, info) in self.loops.iter().enumerate() {
            for node in &info.body {
                self.innermost_loop.insert(*node, index);
            }
        }

        Ok(())
    }

    /// Everything that reaches the latch without passing the header
    fn natural_loop_body(&self, header: NodeId, latch: NodeId) -> HashSet<NodeId> {
        let mut body = HashSet::from([header, latch]);
        let mut stack = vec![latch];

        while let Some(id) = stack.pop() {
            if id == header {
                continue;
            }

            for pred in self.pool.node(id).all_preds() {
                if self.pool.node(pred).visited() && body.insert(pred) {
                    stack.push(pred);
                }
            }
        }

        body
    }

    /// Classifies every loop and gives it a merge block. Loops whose exits
    /// can't share one get their exit edges recorded for
    /// [`Self::create_loop_exit_ladders`]. Returns whether the graph changed.
    pub(super) fn find_loops(&mut self) -> Result<bool, CfgError> {
        self.find_loop_bodies()?;

        let mut changed = false;

        for index in 0..self.loops.len() {
            let header = self.loops[index].header;

            if self.is_touched(&[header]) || self.loops[index].body.iter().any(|id| self.touched.contains(id)) {
                continue;
            }

            if self.pool.node(header).ir.terminator.kind() == TerminatorKind::Switch {
                self.split_switch_header(header);
                changed = true;
                continue;
            }

            let exits = self.analyze_loop(index);

            if exits.iter().any(|exit| self.touched.contains(&exit.target)) {
                continue;
            }

            match self.analyze_loop_merge(index, &exits) {
                LoopMerge::Merge(merge) => self.loops[index].merge = merge,
                LoopMerge::Ladder(edges) => self.loops[index].exit_ladder = edges,
            }
        }

        for info in &self.loops {
            let node = self.pool.node_mut(info.header);

            node.merge = MergeType::Loop;
            node.ir.merge_info = MergeInfo {
                merge_block: info.merge,
                continue_block: Some(info.latch),
            };
        }

        Ok(changed)
    }

    /// Funnels the exits of every loop without a common merge through a
    /// selector ladder, which becomes the merge on the next pass
    pub(super) fn create_loop_exit_ladders(&mut self) -> bool {
        let mut changed = false;

        for index in 0..self.loops.len() {
            let header = self.loops[index].header;
            let edges = std::mem::take(&mut self.loops[index].exit_ladder);

            if edges.is_empty() || edges.iter().any(|(from, target)| self.is_touched(&[*from, *target])) {
                continue;
            }

            self.create_selector_ladder(header, &edges, "loop_merge_ladder");
            changed = true;
        }

        changed
    }

    /// A header can't end in a switch, move the switch into a successor
    fn split_switch_header(&mut self, header: NodeId) {
        let terminator = self.pool.node(header).ir.terminator.clone();
        let name = format!("{}.succ", self.pool.node(header).name);

        for target in terminator.targets() {
            self.pool.remove_branch(header, target);
        }

        let successor = self.create_helper_node(&name, Placement::After(header), terminator);

        self.pool.node_mut(header).ir.terminator = Terminator::Branch { target: successor };
        self.pool.add_branch(header, successor);
        self.touched.insert(header);

        debug!("moved switch of loop header `{}` into `{name}`", self.pool.node(header).name);
    }

    /// Every edge leaving the body of a loop, classified
    fn analyze_loop(&self, index: usize) -> Vec<LoopExit> {
        let info = &self.loops[index];
        let header = info.header;

        let enclosing_continues = self
            .enclosing_loops(header)
            .filter(|outer| outer.header != header)
            .map(|outer| outer.latch)
            .collect::<Vec<_>>();

        let mut exits = Vec::new();

        for from in self.reverse_post_order().into_iter().filter(|id| info.body.contains(id)) {
            for target in self.pool.node(from).succ.iter().copied() {
                if info.body.contains(&target) {
                    continue;
                }

                let from_inner_loop = self.innermost_loop.get(&from) != Some(&index);

                let kind = if self.dominated_region(header, target) {
                    if from_inner_loop {
                        ExitKind::InnerDominated
                    } else {
                        ExitKind::Dominated
                    }
                } else if enclosing_continues.contains(&target) {
                    ExitKind::DominatedContinue
                } else if !self.dominates(header, target) {
                    ExitKind::NonDominated
                } else if from == header {
                    ExitKind::Direct
                } else if from_inner_loop && self.pool.node(from).is_loop_header() {
                    ExitKind::InnerDirect
                } else {
                    ExitKind::Body
                };

                exits.push(LoopExit { from, target, kind });
            }
        }

        debug!(
            "loop `{}`: {}",
            self.pool.node(header).name,
            exits
                .iter()
                .map(|exit| format!(
                    "{} -> {} ({})",
                    self.pool.node(exit.from).name,
                    self.pool.node(exit.target).name,
                    exit.kind
                ))
                .join(", ")
        );

        exits
    }

    fn analyze_loop_merge(&self, index: usize, exits: &[LoopExit]) -> LoopMerge {
        let header = self.loops[index].header;

        let mut candidates = exits
            .iter()
            .filter(|exit| !exit.is_terminal())
            .map(|exit| exit.target)
            .unique()
            .collect::<Vec<_>>();
        candidates.sort_by_key(|id| Reverse(self.post_order(*id)));

        match candidates.as_slice() {
            [] => {
                // Only exits ending the function, if any. Prefer the one the
                // header takes itself.
                let direct = exits
                    .iter()
                    .find(|exit| exit.from == header)
                    .map(|exit| exit.target);

                let first = exits
                    .iter()
                    .map(|exit| exit.target)
                    .max_by_key(|target| self.post_order(*target));

                LoopMerge::Merge(direct.or(first))
            }
            [merge] => LoopMerge::Merge(Some(*merge)),
            _ => match find_common_post_dominator(self.pool, &candidates) {
                Some(merge) if self.exit_paths_dominated(header, &candidates, merge) => LoopMerge::Merge(Some(merge)),
                _ => LoopMerge::Ladder(
                    exits
                        .iter()
                        .filter(|exit| !exit.is_terminal())
                        .map(|exit| (exit.from, exit.target))
                        .collect(),
                ),
            },
        }
    }

    /// Whether every node between the exit targets and `merge` belongs to the
    /// loop construct, so that `merge` can serve all exits
    fn exit_paths_dominated(&self, header: NodeId, targets: &[NodeId], merge: NodeId) -> bool {
        self.forward_post_visit_order
            .iter()
            .copied()
            .filter(|id| *id != merge && self.reachability.query(*id, merge))
            .filter(|id| targets.iter().any(|target| self.reachability.query(*target, *id)))
            .all(|id| self.dominates(header, id))
    }

    /// An inner loop merging outside of the loop around it, at a block that
    /// isn't the outer merge, gets a ladder of its own first. The outer loop
    /// then exits through it and is funnelled on the next pass.
    pub(super) fn rewrite_transposed_loops(&mut self) -> bool {
        let mut changed = false;

        for index in 0..self.loops.len() {
            let info = &self.loops[index];
            let header = info.header;

            let Some(merge) = info.merge else {
                continue;
            };

            let Some(outer) = self
                .enclosing_loops(header)
                .filter(|outer| outer.header != header)
                .min_by_key(|outer| outer.body.len())
            else {
                continue;
            };

            // Still inside the outer loop if the outer latch is reachable
            // without going around again
            if query_reachability_split_loop_header(self.pool, merge, outer.latch, outer.header)
                || outer.merge == Some(merge)
                || self.dominates(outer.header, merge)
                || self.is_touched(&[header, merge])
            {
                continue;
            }

            debug!(
                "loop `{}` merges at `{}` outside of `{}`",
                self.pool.node(header).name,
                self.pool.node(merge).name,
                self.pool.node(outer.header).name
            );

            changed |= self.rewrite_transposed_loop_inner(header, merge);
        }

        changed
    }

    /// Gives the inner loop a merge of its own under its header. The outer
    /// loop now exits from that ladder, which the next pass classifies as an
    /// inner exit and funnels through a selector ladder if needed.
    fn rewrite_transposed_loop_inner(&mut self, header: NodeId, merge: NodeId) -> bool {
        self.create_ladder_block(header, merge, "transposed_ladder").is_some()
    }

    /// Where an inner loop should break to when its exits lead to the merge
    /// of an enclosing loop: a ladder of its own in front of that merge, so
    /// the two loops don't share a merge block
    pub(super) fn get_target_break_block_for_inner_header(
        &mut self,
        header: NodeId,
        target: NodeId,
    ) -> Option<(NodeId, bool)> {
        self.get_or_create_ladder_block(header, target, "break_ladder")
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        cfg::{pool::CfgNodePool, translator::CfgTranslator},
        config::StructurizerOptions,
        lir::parser::Parser,
    };

    fn node_named(structurizer: &Structurizer, name: &str) -> NodeId {
        structurizer
            .pool
            .live_nodes()
            .into_iter()
            .find(|id| structurizer.pool.node(*id).name == name)
            .unwrap_or_else(|| panic!("no node named `{name}`"))
    }

    #[test]
    fn inner_loop_merging_past_the_outer_loop_gets_its_own_ladder() {
        let mut module = Parser::parse_module(indoc! {"
            fn f(%0, %1, %2) {
            entry:
                switch %0, outer, [1: left, 2: right]
            outer:
                br %1, inner, left
            inner:
                br %2, inner_body, right
            inner_body:
                br %1, inner_latch, outer_latch
            inner_latch:
                jmp inner
            outer_latch:
                jmp outer
            left:
                ret %0
            right:
                ret %1
            }
        "})
        .unwrap();

        let options = StructurizerOptions::default();
        let function = &mut module.functions[0];
        let mut pool = CfgNodePool::new();
        let translator = CfgTranslator::run(function, &mut pool, &options.markers).unwrap();
        let mut structurizer = Structurizer::new(function, &mut pool, translator.entry(), &options);

        structurizer.recompute_cfg();
        assert!(!structurizer.find_loops().unwrap());

        let outer = node_named(&structurizer, "outer");
        let inner = node_named(&structurizer, "inner");
        let inner_body = node_named(&structurizer, "inner_body");
        let left = node_named(&structurizer, "left");
        let right = node_named(&structurizer, "right");

        // The outer loop leaves at two places, the inner one only at `right`
        assert_eq!(structurizer.loops[0].exit_ladder, vec![(outer, left), (inner, right)]);
        assert_eq!(structurizer.loops[1].merge, Some(right));

        assert!(structurizer.rewrite_transposed_loops());

        let ladder = node_named(&structurizer, "right.transposed_ladder");
        assert_eq!(structurizer.pool.node(inner).ir.terminator.targets(), vec![inner_body, ladder]);
        assert_eq!(structurizer.pool.node(ladder).ir.terminator, Terminator::Branch { target: right });
    }
}
