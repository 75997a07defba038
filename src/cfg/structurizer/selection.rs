use log::{debug, trace};

use super::Structurizer;
use crate::cfg::{
    analysis::{find_common_post_dominator, post_dominates},
    node::{MergeType, NodeId, TerminatorKind},
};

/// How a branching node merges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SelectionMerge {
    /// Every target breaks out of or continues the enclosing loop, so the
    /// branch needs no construct of its own
    NotSelection,
    /// `None` when the arms never meet again
    Merge(Option<NodeId>),
    /// One arm ends in `unreachable`, there is no merge
    Exit,
}

impl Structurizer<'_> {
    /// Targets of `id` that leave the innermost loop around it, either
    /// straight to its merge or continue block, or on a path that ends up
    /// at the merge
    fn is_loop_escape(&self, id: NodeId, target: NodeId) -> bool {
        let Some(info) = self.innermost_loop(id) else {
            return false;
        };

        if info.merge == Some(target) || info.latch == target {
            return true;
        }

        !info.body.contains(&target)
            && info
                .merge
                .is_some_and(|merge| post_dominates(self.pool, merge, target))
    }

    fn is_break_or_continue(&self, id: NodeId, target: NodeId) -> bool {
        self.innermost_loop(id)
            .is_some_and(|info| info.merge == Some(target) || info.latch == target)
    }

    fn ends_in_unreachable(&self, id: NodeId) -> bool {
        matches!(
            self.pool.node(id).ir.terminator.kind(),
            TerminatorKind::Unreachable | TerminatorKind::Kill
        )
    }

    /// Nearest common post-dominator of the targets of `id` which stay inside
    /// the innermost loop. Ties go to the first candidate in post order.
    fn find_common_post_dominator_with_ignored_break(&self, id: NodeId) -> SelectionMerge {
        let targets = self.pool.node(id).succ.clone();

        let remaining = targets
            .iter()
            .copied()
            .filter(|target| !self.is_loop_escape(id, *target))
            .collect::<Vec<_>>();

        match remaining.as_slice() {
            [] if targets.iter().all(|target| self.is_break_or_continue(id, *target)) => {
                SelectionMerge::NotSelection
            }
            [] => SelectionMerge::Merge(None),
            [target] => SelectionMerge::Merge(Some(*target)),
            _ => {
                if let Some(merge) = find_common_post_dominator(self.pool, &remaining) {
                    return SelectionMerge::Merge(Some(merge));
                }

                if remaining.iter().any(|target| self.ends_in_unreachable(*target)) {
                    return SelectionMerge::Exit;
                }

                // Arms which only end the function don't need to merge
                let merging = remaining
                    .iter()
                    .copied()
                    .filter(|target| !self.dominated_region(id, *target))
                    .collect::<Vec<_>>();

                match merging.as_slice() {
                    [] => SelectionMerge::Merge(None),
                    [target] => SelectionMerge::Merge(Some(*target)),
                    _ => SelectionMerge::Merge(find_common_post_dominator(self.pool, &merging).or_else(|| {
                        merging
                            .iter()
                            .copied()
                            .min_by_key(|target| self.post_order(*target))
                    })),
                }
            }
        }
    }

    /// Merge block of a switch, before any ladders
    fn find_natural_switch_merge_block(&self, id: NodeId) -> Option<NodeId> {
        match self.find_common_post_dominator_with_ignored_break(id) {
            SelectionMerge::Merge(merge) => merge,
            SelectionMerge::NotSelection | SelectionMerge::Exit => None,
        }
    }

    /// Switches always need a selection construct. A natural merge which
    /// the switch doesn't dominate gets a ladder.
    pub(super) fn find_switch_blocks(&mut self) -> bool {
        let mut changed = false;

        for id in self.reverse_post_order() {
            let node = self.pool.node(id);

            if node.merge == MergeType::Loop || node.ir.terminator.kind() != TerminatorKind::Switch {
                continue;
            }

            let merge = self.find_natural_switch_merge_block(id);

            if let Some(merge) = merge {
                if !self.dominates(id, merge) && !self.is_touched(&[id, merge]) {
                    changed |= self.create_switch_merge_ladder(id, merge);
                    continue;
                }
            }

            trace!(
                "switch `{}` merges at {:?}",
                self.pool.node(id).name,
                merge.map(|merge| &self.pool.node(merge).name)
            );

            let node = self.pool.node_mut(id);
            node.merge = MergeType::Selection;
            node.selection_merge_block = merge;
        }

        changed
    }

    fn create_switch_merge_ladder(&mut self, id: NodeId, merge: NodeId) -> bool {
        self.create_ladder_block(id, merge, "switch_merge").is_some()
    }

    /// Classifies every conditional branch outside of loop headers. A
    /// selection from an earlier pass only gets its merge looked up again.
    pub(super) fn find_selection_merges(&mut self) {
        for id in self.reverse_post_order() {
            let node = self.pool.node(id);

            if node.merge == MergeType::Loop
                || node.ir.terminator.kind() != TerminatorKind::Condition
                || node.succ.len() < 2
            {
                continue;
            }

            let merge = self.find_common_post_dominator_with_ignored_break(id);

            trace!("selection `{}`: {merge:?}", self.pool.node(id).name);

            let node = self.pool.node_mut(id);

            match merge {
                SelectionMerge::NotSelection if node.merge == MergeType::Selection => {
                    debug!("`{}` only breaks out now, it keeps a fake merge", node.name);
                }
                SelectionMerge::NotSelection => {}
                SelectionMerge::Merge(merge) => {
                    node.merge = MergeType::Selection;
                    node.selection_merge_block = merge;
                }
                SelectionMerge::Exit => {
                    node.merge = MergeType::Selection;
                    node.selection_merge_exit = true;
                }
            }
        }
    }

    /// Selections whose merge they don't dominate, or whose merge is the
    /// merge or continue block of a loop around them, get a ladder
    pub(super) fn fixup_broken_selection_merges(&mut self) -> bool {
        let mut changed = false;

        for id in self.reverse_post_order() {
            let node = self.pool.node(id);

            if node.merge != MergeType::Selection {
                continue;
            }

            let Some(merge) = node.selection_merge_block else {
                continue;
            };

            let clashes_with_loop = self
                .enclosing_loops(id)
                .any(|info| info.merge == Some(merge) || info.latch == merge);

            if (self.dominates(id, merge) && !clashes_with_loop) || self.is_touched(&[id, merge]) {
                continue;
            }

            debug!(
                "selection merge `{}` of `{}` is broken",
                self.pool.node(merge).name,
                self.pool.node(id).name
            );

            changed |= self
                .get_or_create_ladder_block(id, merge, "selection_ladder")
                .is_some_and(|(_, created)| created);
        }

        changed
    }
}
