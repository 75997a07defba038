use strum::{Display, EnumDiscriminants};

use crate::{
    index::simple_index,
    lir::{BlockId, InstructionId, Operand, RegisterId},
};

simple_index! {
    /// Identifies a node in a [`super::pool::CfgNodePool`]
    pub struct NodeId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum MergeType {
    #[default]
    None,
    Selection,
    Loop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Case {
    pub node: NodeId,
    /// `None` for the default case
    pub value: Option<i64>,
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, EnumDiscriminants)]
#[strum_discriminants(name(TerminatorKind), derive(Display))]
pub enum Terminator {
    Branch {
        target: NodeId,
    },
    Condition {
        condition: Operand,
        true_block: NodeId,
        false_block: NodeId,
    },
    Return {
        value: Option<Operand>,
    },
    Unreachable,
    /// `unreachable` preceded by the discard intrinsic
    Kill,
    /// The default case always comes first
    Switch {
        condition: Operand,
        cases: Vec<Case>,
    },
}

impl Terminator {
    pub fn kind(&self) -> TerminatorKind {
        self.into()
    }

    /// Every successor reference in order, duplicates included
    pub fn targets(&self) -> Vec<NodeId> {
        match self {
            Self::Branch { target } => vec![*target],
            Self::Condition {
                true_block,
                false_block,
                ..
            } => vec![*true_block, *false_block],
            Self::Switch { cases, .. } => cases.iter().map(|case| case.node).collect(),
            Self::Return { .. } | Self::Unreachable | Self::Kill => Vec::new(),
        }
    }

    /// Rewrites every reference to `from` into `to`
    pub fn retarget(&mut self, from: NodeId, to: NodeId) {
        let replace = |node: &mut NodeId| {
            if *node == from {
                *node = to;
            }
        };

        match self {
            Self::Branch { target } => replace(target),
            Self::Condition {
                true_block,
                false_block,
                ..
            } => {
                replace(true_block);
                replace(false_block);
            }
            Self::Switch { cases, .. } => {
                for case in cases {
                    replace(&mut case.node);
                }
            }
            Self::Return { .. } | Self::Unreachable | Self::Kill => {}
        }
    }

    pub fn operand(&self) -> Option<Operand> {
        match self {
            Self::Condition { condition, .. } | Self::Switch { condition, .. } => Some(*condition),
            Self::Return { value } => *value,
            _ => None,
        }
    }

    pub fn operand_mut(&mut self) -> Option<&mut Operand> {
        match self {
            Self::Condition { condition, .. } | Self::Switch { condition, .. } => Some(condition),
            Self::Return { value } => value.as_mut(),
            _ => None,
        }
    }

    /// Terminal nodes leave the function
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Return { .. } | Self::Unreachable | Self::Kill)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncomingValue {
    pub block: NodeId,
    pub value: Operand,
}

/// A PHI of the node's block. `incoming` holds one entry per distinct
/// predecessor node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phi {
    pub instruction: InstructionId,
    pub destination: RegisterId,
    pub incoming: Vec<IncomingValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeInfo {
    pub merge_block: Option<NodeId>,
    pub continue_block: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIr {
    pub terminator: Terminator,
    pub phi: Vec<Phi>,
    /// Plain instructions of the block, in order
    pub operations: Vec<InstructionId>,
    pub merge_info: MergeInfo,
}

/// Blocks made up while converting back to LIR. Kept so that converting a
/// second time reuses them instead of stacking up more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SynthesizedBlocks {
    pub fake_selection: Option<BlockId>,
    pub fake_selection_merge: Option<BlockId>,
    pub fake_merge: Option<BlockId>,
    pub fake_continue: Option<BlockId>,
    pub new_entry: Option<BlockId>,
}

#[derive(Debug, Clone)]
pub struct CfgNode {
    pub id: NodeId,
    pub name: String,
    pub block: BlockId,

    pub pred: Vec<NodeId>,
    pub succ: Vec<NodeId>,

    pub merge: MergeType,
    pub ir: NodeIr,
    /// Block that PHIs of successors must name instead of `block`
    pub phi_override: Option<BlockId>,
    pub selection_merge_block: Option<NodeId>,
    /// The selection has no merge because one side leaves through an
    /// `unreachable`/kill block
    pub selection_merge_exit: bool,
    pub synthesized: SynthesizedBlocks,

    // Analysis state, rebuilt on every `recompute_cfg`
    pub immediate_dominator: Option<NodeId>,
    pub immediate_post_dominator: Option<NodeId>,
    pub forward_post_visit_order: Option<usize>,
    pub backward_post_visit_order: Option<usize>,
    pub traversing: bool,
    pub succ_back_edge: Option<NodeId>,
    pub pred_back_edge: Option<NodeId>,
    pub dominance_frontier: Vec<NodeId>,
}

impl CfgNode {
    pub fn new(id: NodeId, name: String, block: BlockId) -> Self {
        Self {
            id,
            name,
            block,
            pred: Vec::new(),
            succ: Vec::new(),
            merge: MergeType::None,
            ir: NodeIr {
                terminator: Terminator::Unreachable,
                phi: Vec::new(),
                operations: Vec::new(),
                merge_info: MergeInfo::default(),
            },
            phi_override: None,
            selection_merge_block: None,
            selection_merge_exit: false,
            synthesized: SynthesizedBlocks::default(),
            immediate_dominator: None,
            immediate_post_dominator: None,
            forward_post_visit_order: None,
            backward_post_visit_order: None,
            traversing: false,
            succ_back_edge: None,
            pred_back_edge: None,
            dominance_frontier: Vec::new(),
        }
    }

    pub fn visited(&self) -> bool {
        self.forward_post_visit_order.is_some()
    }

    pub fn is_loop_header(&self) -> bool {
        self.pred_back_edge.is_some()
    }

    /// Predecessors including the loop back edge, if any
    pub fn all_preds(&self) -> Vec<NodeId> {
        self.pred.iter().copied().chain(self.pred_back_edge).collect()
    }

    /// Successors including the loop back edge, if any
    pub fn all_succs(&self) -> Vec<NodeId> {
        self.succ.iter().copied().chain(self.succ_back_edge).collect()
    }

    /// Forgets the merge targets found by the last pass. The merge type
    /// stays, a node classified once keeps its construct.
    pub fn reset_merge_classification(&mut self) {
        self.ir.merge_info = MergeInfo::default();
        self.selection_merge_block = None;
        self.selection_merge_exit = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Index;

    #[test]
    fn retarget_rewrites_every_case() {
        let (a, b, c) = (NodeId::new(0), NodeId::new(1), NodeId::new(2));

        let mut terminator = Terminator::Switch {
            condition: Operand::UNDEF,
            cases: vec![
                Case {
                    node: a,
                    value: None,
                    is_default: true,
                },
                Case {
                    node: b,
                    value: Some(1),
                    is_default: false,
                },
                Case {
                    node: a,
                    value: Some(2),
                    is_default: false,
                },
            ],
        };

        terminator.retarget(a, c);

        assert_eq!(terminator.targets(), vec![c, b, c]);
        assert_eq!(terminator.kind(), TerminatorKind::Switch);
    }

    #[test]
    fn reset_keeps_the_merge_type() {
        let mut node = CfgNode::new(NodeId::new(0), "header".to_owned(), BlockId::new(0));
        node.merge = MergeType::Selection;
        node.selection_merge_block = Some(NodeId::new(3));
        node.selection_merge_exit = true;
        node.ir.merge_info.continue_block = Some(NodeId::new(2));

        node.reset_merge_classification();

        assert_eq!(node.merge, MergeType::Selection);
        assert_eq!(node.selection_merge_block, None);
        assert!(!node.selection_merge_exit);
        assert_eq!(node.ir.merge_info, MergeInfo::default());
    }

    #[test]
    fn terminal_terminators_have_no_targets() {
        for terminator in [
            Terminator::Return { value: None },
            Terminator::Unreachable,
            Terminator::Kill,
        ] {
            assert!(terminator.is_terminal());
            assert!(terminator.targets().is_empty());
        }
    }
}
