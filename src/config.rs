//! Knobs for the structurizer pipeline. The command line driver fills these in
//! from its arguments, library users usually just take the defaults.

use crate::lir::Instruction;

/// Callee names of the marker intrinsics understood by the downstream
/// serializer, plus the discard intrinsic recognized on input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerNames {
    pub loop_merge: String,
    pub selection_merge: String,
    pub merge_block: String,
    pub continue_block: String,
    pub discard: String,
}

impl Default for MarkerNames {
    fn default() -> Self {
        Self {
            loop_merge: "cfg.loop_merge".to_owned(),
            selection_merge: "cfg.selection_merge".to_owned(),
            merge_block: "cfg.merge_block".to_owned(),
            continue_block: "cfg.continue_block".to_owned(),
            discard: "cfg.discard_fragment".to_owned(),
        }
    }
}

impl MarkerNames {
    /// Whether the instruction is one of the structured control flow markers
    pub fn is_marker_call(&self, instruction: &Instruction) -> bool {
        [
            &self.loop_merge,
            &self.selection_merge,
            &self.merge_block,
            &self.continue_block,
        ]
        .into_iter()
        .any(|name| instruction.is_call_to(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructurizerOptions {
    /// Upper bound on rewrite passes before giving up on a function
    pub max_passes: usize,
    /// Emit loop/selection merge markers when converting back to LIR
    pub add_merge_annotations: bool,
    pub markers: MarkerNames,
}

impl StructurizerOptions {
    pub const DEFAULT_MAX_PASSES: usize = 64;
}

impl Default for StructurizerOptions {
    fn default() -> Self {
        Self {
            max_passes: Self::DEFAULT_MAX_PASSES,
            add_merge_annotations: true,
            markers: MarkerNames::default(),
        }
    }
}
