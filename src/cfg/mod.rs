//! The structurizer's view of a function: one [`node::CfgNode`] per block,
//! owned by a [`pool::CfgNodePool`]. [`translator::CfgTranslator`] moves a
//! function into the pool and back, [`structurizer::Structurizer`] rewrites
//! the pool in between.

use self::{
    node::NodeId, pool::CfgNodePool, structurizer::Structurizer, translator::CfgTranslator,
};
use crate::{
    config::StructurizerOptions,
    error::CfgError,
    lir::{Function, Module},
};

pub mod analysis;
pub mod dot;
pub mod node;
pub mod pool;
pub mod structurizer;
pub mod translator;

#[cfg(test)]
mod tests;

/// What is left of the CFG model once the function has been rewritten
#[derive(Debug)]
pub struct StructurizedCfg {
    pub pool: CfgNodePool,
    pub entry: NodeId,
}

impl StructurizedCfg {
    pub fn to_dot(&self, name: &str) -> String {
        dot::to_dot(&self.pool, self.entry, name)
    }
}

/// Translates, structurizes and writes back a single function
pub fn structurize_function(
    function: &mut Function,
    options: &StructurizerOptions,
) -> Result<StructurizedCfg, CfgError> {
    let mut pool = CfgNodePool::new();
    let mut translator = CfgTranslator::run(function, &mut pool, &options.markers)?;

    let entry = Structurizer::new(function, &mut pool, translator.entry(), options).run()?;

    translator.cfg_to_lir(function, &mut pool, entry, options.add_merge_annotations)?;

    Ok(StructurizedCfg { pool, entry })
}

pub fn structurize_module(module: &mut Module, options: &StructurizerOptions) -> Result<(), CfgError> {
    for function in &mut module.functions {
        structurize_function(function, options)?;
    }

    Ok(())
}
