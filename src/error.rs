use thiserror::Error;

/// Errors caused by malformed input to the translator or structurizer. Broken
/// invariants inside the structurizer itself are not represented here, those
/// are bugs and abort with a panic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CfgError {
    #[error("block `{block}` has no instructions")]
    EmptyBlock { block: String },
    #[error("unsupported terminator instruction in block `{block}`: {instruction}")]
    UnsupportedTerminator { block: String, instruction: String },
    #[error("no default case in switch terminating block `{block}`")]
    MissingDefaultCase { block: String },
    #[error("function `{function}` has no blocks")]
    EmptyFunction { function: String },
    #[error("irreducible control flow: back edge `{latch}` -> `{header}` does not target a dominator")]
    IrreducibleLoop { header: String, latch: String },
    #[error("structurizer did not converge after {passes} passes")]
    NoConvergence { passes: usize },
}

/// An error in the textual form of the IR
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (line {line}, column {column})")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}
