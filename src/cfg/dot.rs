use std::fmt::Write;

use super::{
    node::{MergeType, NodeId},
    pool::CfgNodePool,
};

/// Renders the pool as a graphviz digraph. Back edges are dashed, merge and
/// continue relations dotted.
pub fn to_dot(pool: &CfgNodePool, entry: NodeId, name: &str) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "digraph \"{}\" {{", escape(name));
    let _ = writeln!(out, "    node [shape=box, fontname=monospace];");

    for id in pool.live_nodes() {
        let node = pool.node(id);

        let shape = match node.merge {
            MergeType::None => "box",
            MergeType::Selection => "diamond",
            MergeType::Loop => "house",
        };

        let _ = writeln!(
            out,
            "    \"{}\" [label=\"{}\\n{}\", shape={shape}{}];",
            escape(&node.name),
            escape(&node.name),
            node.ir.terminator.kind(),
            if id == entry { ", penwidth=2" } else { "" }
        );
    }

    for id in pool.live_nodes() {
        let node = pool.node(id);
        let from = escape(&node.name);

        for succ in &node.succ {
            let _ = writeln!(out, "    \"{from}\" -> \"{}\";", escape(&pool.node(*succ).name));
        }

        if let Some(target) = node.succ_back_edge {
            let _ = writeln!(
                out,
                "    \"{from}\" -> \"{}\" [style=dashed];",
                escape(&pool.node(target).name)
            );
        }

        let merges = [
            ("merge", node.selection_merge_block.or(node.ir.merge_info.merge_block)),
            ("continue", node.ir.merge_info.continue_block),
        ];

        for (label, target) in merges {
            if let Some(target) = target.filter(|target| pool.contains(*target)) {
                let _ = writeln!(
                    out,
                    "    \"{from}\" -> \"{}\" [style=dotted, label={label}];",
                    escape(&pool.node(target).name)
                );
            }
        }
    }

    let _ = writeln!(out, "}}");

    out
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cfg::node::Terminator,
        index::Index,
        lir::{BlockId, Operand},
    };

    #[test]
    fn back_edges_are_dashed() {
        let mut pool = CfgNodePool::new();
        let header = pool.create_node("header", BlockId::new(0));
        let latch = pool.create_node("latch", BlockId::new(1));

        pool.node_mut(header).ir.terminator = Terminator::Condition {
            condition: Operand::UNDEF,
            true_block: latch,
            false_block: latch,
        };
        pool.add_branch(header, latch);
        pool.node_mut(latch).succ_back_edge = Some(header);
        pool.node_mut(header).merge = MergeType::Loop;

        let dot = to_dot(&pool, header, "f");

        assert!(dot.starts_with("digraph \"f\" {"));
        assert!(dot.contains("\"header\" [label=\"header\\nCondition\", shape=house, penwidth=2];"));
        assert!(dot.contains("\"header\" -> \"latch\";"));
        assert!(dot.contains("\"latch\" -> \"header\" [style=dashed];"));
    }
}
