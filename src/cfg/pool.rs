use super::node::{CfgNode, NodeId};
use crate::{index::IndexVec, lir::BlockId};

/// Owns every node of one function. Removed nodes leave a hole so ids stay
/// stable.
#[derive(Debug, Default)]
pub struct CfgNodePool {
    nodes: IndexVec<NodeId, Option<CfgNode>>,
}

impl CfgNodePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_node(&mut self, name: impl Into<String>, block: BlockId) -> NodeId {
        let id = self.nodes.next_index();
        self.nodes.push(Some(CfgNode::new(id, name.into(), block)))
    }

    pub fn node(&self, id: NodeId) -> &CfgNode {
        self.nodes[id]
            .as_ref()
            .unwrap_or_else(|| panic!("use of removed node {id:?}"))
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut CfgNode {
        self.nodes[id]
            .as_mut()
            .unwrap_or_else(|| panic!("use of removed node {id:?}"))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.get(id).is_some_and(Option::is_some)
    }

    /// Ids of live nodes in creation order
    pub fn live_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .enumerate()
            .filter(|(_, node)| node.is_some())
            .map(|(id, _)| id)
            .collect()
    }

    /// Upper bound for node ids handed out so far, removed nodes included
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    pub fn len(&self) -> usize {
        self.nodes.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn for_each_node(&mut self, mut visitor: impl FnMut(&mut CfgNode)) {
        for node in self.nodes.iter_mut().flatten() {
            visitor(node);
        }
    }

    /// Retires a node which is no longer connected to anything
    pub fn remove_node(&mut self, id: NodeId) {
        let node = self.node(id);

        assert!(
            node.pred.is_empty() && node.succ.is_empty(),
            "removing node `{}` which still has edges",
            node.name
        );

        self.nodes[id] = None;
    }

    /// Removes every edge touching `id`, in both directions
    pub fn detach_node(&mut self, id: NodeId) {
        let node = self.node_mut(id);
        let pred = std::mem::take(&mut node.pred);
        let succ = std::mem::take(&mut node.succ);

        for p in pred {
            if p != id {
                self.node_mut(p).succ.retain(|s| *s != id);
            }
        }

        for s in succ {
            if s != id {
                self.node_mut(s).pred.retain(|p| *p != id);
            }
        }
    }

    /// Adds the edge `from -> to` unless it already exists
    pub fn add_branch(&mut self, from: NodeId, to: NodeId) {
        let source = self.node_mut(from);
        if !source.succ.contains(&to) {
            source.succ.push(to);
        }

        let target = self.node_mut(to);
        if !target.pred.contains(&from) {
            target.pred.push(from);
        }
    }

    pub fn remove_branch(&mut self, from: NodeId, to: NodeId) {
        self.node_mut(from).succ.retain(|s| *s != to);
        self.node_mut(to).pred.retain(|p| *p != from);
    }

    /// Points every reference of `from`'s terminator to `old` at `new`
    /// instead and updates the edges to match
    pub fn retarget_branch(&mut self, from: NodeId, old: NodeId, new: NodeId) {
        self.node_mut(from).ir.terminator.retarget(old, new);
        self.remove_branch(from, old);
        self.add_branch(from, new);
    }

    /// Rebuilds the edges of every node from its terminator
    pub fn rebuild_edges(&mut self) {
        for node in self.nodes.iter_mut().flatten() {
            node.pred.clear();
            node.succ.clear();
            node.succ_back_edge = None;
            node.pred_back_edge = None;
        }

        for id in self.live_nodes() {
            for target in self.node(id).ir.terminator.targets() {
                self.add_branch(id, target);
            }
        }
    }
}
