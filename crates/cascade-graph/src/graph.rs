//! Graph traversal.

use std::collections::HashMap;
use std::sync::Arc;

use crate::node::{Node, NodeId, NodeRef};

/// Every node reachable from `outputs`, each placed after all of its inputs.
pub fn topological_order(outputs: &[NodeRef]) -> Vec<NodeRef> {
    topological_order_until(outputs, |_| false)
}

/// Like [`topological_order`], but the inputs of nodes for which `stop`
/// returns true are not visited. Such nodes are still part of the order.
///
/// The walk keeps an explicit stack, so graph depth is not limited by the
/// thread's stack size.
pub fn topological_order_until<F>(outputs: &[NodeRef], stop: F) -> Vec<NodeRef>
where
    F: Fn(&Node) -> bool,
{
    // false: inputs being visited, true: placed in the order.
    let mut state: HashMap<NodeId, bool> = HashMap::new();
    let mut order = Vec::new();
    let mut stack: Vec<(NodeRef, bool)> =
        outputs.iter().rev().map(|n| (Arc::clone(n), false)).collect();

    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            state.insert(node.id(), true);
            order.push(node);
            continue;
        }
        if state.contains_key(&node.id()) {
            continue;
        }
        state.insert(node.id(), false);
        let descend = !stop(&node);
        stack.push((Arc::clone(&node), true));
        if descend {
            for input in node.inputs().iter().rev() {
                if !state.contains_key(&input.id()) {
                    stack.push((Arc::clone(input), false));
                }
            }
        }
    }
    order
}
