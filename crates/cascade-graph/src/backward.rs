//! Reverse-mode differentiation as graph construction.
//!
//! [`build_back_propagation_graph`] does not compute anything: it walks the
//! forward graph from the loss towards its leaves and builds new nodes
//! computing the gradients. The result is evaluated like any other graph.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cascade_core::Result;

use crate::graph::topological_order;
use crate::node::{NodeId, NodeRef};
use crate::ops;

/// Gradient nodes keyed by the node they are the gradient of.
#[derive(Debug, Default, Clone)]
pub struct GradTable {
    grads: HashMap<NodeId, NodeRef>,
}

impl GradTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gradient of the loss with respect to `node`, if any flows to it.
    pub fn get(&self, node: &NodeRef) -> Option<&NodeRef> {
        self.grads.get(&node.id())
    }

    pub fn contains(&self, node: &NodeRef) -> bool {
        self.grads.contains_key(&node.id())
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &NodeRef)> {
        self.grads.iter()
    }

    /// Add `grad` to the entry for `node`, summing with a graph-level plus
    /// when one already exists.
    pub fn accumulate(&mut self, node: &NodeRef, grad: NodeRef) -> Result<()> {
        let entry = match self.grads.remove(&node.id()) {
            Some(existing) => ops::plus(&existing, &grad)?,
            None => grad,
        };
        self.grads.insert(node.id(), entry);
        Ok(())
    }
}

/// Build the gradient graph of `loss` with respect to `variables`.
///
/// The seed is ones shaped like `loss`, so a non-scalar loss is treated as
/// the sum of its elements. Only nodes lying on a path from the loss to one
/// of `variables` receive entries; an empty `variables` list differentiates
/// with respect to every reachable node. Variables the loss does not depend
/// on are absent from the table.
pub fn build_back_propagation_graph(loss: &NodeRef, variables: &[NodeRef]) -> Result<GradTable> {
    let order = topological_order(&[Arc::clone(loss)]);

    let targets: HashSet<NodeId> = variables.iter().map(|v| v.id()).collect();
    let mut relevant: HashSet<NodeId> = HashSet::new();
    for node in &order {
        if targets.is_empty()
            || targets.contains(&node.id())
            || node.inputs().iter().any(|i| relevant.contains(&i.id()))
        {
            relevant.insert(node.id());
        }
    }

    let mut table = GradTable::new();
    if !relevant.contains(&loss.id()) {
        return Ok(table);
    }
    table.accumulate(loss, ops::ones_like(loss))?;

    for node in order.iter().rev() {
        let Some(grad) = table.get(node).cloned() else {
            continue;
        };
        let mut seen = HashSet::new();
        for input in node.inputs() {
            if !seen.insert(input.id())
                || !relevant.contains(&input.id())
                || !input.participates_in_differentiation()
            {
                continue;
            }
            if let Some(d) = node.apply_chain_rule(input, &grad, node.inputs())? {
                table.accumulate(input, d)?;
            }
        }
    }

    tracing::debug!(
        "back-propagation graph for {}: {} gradient entries",
        loss.label(),
        table.len()
    );
    Ok(table)
}
