//! Graph evaluation with per-pass memoisation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cascade_core::{CascadeError, Result};
use cascade_device::MultiArrayRef;

use crate::context::{check_dtype, check_shape, ContextRef};
use crate::graph::topological_order;
use crate::node::{NodeId, NodeRef, Op};

/// Arrays computed during one evaluation, at most one per node.
#[derive(Debug, Default)]
pub struct ExecutionCache {
    values: HashMap<NodeId, MultiArrayRef>,
    hits: usize,
    misses: usize,
}

impl ExecutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a node's value, counting the hit or miss.
    pub fn get(&mut self, node: &NodeRef) -> Option<MultiArrayRef> {
        match self.values.get(&node.id()) {
            Some(value) => {
                self.hits += 1;
                Some(Arc::clone(value))
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn put(&mut self, node: &NodeRef, value: MultiArrayRef) {
        self.values.insert(node.id(), value);
    }

    pub fn contains(&self, node: &NodeRef) -> bool {
        self.values.contains_key(&node.id())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

/// Evaluates a fixed set of output nodes.
///
/// The schedule is computed once at construction. Each run walks it in
/// order, enqueueing every needed node exactly once; nothing blocks until
/// the caller reads a result.
pub struct Executor {
    context: ContextRef,
    outputs: Vec<NodeRef>,
    schedule: Vec<NodeRef>,
}

impl Executor {
    pub fn new(context: ContextRef, outputs: Vec<NodeRef>) -> Self {
        let schedule = topological_order(&outputs);
        Self {
            context,
            outputs,
            schedule,
        }
    }

    pub fn context(&self) -> &ContextRef {
        &self.context
    }

    pub fn outputs(&self) -> &[NodeRef] {
        &self.outputs
    }

    /// Every node reachable from the outputs, inputs first.
    pub fn schedule(&self) -> &[NodeRef] {
        &self.schedule
    }

    /// Evaluate the outputs with a fresh cache.
    pub fn run(&self) -> Result<Vec<MultiArrayRef>> {
        self.run_with(&[])
    }

    /// Evaluate with per-run values for some nodes, overriding the store.
    pub fn run_with(&self, feeds: &[(NodeRef, MultiArrayRef)]) -> Result<Vec<MultiArrayRef>> {
        self.run_with_cache(feeds, &mut ExecutionCache::new())
    }

    /// Evaluate, reusing and extending `cache`. Nodes already cached are not
    /// recomputed.
    pub fn run_with_cache(
        &self,
        feeds: &[(NodeRef, MultiArrayRef)],
        cache: &mut ExecutionCache,
    ) -> Result<Vec<MultiArrayRef>> {
        let mut fed: HashMap<NodeId, MultiArrayRef> = HashMap::with_capacity(feeds.len());
        for (node, array) in feeds {
            check_shape(node, array.shape())?;
            check_dtype(node, array.dtype())?;
            fed.insert(node.id(), Arc::clone(array));
        }

        let needed = self.needed(&fed, cache);
        let device = self.context.device();
        tracing::debug!(
            "{}: evaluating {} of {} scheduled nodes",
            device.label(),
            needed.len(),
            self.schedule.len()
        );

        for node in &self.schedule {
            if !needed.contains(&node.id()) || cache.contains(node) {
                continue;
            }
            let value = if let Some(array) = fed.get(&node.id()) {
                Arc::clone(array)
            } else if let Some(array) = self.context.get_by_id(node.id()) {
                array
            } else if let Op::Variable { name } = node.op() {
                return Err(CascadeError::UnboundVariable { name: name.clone() });
            } else {
                let mut inputs = Vec::with_capacity(node.inputs().len());
                for input in node.inputs() {
                    let value = cache.get(input).ok_or_else(|| {
                        CascadeError::InvalidArgument(format!(
                            "{} scheduled before its input {}",
                            node.label(),
                            input.label()
                        ))
                    })?;
                    inputs.push(value);
                }
                tracing::trace!("forward {}", node.label());
                node.forward(device, &inputs)?
            };
            cache.put(node, value);
        }

        self.outputs
            .iter()
            .map(|node| {
                cache.get(node).ok_or_else(|| {
                    CascadeError::InvalidArgument(format!("{} was not evaluated", node.label()))
                })
            })
            .collect()
    }

    /// Nodes whose values this run needs. Inputs of nodes that are fed,
    /// stored or already cached are not needed on their behalf.
    fn needed(
        &self,
        fed: &HashMap<NodeId, MultiArrayRef>,
        cache: &ExecutionCache,
    ) -> HashSet<NodeId> {
        let mut needed: HashSet<NodeId> = self.outputs.iter().map(|n| n.id()).collect();
        for node in self.schedule.iter().rev() {
            if !needed.contains(&node.id()) {
                continue;
            }
            let bound = fed.contains_key(&node.id())
                || cache.contains(node)
                || self.context.get_by_id(node.id()).is_some();
            if !bound {
                needed.extend(node.inputs().iter().map(|i| i.id()));
            }
        }
        needed
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("context", &self.context)
            .field("outputs", &self.outputs.len())
            .field("schedule", &self.schedule.len())
            .finish()
    }
}
