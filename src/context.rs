//! Kernel contexts
//!
//! A context accumulates everything one dispatch needs: the nodes it
//! evaluates, its binding registries, and the values it must export for
//! later kernels. Contexts live in an arena owned by one compile session;
//! a `ContextId` is an index into it.

use crate::error::{GraphError, Result};
use crate::ir::{Bindings, BufferSource, KernelSpec};
use crate::node::{Node, NodeId, NodeKind, OpClass};
use crate::ops::{Operand, Source};
use crate::tensor::{Mask, TensorStore};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub(crate) type ContextId = usize;

#[derive(Debug)]
pub(crate) struct KernelContext {
    pub id: ContextId,
    pub class: OpClass,
    /// Every node in the context has this stage
    pub stage: usize,
    /// Number of invocations
    pub size: usize,
    /// Nodes in emission (topological) order
    pub nodes: Vec<NodeId>,
    pub inputs: Bindings,
    /// Shape of every buffer and local this kernel names
    pub shapes: BTreeMap<String, Vec<usize>>,
    /// Nodes stored to `<var>_output` for other kernels to read
    pub exports: BTreeSet<NodeId>,
    pub backward: Option<KernelSpec>,
}

impl KernelContext {
    pub fn label(&self) -> String {
        format!("forward_k{}", self.id)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Debug, Default)]
pub(crate) struct ContextArena {
    contexts: Vec<KernelContext>,
    /// Regular contexts by (stage, size)
    regular: HashMap<(usize, usize), ContextId>,
}

impl ContextArena {
    pub fn create(
        &mut self,
        class: OpClass,
        stage: usize,
        size: usize,
    ) -> ContextId {
        let id = self.contexts.len();
        self.contexts.push(KernelContext {
            id,
            class,
            stage,
            size,
            nodes: Vec::new(),
            inputs: Bindings::default(),
            shapes: BTreeMap::new(),
            exports: BTreeSet::new(),
            backward: None,
        });
        if class == OpClass::Regular {
            self.regular.entry((stage, size)).or_insert(id);
        }
        id
    }

    /// Pick the context a node of `class` at `stage` with `size` invocations
    /// is emitted into, when it is reached from `current`.
    ///
    /// There is at most one Regular context per (stage, size), so a Regular
    /// node either stays in `current` or joins the one registered for its
    /// key. Reduction nodes always open a new context.
    pub fn use_context(
        &mut self,
        current: ContextId,
        class: OpClass,
        stage: usize,
        size: usize,
    ) -> ContextId {
        if class == OpClass::Regular {
            let here = &self.contexts[current];
            if here.class == OpClass::Regular && here.stage == stage && here.size == size {
                return current;
            }
            if let Some(&existing) = self.regular.get(&(stage, size)) {
                log::debug!("reusing context k{existing} from k{current}");
                return existing;
            }
        }
        let id = self.create(class, stage, size);
        log::debug!("opened {class:?} context k{id} (stage {stage}, size {size})");
        id
    }

    pub fn get(&self, id: ContextId) -> &KernelContext {
        &self.contexts[id]
    }

    pub fn get_mut(&mut self, id: ContextId) -> &mut KernelContext {
        &mut self.contexts[id]
    }

    /// Drop empty contexts from the (stage, size) lookup
    pub fn prune(&mut self) {
        let empty: BTreeSet<ContextId> = self
            .contexts
            .iter()
            .filter(|c| c.is_empty())
            .map(|c| c.id)
            .collect();
        self.regular.retain(|_, c| !empty.contains(c));
    }

    /// Non-empty contexts, dependency-first
    pub fn linearize(&self) -> Vec<ContextId> {
        let mut order: Vec<&KernelContext> =
            self.contexts.iter().filter(|c| !c.is_empty()).collect();
        order.sort_by_key(|c| (c.stage, c.id));
        order.iter().map(|c| c.id).collect()
    }

    /// Check that every operand is produced by an earlier (or the same) kernel
    pub fn verify_order(&self, order: &[ContextId], nodes: &[Node]) -> Result<()> {
        let position: HashMap<ContextId, usize> =
            order.iter().enumerate().map(|(i, &c)| (c, i)).collect();
        for &ctx in order {
            for &id in &self.contexts[ctx].nodes {
                for (operand, _) in &nodes[id.0].operands {
                    let Some(producer) = nodes[operand.0].context else {
                        continue;
                    };
                    if position.get(&producer) > position.get(&ctx) {
                        return Err(GraphError::CyclicKernels(ctx));
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolve an operand of a node emitted into `ctx`.
    ///
    /// Constants are inlined, leaves are read from their bound buffers and
    /// values computed in the same kernel are referenced by variable. Any
    /// other computed operand crosses a kernel boundary: its producer
    /// exports `<var>_output` and this kernel reads the hand-off buffer `<var>`.
    pub fn resolve_operand(
        &mut self,
        ctx: ContextId,
        nodes: &[Node],
        tensors: &TensorStore,
        (id, access): (NodeId, crate::node::Access),
    ) -> Result<Operand> {
        let node = &nodes[id.0];
        let source = match &node.kind {
            NodeKind::Constant(v) => Source::Const(*v),
            NodeKind::Tensor(t) => {
                let tensor = tensors.get(*t)?;
                let name = tensor.binding_name();
                self.bind(ctx, &name, &tensor.shape, BufferSource::Tensor(*t));
                Source::Buffer(name)
            }
            NodeKind::Mask(m) => {
                let name = Mask::binding_name(*m);
                self.bind(ctx, &name, &node.shape, BufferSource::Mask(*m));
                Source::Buffer(name)
            }
            NodeKind::Op(_) if node.context == Some(ctx) => Source::Var(node.var.clone()),
            NodeKind::Op(_) => {
                let producer = node.context.ok_or_else(|| GraphError::BindingResolution {
                    kernel: self.contexts[ctx].label(),
                    name: node.var.clone(),
                })?;
                self.contexts[producer].exports.insert(id);
                self.bind(ctx, &node.var, &node.shape, BufferSource::Local);
                Source::Buffer(node.var.clone())
            }
        };
        Ok(Operand {
            source,
            access,
            shape: node.shape.clone(),
        })
    }

    fn bind(&mut self, ctx: ContextId, name: &str, shape: &[usize], source: BufferSource) {
        let context = &mut self.contexts[ctx];
        context
            .inputs
            .register(name, shape.iter().product(), source);
        context.shapes.insert(name.to_string(), shape.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regular_requests_reuse_matching_contexts() {
        let mut arena = ContextArena::default();
        let root = arena.create(OpClass::Regular, 0, 12);
        assert_eq!(arena.use_context(root, OpClass::Regular, 0, 12), root);

        let later = arena.use_context(root, OpClass::Regular, 1, 12);
        assert_ne!(later, root);
        let reduction = arena.use_context(later, OpClass::Reduction, 0, 4);
        // Any request for (stage 0, size 2) lands in the same context
        let small = arena.use_context(later, OpClass::Regular, 0, 2);
        assert_eq!(arena.use_context(reduction, OpClass::Regular, 0, 2), small);
        assert_eq!(arena.use_context(root, OpClass::Regular, 1, 12), later);
    }

    #[test]
    fn test_reductions_always_open_new_contexts() {
        let mut arena = ContextArena::default();
        let root = arena.create(OpClass::Regular, 0, 4);
        let a = arena.use_context(root, OpClass::Reduction, 0, 4);
        let b = arena.use_context(a, OpClass::Reduction, 0, 4);
        assert_ne!(a, b);
        assert_eq!(arena.get(b).class, OpClass::Reduction);
    }
}
