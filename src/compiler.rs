//! Graph compiler
//!
//! Compilation runs in separate passes over an explicit node arena:
//! 1. lowering: builders become nodes (memoized by builder identity),
//!    shapes are inferred and every node gets a stage;
//! 2. placement: nodes are assigned to kernel contexts from the root down;
//! 3. linearization: non-empty contexts are ordered dependency-first;
//! 4. codegen: forward bodies, backward kernels, then forward exports.
//!
//! A node's stage counts the materialized edges below it: a computed operand
//! contributes its own stage, plus one when its value has to be handed over
//! through a buffer (it is a reduction, the consumer is a reduction, or it
//! is read through a broadcast or permuted index). Regular contexts hold
//! nodes of a single (stage, size), so every kernel boundary goes from a
//! lower stage to a higher one and the kernel order is acyclic.

use crate::backward;
use crate::context::{ContextArena, ContextId};
use crate::error::{GraphError, Result};
use crate::ir::{Bindings, BufferSource, Expr, KernelSpec, Stmt, bounds_guard, output_name};
use crate::node::{Arg, Builder, BuilderSite, Node, NodeId, NodeKind, OpClass};
use crate::ops::{MovementOp, Op};
use crate::runtime::{BufferRef, PartialGrad, Plan};
use crate::tensor::{TensorId, TensorStore};
use std::collections::HashMap;

pub(crate) struct Compiler<'a> {
    tensors: &'a mut TensorStore,
    nodes: Vec<Node>,
    /// Builder identity -> node; the `Builder` clone keeps the site alive so
    /// its address cannot be reused while the session runs
    memo: HashMap<*const BuilderSite, (Builder, NodeId)>,
    leaves: HashMap<TensorId, NodeId>,
    contexts: ContextArena,
}

impl<'a> Compiler<'a> {
    pub fn new(tensors: &'a mut TensorStore) -> Self {
        Self {
            tensors,
            nodes: Vec::new(),
            memo: HashMap::new(),
            leaves: HashMap::new(),
            contexts: ContextArena::default(),
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    fn push(&mut self, kind: NodeKind, shape: Vec<usize>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            var: format!("v{}", id.0),
            kind,
            operands: Vec::new(),
            class: OpClass::Regular,
            shape,
            stage: 0,
            context: None,
            consumers: Vec::new(),
            code: Vec::new(),
            grad_var: None,
        });
        id
    }

    // ===== LOWERING =====

    /// Lower an argument to a node. Lowering the same builder site twice
    /// returns the same node.
    pub fn lower(&mut self, arg: &Arg) -> Result<NodeId> {
        match arg {
            Arg::Constant(v) => Ok(self.push(NodeKind::Constant(*v), vec![1])),
            Arg::Tensor(t) => {
                if let Some(&id) = self.leaves.get(t) {
                    return Ok(id);
                }
                let shape = self.tensors.get(*t)?.shape.clone();
                let id = self.push(NodeKind::Tensor(*t), shape);
                self.leaves.insert(*t, id);
                Ok(id)
            }
            Arg::Op(builder) => {
                if let Some((_, id)) = self.memo.get(&builder.key()) {
                    return Ok(*id);
                }
                let id = self.lower_op(builder)?;
                self.memo.insert(builder.key(), (builder.clone(), id));
                Ok(id)
            }
        }
    }

    fn lower_op(&mut self, builder: &Builder) -> Result<NodeId> {
        let op = builder.op().clone();
        let mut operands = Vec::with_capacity(builder.args().len() + 1);
        for arg in builder.args() {
            operands.push(self.lower(arg)?);
        }
        if let Op::Dropout(rate) = op {
            if !(0.0..1.0).contains(&rate) {
                return Err(GraphError::InvalidDropoutRate(rate));
            }
            let shape = self.nodes[operands[0].0].shape.clone();
            let mask = self.tensors.add_mask(shape.iter().product(), rate);
            operands.push(self.push(NodeKind::Mask(mask), shape));
        }
        self.make_node(op, &operands)
    }

    fn make_node(&mut self, op: Op, operands: &[NodeId]) -> Result<NodeId> {
        let shapes: Vec<Vec<usize>> = operands
            .iter()
            .map(|o| self.nodes[o.0].shape.clone())
            .collect();
        let (shape, access) = op.infer(&shapes)?;
        let class = op.class();

        let stage = operands
            .iter()
            .zip(&access)
            .map(|(o, a)| {
                let operand = &self.nodes[o.0];
                if !operand.is_computed() {
                    return 0;
                }
                let materialized = operand.class == OpClass::Reduction
                    || class == OpClass::Reduction
                    || !a.is_aligned();
                operand.stage + usize::from(materialized)
            })
            .max()
            .unwrap_or(0);

        let id = self.push(NodeKind::Op(op), shape);
        for o in operands {
            self.nodes[o.0].consumers.push(id);
        }
        let node = &mut self.nodes[id.0];
        node.operands = operands.iter().copied().zip(access).collect();
        node.class = class;
        node.stage = stage;
        Ok(id)
    }

    // ===== PLACEMENT =====

    fn place(&mut self, id: NodeId, current: ContextId) {
        let node = &self.nodes[id.0];
        if node.context.is_some() || !node.is_computed() {
            return;
        }
        let ctx = self
            .contexts
            .use_context(current, node.class, node.stage, node.size());
        self.nodes[id.0].context = Some(ctx);
        self.contexts.get_mut(ctx).nodes.push(id);
        let operands: Vec<NodeId> = self.nodes[id.0].operands.iter().map(|(o, _)| *o).collect();
        for operand in operands {
            self.place(operand, ctx);
        }
    }

    // ===== CODEGEN =====

    fn emit_forward(&mut self, ctx: ContextId) -> Result<Vec<Stmt>> {
        let context = self.contexts.get_mut(ctx);
        context.nodes.sort();
        let nodes = context.nodes.clone();
        let size = context.size;

        let mut body = vec![bounds_guard(size)];
        for id in nodes {
            let operand_refs = self.nodes[id.0].operands.clone();
            let mut operands = Vec::with_capacity(operand_refs.len());
            for operand in operand_refs {
                operands.push(self.contexts.resolve_operand(ctx, &self.nodes, self.tensors, operand)?);
            }
            let node = &mut self.nodes[id.0];
            let NodeKind::Op(op) = &node.kind else {
                continue;
            };
            node.code = op.forward(&node.var, &operands);
            body.extend(node.code.iter().cloned());
            self.contexts
                .get_mut(ctx)
                .shapes
                .insert(node.var.clone(), node.shape.clone());
        }
        Ok(body)
    }

    fn finish_forward(&self, ctx: ContextId, mut body: Vec<Stmt>) -> Result<KernelSpec> {
        let context = self.contexts.get(ctx);
        let mut outputs = Bindings::default();
        for &id in &context.exports {
            let node = &self.nodes[id.0];
            let name = output_name(&node.var);
            let len = context
                .shapes
                .get(&node.var)
                .map_or_else(|| node.size(), |s| s.iter().product());
            outputs.register(&name, len, BufferSource::Local);
            body.push(Stmt::store(name, Expr::Index, Expr::var(node.var.as_str())));
        }
        KernelSpec::new(
            context.label(),
            context.size,
            context.inputs.clone(),
            outputs,
            body,
        )
    }

    /// Compile `root` into an execution plan
    pub fn compile(mut self, root: &Arg, output_shape: &[usize]) -> Result<Plan> {
        let mut root = self.lower(root)?;
        let wanted: usize = output_shape.iter().product();
        let shape = self.nodes[root.0].shape.clone();
        if shape.iter().product::<usize>() != wanted {
            return Err(GraphError::ShapeMismatch {
                op: "output",
                lhs: shape,
                rhs: output_shape.to_vec(),
            });
        }
        // The output always comes out of a kernel
        if !self.nodes[root.0].is_computed() {
            let reshape = Op::Movement(MovementOp::Reshape(output_shape.to_vec()));
            root = self.make_node(reshape, &[root])?;
        }

        let initial = self.contexts.create(OpClass::Regular, 0, wanted);
        self.place(root, initial);
        self.contexts.prune();
        let order = self.contexts.linearize();
        self.contexts.verify_order(&order, &self.nodes)?;

        let root_ctx = self.nodes[root.0]
            .context
            .ok_or(GraphError::CyclicKernels(initial))?;
        self.contexts.get_mut(root_ctx).exports.insert(root);

        let mut bodies = Vec::with_capacity(order.len());
        for &ctx in &order {
            bodies.push(self.emit_forward(ctx)?);
        }

        let params = backward::compile(
            &mut self.nodes,
            &mut self.contexts,
            self.tensors,
            root,
            &order,
        )?;

        // Forward kernels go first, backward kernels mirror them in reverse
        let mut kernels = Vec::with_capacity(order.len() * 2);
        for (&ctx, body) in order.iter().zip(bodies) {
            kernels.push(self.finish_forward(ctx, body)?);
        }
        let forward_count = kernels.len();
        let mut backward_index = HashMap::new();
        for &ctx in order.iter().rev() {
            if let Some(spec) = self.contexts.get(ctx).backward.clone() {
                backward_index.insert(ctx, kernels.len());
                kernels.push(spec);
            }
        }

        let output = BufferRef {
            kernel: order
                .iter()
                .position(|&c| c == root_ctx)
                .ok_or(GraphError::CyclicKernels(root_ctx))?,
            name: output_name(&self.nodes[root.0].var),
        };
        let partials = params
            .into_iter()
            .filter_map(|p| {
                let kernel = *backward_index.get(&p.ctx)?;
                Some(PartialGrad {
                    tensor: p.tensor,
                    buffer: BufferRef {
                        kernel,
                        name: p.name,
                    },
                    access: p.access,
                })
            })
            .collect();

        log::info!(
            "compiled {} nodes into {} forward and {} backward kernels",
            self.nodes.len(),
            forward_count,
            kernels.len() - forward_count
        );
        Plan::new(kernels, forward_count, output, partials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{add, matmul, relu, sigmoid};
    use crate::tensor::TensorKind;

    fn store() -> (TensorStore, TensorId, TensorId, TensorId) {
        let mut store = TensorStore::default();
        let x = store.insert("x", &[4, 2], TensorKind::Input).unwrap();
        let w = store.insert("w", &[2, 3], TensorKind::Parameter).unwrap();
        let b = store.insert("b", &[3], TensorKind::Parameter).unwrap();
        (store, x, w, b)
    }

    #[test]
    fn test_lowering_is_memoized() {
        let (mut store, x, w, _) = store();
        let mut compiler = Compiler::new(&mut store);
        let m = matmul(x, w);
        let first = compiler.lower(&Arg::from(&m)).unwrap();
        let second = compiler.lower(&Arg::from(m.clone())).unwrap();
        assert_eq!(first, second);
        assert_eq!(compiler.node(first).shape, vec![4, 3]);

        // A structurally equal but distinct builder is a different node
        let other = compiler.lower(&Arg::from(matmul(x, w))).unwrap();
        assert_ne!(first, other);
    }

    #[test]
    fn test_matmul_inner_dimension_mismatch() {
        let mut store = TensorStore::default();
        let a = store.insert("a", &[4, 2], TensorKind::Input).unwrap();
        let b = store.insert("b", &[3, 3], TensorKind::Parameter).unwrap();
        let mut compiler = Compiler::new(&mut store);
        let err = compiler.lower(&matmul(a, b).into()).unwrap_err();
        assert!(matches!(err, GraphError::ShapeMismatch { op: "matmul", .. }));
    }

    #[test]
    fn test_stages_count_materialized_edges() {
        let (mut store, x, w, b) = store();
        let mut compiler = Compiler::new(&mut store);
        let m = matmul(x, w);
        let biased = add(&m, b);
        let top = compiler.lower(&relu(&biased).into()).unwrap();
        let m = compiler.lower(&m.into()).unwrap();
        let biased = compiler.lower(&biased.into()).unwrap();
        assert_eq!(compiler.node(m).stage, 0);
        // matmul is a reduction, so its consumer sits one stage above it
        assert_eq!(compiler.node(biased).stage, 1);
        assert_eq!(compiler.node(top).stage, 1);

        let fused = compiler.lower(&relu(sigmoid(x)).into()).unwrap();
        assert_eq!(compiler.node(fused).stage, 0);
    }

    #[test]
    fn test_linear_layer_partitions_into_two_kernels() {
        let (mut store, x, w, b) = store();
        let root = relu(add(matmul(x, w), b));
        let plan = Compiler::new(&mut store).compile(&root.into(), &[4, 3]).unwrap();
        assert_eq!(plan.forward_count, 2);
        // matmul feeds the fused add -> relu kernel
        assert!(plan.kernels[1].inputs.names().any(|n| n.starts_with('v')));
    }
}
