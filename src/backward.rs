//! Backward compiler
//!
//! Emits one gradient kernel per forward context, mirroring the forward
//! partition. Contexts are processed from the last forward kernel to the
//! first, so by the time a context is compiled every consumer of its nodes
//! has already written its gradient partials.
//!
//! Within a Regular kernel each node owns an accumulator `g_<var>`, seeded
//! with 1.0 at the graph root and otherwise with the sum of the partials its
//! consumers in later kernels wrote. Rules then run in reverse emission
//! order, adding into the accumulators of same-kernel operands. Operands
//! living outside the kernel (parameters, hand-offs, broadcast or permuted
//! reads) get a partial buffer `grad_<base>_k<ctx>_output` instead, which the
//! producer's kernel (or the host, for parameters) folds back to its shape.

use crate::context::{ContextArena, ContextId};
use crate::error::Result;
use crate::ir::{Bindings, BufferSource, Expr, KernelSpec, Stmt, bounds_guard, output_name};
use crate::node::{Access, Node, NodeId, NodeKind, OpClass};
use crate::ops::{Operand, ReductionGrad, Source, Values};
use crate::tensor::{Mask, TensorId, TensorKind, TensorStore};
use std::collections::{BTreeSet, HashMap};

/// A parameter partial written by a backward kernel
#[derive(Debug, Clone)]
pub(crate) struct ParamPartial {
    pub tensor: TensorId,
    pub ctx: ContextId,
    /// Output binding name
    pub name: String,
    pub access: Access,
}

/// A partial gradient of a computed node, read by the node's own kernel
#[derive(Debug, Clone)]
struct Partial {
    /// Input binding name (the writer's output minus `_output`)
    name: String,
    access: Access,
    len: usize,
}

/// Where a gradient contribution to an operand goes
enum Target {
    /// No gradient (constants, inputs, masks)
    Drop,
    /// Accumulator of a node in the same kernel
    Local(String),
    /// Partial buffer named after `base`
    Partial { base: String, owner: Owner },
}

#[derive(Clone, Copy)]
enum Owner {
    Node(NodeId),
    Param(TensorId),
}

pub(crate) fn compile(
    nodes: &mut [Node],
    contexts: &mut ContextArena,
    tensors: &TensorStore,
    root: NodeId,
    order: &[ContextId],
) -> Result<Vec<ParamPartial>> {
    let mut partials: HashMap<NodeId, Vec<Partial>> = HashMap::new();
    let mut params = Vec::new();

    for &ctx in order.iter().rev() {
        let context = contexts.get(ctx);
        let (class, size, ids) = (context.class, context.size, context.nodes.clone());
        if class == OpClass::Regular {
            for &id in &ids {
                let node = &mut nodes[id.0];
                node.grad_var = Some(format!("g_{}", node.var));
            }
        }

        let mut kernel = Pending::new(ctx, nodes, tensors);
        let spec = match class {
            OpClass::Regular => kernel.regular(&ids, size, root, &mut partials, &mut params)?,
            OpClass::Reduction => kernel.reduction(&ids, root, &mut partials, &mut params)?,
        };
        let saved = std::mem::take(&mut kernel.saved);
        match &spec {
            Some(spec) => log::debug!(
                "backward_k{ctx}: {} inputs, {} outputs",
                spec.inputs.len(),
                spec.outputs.len()
            ),
            None => log::debug!("backward_k{ctx}: nothing to differentiate"),
        }

        let context = contexts.get_mut(ctx);
        context.exports.extend(saved);
        context.backward = spec;
    }
    Ok(params)
}

/// A backward kernel under construction
struct Pending<'a> {
    ctx: ContextId,
    nodes: &'a [Node],
    tensors: &'a TensorStore,
    inputs: Bindings,
    outputs: Bindings,
    /// Same-kernel forward values the rules read; the forward kernel exports them
    saved: BTreeSet<NodeId>,
}

impl<'a> Pending<'a> {
    fn new(ctx: ContextId, nodes: &'a [Node], tensors: &'a TensorStore) -> Self {
        Self {
            ctx,
            nodes,
            tensors,
            inputs: Bindings::default(),
            outputs: Bindings::default(),
            saved: BTreeSet::new(),
        }
    }

    fn label(&self) -> String {
        format!("backward_k{}", self.ctx)
    }

    /// Forward value source of an operand, as seen from this kernel
    fn source(&mut self, id: NodeId) -> Result<Source> {
        let nodes = self.nodes;
        let node = &nodes[id.0];
        Ok(match &node.kind {
            NodeKind::Constant(v) => Source::Const(*v),
            NodeKind::Tensor(t) => {
                let tensor = self.tensors.get(*t)?;
                let name = tensor.binding_name();
                self.inputs
                    .register(&name, tensor.size(), BufferSource::Tensor(*t));
                Source::Buffer(name)
            }
            NodeKind::Mask(m) => {
                let name = Mask::binding_name(*m);
                self.inputs
                    .register(&name, node.size(), BufferSource::Mask(*m));
                Source::Buffer(name)
            }
            NodeKind::Op(_) => {
                if node.context == Some(self.ctx) {
                    // Registered on first use, see `save`
                    return Ok(Source::Buffer(node.var.clone()));
                }
                self.inputs
                    .register(&node.var, node.size(), BufferSource::Local);
                Source::Buffer(node.var.clone())
            }
        })
    }

    fn save(&mut self, id: NodeId) {
        let node = &self.nodes[id.0];
        let (var, len) = (node.var.clone(), node.size());
        self.saved.insert(id);
        self.inputs.register(&var, len, BufferSource::Local);
    }

    fn target(&self, id: NodeId, access: Access) -> Result<Target> {
        let node = &self.nodes[id.0];
        Ok(match &node.kind {
            NodeKind::Constant(_) | NodeKind::Mask(_) => Target::Drop,
            NodeKind::Tensor(t) => {
                let tensor = self.tensors.get(*t)?;
                if tensor.kind == TensorKind::Input {
                    Target::Drop
                } else {
                    Target::Partial {
                        base: tensor.binding_name(),
                        owner: Owner::Param(*t),
                    }
                }
            }
            NodeKind::Op(_) => match &node.grad_var {
                Some(g) if node.context == Some(self.ctx) && access.is_aligned() => {
                    Target::Local(g.clone())
                }
                _ => Target::Partial {
                    base: node.var.clone(),
                    owner: Owner::Node(id),
                },
            },
        })
    }

    /// Register a fresh partial output for `base`, returning its input name
    fn partial_output(&mut self, base: &str, len: usize) -> String {
        let mut name = format!("grad_{base}_k{}", self.ctx);
        let mut suffix = 1;
        while self.outputs.contains(&output_name(&name)) {
            name = format!("grad_{base}_k{}_{suffix}", self.ctx);
            suffix += 1;
        }
        self.outputs
            .register(&output_name(&name), len, BufferSource::Local);
        name
    }

    fn record(
        &self,
        name: &str,
        owner: Owner,
        access: Access,
        len: usize,
        partials: &mut HashMap<NodeId, Vec<Partial>>,
        params: &mut Vec<ParamPartial>,
    ) {
        match owner {
            Owner::Node(id) => partials.entry(id).or_default().push(Partial {
                name: name.to_string(),
                access,
                len,
            }),
            Owner::Param(tensor) => params.push(ParamPartial {
                tensor,
                ctx: self.ctx,
                name: output_name(name),
                access,
            }),
        }
    }

    /// Register the partials feeding `id` as inputs
    fn upstream(&mut self, id: NodeId, partials: &HashMap<NodeId, Vec<Partial>>) -> Vec<Partial> {
        let upstream = partials.get(&id).cloned().unwrap_or_default();
        for p in &upstream {
            self.inputs.register(&p.name, p.len, BufferSource::Local);
        }
        upstream
    }

    fn finish(&mut self, size: usize, body: Vec<Stmt>) -> Result<Option<KernelSpec>> {
        if self.outputs.is_empty() {
            return Ok(None);
        }
        let inputs = std::mem::take(&mut self.inputs);
        let outputs = std::mem::take(&mut self.outputs);
        KernelSpec::new(self.label(), size, inputs, outputs, body).map(Some)
    }

    fn regular(
        &mut self,
        ids: &[NodeId],
        size: usize,
        root: NodeId,
        partials: &mut HashMap<NodeId, Vec<Partial>>,
        params: &mut Vec<ParamPartial>,
    ) -> Result<Option<KernelSpec>> {
        let nodes = self.nodes;
        let mut seeds = Vec::new();
        for &id in ids {
            let upstream = self.upstream(id, partials);
            let g = grad_var(&nodes[id.0]);
            seeds.extend(seed(&g, id == root, &upstream, Expr::Index, &format!("{g}_f")));
        }

        // (operand, access) -> local partial accumulator
        let mut locals: Vec<(NodeId, Access, String, String, Owner)> = Vec::new();
        let mut rules = Vec::new();
        for &id in ids.iter().rev() {
            let node = &nodes[id.0];
            let NodeKind::Op(op) = &node.kind else {
                continue;
            };
            let mut operands = Vec::with_capacity(node.operands.len());
            let mut same_kernel = Vec::with_capacity(node.operands.len());
            for &(operand, access) in &node.operands {
                let source = self.source(operand)?;
                let producer = &nodes[operand.0];
                let local = producer.is_computed() && producer.context == Some(self.ctx);
                same_kernel.push(local.then_some(operand));
                operands.push(Operand {
                    source,
                    access,
                    shape: producer.shape.clone(),
                });
            }

            let contributions = {
                let mut values = RuleValues {
                    kernel: self,
                    node: id,
                    operands: &operands,
                    same_kernel: &same_kernel,
                };
                op.gradients(Expr::var(grad_var(node)), &mut values)
            };

            for (&(operand, access), contribution) in node.operands.iter().zip(contributions) {
                let Some(contribution) = contribution else {
                    continue;
                };
                match self.target(operand, access)? {
                    Target::Drop => {}
                    Target::Local(g) => rules.push(Stmt::accumulate(g, contribution)),
                    Target::Partial { base, owner } => {
                        let existing = locals
                            .iter()
                            .find(|(o, a, ..)| *o == operand && *a == access)
                            .map(|(_, _, var, ..)| var.clone());
                        let var = existing.unwrap_or_else(|| {
                            let var = format!("gl{}", locals.len());
                            locals.push((operand, access, var.clone(), base, owner));
                            var
                        });
                        rules.push(Stmt::accumulate(var, contribution));
                    }
                }
            }
        }

        let mut body = vec![bounds_guard(size)];
        body.extend(seeds);
        for (_, _, var, _, _) in &locals {
            body.push(Stmt::var(var.as_str(), Expr::f(0.0)));
        }
        body.extend(rules);
        for (_, access, var, base, owner) in locals {
            let name = self.partial_output(&base, size);
            body.push(Stmt::store(
                output_name(&name),
                access.partial_index(),
                Expr::var(var),
            ));
            self.record(&name, owner, access, size, partials, params);
        }

        self.finish(size, body)
    }

    fn reduction(
        &mut self,
        ids: &[NodeId],
        root: NodeId,
        partials: &mut HashMap<NodeId, Vec<Partial>>,
        params: &mut Vec<ParamPartial>,
    ) -> Result<Option<KernelSpec>> {
        let nodes = self.nodes;
        let Some(&id) = ids.first() else {
            return Ok(None);
        };
        let node = &nodes[id.0];
        let NodeKind::Op(op) = &node.kind else {
            return Ok(None);
        };

        let upstream = self.upstream(id, partials);
        let is_root = id == root;
        let seed_fn = |var: &str, at: Expr, loop_var: &str| seed(var, is_root, &upstream, at, loop_var);

        let mut operands = Vec::with_capacity(node.operands.len());
        for &(operand, access) in &node.operands {
            operands.push(Operand {
                source: self.source(operand)?,
                access,
                shape: nodes[operand.0].shape.clone(),
            });
        }
        self.save(id);
        let output = Operand {
            source: Source::Buffer(node.var.clone()),
            access: Access::Aligned,
            shape: node.shape.clone(),
        };

        let mut size = 0;
        let mut body = Vec::new();
        for (i, &(operand, access)) in node.operands.iter().enumerate() {
            let Target::Partial { base, owner } = self.target(operand, access)? else {
                continue;
            };
            let grad = ReductionGrad {
                prefix: format!("{}_d{i}", node.var),
                operands: &operands,
                output: output.clone(),
                shape: &node.shape,
                seed: &seed_fn,
            };
            let (mut stmts, value) = op.reduction_gradient(i, &grad);
            let len = nodes[operand.0].size();
            let name = self.partial_output(&base, len);
            stmts.push(Stmt::store(output_name(&name), Expr::Index, value));
            body.push(Stmt::If {
                cond: Expr::Index.lt(Expr::u(len)),
                body: stmts,
            });
            self.record(&name, owner, Access::Aligned, len, partials, params);
            size = size.max(len);
        }

        self.finish(size, body)
    }
}

fn grad_var(node: &Node) -> String {
    node.grad_var
        .clone()
        .unwrap_or_else(|| format!("g_{}", node.var))
}

/// Declare `var` as the upstream gradient at flat index `at`
fn seed(var: &str, is_root: bool, upstream: &[Partial], at: Expr, loop_var: &str) -> Vec<Stmt> {
    let initial = if is_root { 1.0 } else { 0.0 };
    let mut stmts = vec![Stmt::var(var, Expr::f(initial))];
    for (j, p) in upstream.iter().enumerate() {
        stmts.extend(p.access.fold_into(var, &p.name, at.clone(), &format!("{loop_var}{j}")));
    }
    stmts
}

/// Forward values visible to a Regular rule
struct RuleValues<'k, 'a> {
    kernel: &'k mut Pending<'a>,
    node: NodeId,
    operands: &'k [Operand],
    same_kernel: &'k [Option<NodeId>],
}

impl Values for RuleValues<'_, '_> {
    fn operand(&mut self, i: usize) -> Expr {
        if let Some(Some(id)) = self.same_kernel.get(i) {
            self.kernel.save(*id);
        }
        self.operands
            .get(i)
            .map_or_else(|| Expr::f(0.0), Operand::value)
    }

    fn output(&mut self) -> Expr {
        self.kernel.save(self.node);
        Expr::load(self.kernel.nodes[self.node.0].var.as_str(), Expr::Index)
    }
}
