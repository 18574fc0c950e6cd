//! Eager evaluation with optional recording of a static graph.
//!
//! Models are written once against [`Tracer`]. In eager mode every operator
//! is simply evaluated; in recording mode it is also appended to the graph,
//! checked against the target opset, and the symbolic (dynamic) dimensions
//! of its outputs are derived from those of its inputs.

#[cfg(test)]
#[path = "../tests/unit/tracer_test.rs"]
mod tracer_test;

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::dynamic_axes::DynamicAxisSpec;
use crate::graph::{Attribute, DimSpec, ExportedGraph, Initializer, Node, TensorSpec};
use crate::kernels::{self, BinaryOp};
use crate::opset;
use crate::tensor::{DType, Tensor};

/// Symbolic dimension name.
pub type Symbol = Arc<str>;

/// Handle of a value produced or registered during a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Eager,
    Record { opset: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Input,
    Initializer,
    Intermediate,
}

#[derive(Debug)]
struct Value {
    name: String,
    kind: ValueKind,
    tensor: Arc<Tensor>,
    dims: Vec<Option<Symbol>>,
    /// Symbolic element values of small integer tensors derived from `Shape`.
    elements: Option<Vec<Option<Symbol>>>,
}

/// Result of evaluating one operator output, before it is registered.
struct Computed {
    tensor: Tensor,
    dims: Vec<Option<Symbol>>,
    elements: Option<Vec<Option<Symbol>>>,
}

impl Computed {
    fn new(tensor: Tensor, dims: Vec<Option<Symbol>>) -> Self {
        Self { tensor, dims, elements: None }
    }
}

pub struct Tracer {
    mode: Mode,
    values: Vec<Value>,
    nodes: Vec<Node>,
    scopes: Vec<String>,
    counters: HashMap<String, usize>,
    parameters: HashMap<String, ValueId>,
    specialized: BTreeSet<String>,
}

fn attributes<const N: usize>(pairs: [(&str, Attribute); N]) -> BTreeMap<String, Attribute> {
    pairs.into_iter().map(|(name, value)| (name.to_string(), value)).collect()
}

impl Tracer {
    /// Evaluates operators without recording anything.
    pub fn eager() -> Self {
        Self::with_mode(Mode::Eager)
    }

    /// Evaluates and records operators for the given opset.
    pub fn recording(opset: u32) -> Self {
        Self::with_mode(Mode::Record { opset })
    }

    fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            values: Vec::new(),
            nodes: Vec::new(),
            scopes: Vec::new(),
            counters: HashMap::new(),
            parameters: HashMap::new(),
            specialized: BTreeSet::new(),
        }
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.mode, Mode::Record { .. })
    }

    /// Target opset when recording.
    pub fn opset(&self) -> Option<u32> {
        match self.mode {
            Mode::Eager => None,
            Mode::Record { opset } => Some(opset),
        }
    }

    /// Whether `LayerNormalization` may be emitted as a single operator.
    pub fn supports_fused_layer_norm(&self) -> bool {
        self.opset().is_none_or(|opset| opset >= opset::FUSED_LAYER_NORM)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn tensor(&self, id: ValueId) -> &Tensor {
        &self.values[id.0].tensor
    }

    pub fn shape(&self, id: ValueId) -> &[usize] {
        self.values[id.0].tensor.shape()
    }

    pub fn name(&self, id: ValueId) -> &str {
        &self.values[id.0].name
    }

    /// Symbolic name of `axis` of `id`, if the dimension is still dynamic.
    pub fn symbol(&self, id: ValueId, axis: usize) -> Option<&str> {
        self.values[id.0].dims.get(axis).and_then(|dim| dim.as_deref())
    }

    /// Concrete size of `axis`, baking it into the graph as a constant.
    ///
    /// When the dimension is symbolic, its name is recorded as specialized so
    /// the exporter can reject graphs that would silently lose a dynamic axis.
    pub fn specialize_dim(&mut self, id: ValueId, axis: usize) -> usize {
        if let Some(symbol) = self.values[id.0].dims.get(axis).and_then(Option::as_ref) {
            self.specialized.insert(symbol.to_string());
        }
        self.shape(id)[axis]
    }

    /// Symbols that lost their dynamic nature during the trace.
    pub fn specialized_symbols(&self) -> &BTreeSet<String> {
        &self.specialized
    }

    /// Runs `f` with node names prefixed by `name/`.
    pub fn scope<T>(&mut self, name: &str, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.scopes.push(name.to_string());
        let result = f(self);
        self.scopes.pop();
        result
    }

    fn next_name(&mut self, op_type: &str) -> String {
        let counter = self.counters.entry(op_type.to_string()).or_default();
        let name = format!("{op_type}_{counter}");
        *counter += 1;

        if self.scopes.is_empty() { name } else { format!("{}/{name}", self.scopes.join("/")) }
    }

    fn push_value(&mut self, name: String, kind: ValueKind, tensor: Arc<Tensor>, dims: Vec<Option<Symbol>>) -> ValueId {
        let id = ValueId(self.values.len());
        self.values.push(Value { name, kind, tensor, dims, elements: None });
        id
    }

    /// Registers a graph input. Axes listed in `dynamic` become symbolic.
    pub fn input(&mut self, name: &str, tensor: Tensor, dynamic: Option<&BTreeMap<usize, String>>) -> ValueId {
        let dims = (0..tensor.rank())
            .map(|axis| dynamic.and_then(|axes| axes.get(&axis)).map(|symbol| Symbol::from(symbol.as_str())))
            .collect();
        self.push_value(name.to_string(), ValueKind::Input, Arc::new(tensor), dims)
    }

    /// Registers a named weight; repeated registrations return the same value.
    pub fn parameter(&mut self, name: &str, tensor: &Arc<Tensor>) -> ValueId {
        if let Some(&id) = self.parameters.get(name) {
            return id;
        }
        let dims = vec![None; tensor.rank()];
        let id = self.push_value(name.to_string(), ValueKind::Initializer, Arc::clone(tensor), dims);
        self.parameters.insert(name.to_string(), id);
        id
    }

    /// Registers an anonymous constant.
    pub fn constant(&mut self, tensor: Tensor) -> ValueId {
        let name = self.next_name("Constant");
        let dims = vec![None; tensor.rank()];
        self.push_value(name, ValueKind::Initializer, Arc::new(tensor), dims)
    }

    pub fn scalar(&mut self, value: f32) -> ValueId {
        self.constant(Tensor::scalar_f32(value))
    }

    fn apply(
        &mut self,
        op_type: &str,
        inputs: &[ValueId],
        attributes: BTreeMap<String, Attribute>,
        outputs: Vec<Computed>,
    ) -> Result<Vec<ValueId>> {
        let node_name = self.next_name(op_type);
        let output_names: Vec<String> = (0..outputs.len()).map(|i| format!("{node_name}_output_{i}")).collect();

        if let Mode::Record { opset } = self.mode {
            let node = Node {
                name: node_name,
                op_type: op_type.to_string(),
                inputs: inputs.iter().map(|&id| self.values[id.0].name.clone()).collect(),
                outputs: output_names.clone(),
                attributes,
            };
            opset::check_node(&node, opset)?;
            self.nodes.push(node);
        }

        Ok(outputs
            .into_iter()
            .zip(output_names)
            .map(|(computed, name)| {
                let id = self.push_value(name, ValueKind::Intermediate, Arc::new(computed.tensor), computed.dims);
                self.values[id.0].elements = computed.elements;
                id
            })
            .collect())
    }

    fn apply_one(
        &mut self,
        op_type: &str,
        inputs: &[ValueId],
        attributes: BTreeMap<String, Attribute>,
        output: Computed,
    ) -> Result<ValueId> {
        Ok(self.apply(op_type, inputs, attributes, vec![output])?[0])
    }

    fn dims(&self, id: ValueId) -> Vec<Option<Symbol>> {
        self.values[id.0].dims.clone()
    }

    /// Same dims as `id`, for element-wise operators.
    fn unary(&mut self, op_type: &str, x: ValueId, f: impl Fn(f32) -> f32) -> Result<ValueId> {
        let output = Computed::new(kernels::unary_f32(self.tensor(x), f)?, self.dims(x));
        self.apply_one(op_type, &[x], BTreeMap::new(), output)
    }

    pub fn binary(&mut self, op: BinaryOp, a: ValueId, b: ValueId) -> Result<ValueId> {
        let tensor = kernels::binary(op, self.tensor(a), self.tensor(b))?;
        let dims = broadcast_dims(
            (self.shape(a), &self.values[a.0].dims),
            (self.shape(b), &self.values[b.0].dims),
            tensor.rank(),
        );
        self.apply_one(op.op_type(), &[a, b], BTreeMap::new(), Computed::new(tensor, dims))
    }

    pub fn add(&mut self, a: ValueId, b: ValueId) -> Result<ValueId> {
        self.binary(BinaryOp::Add, a, b)
    }

    pub fn sub(&mut self, a: ValueId, b: ValueId) -> Result<ValueId> {
        self.binary(BinaryOp::Sub, a, b)
    }

    pub fn mul(&mut self, a: ValueId, b: ValueId) -> Result<ValueId> {
        self.binary(BinaryOp::Mul, a, b)
    }

    pub fn div(&mut self, a: ValueId, b: ValueId) -> Result<ValueId> {
        self.binary(BinaryOp::Div, a, b)
    }

    pub fn pow(&mut self, a: ValueId, b: ValueId) -> Result<ValueId> {
        self.binary(BinaryOp::Pow, a, b)
    }

    pub fn sqrt(&mut self, x: ValueId) -> Result<ValueId> {
        self.unary("Sqrt", x, f32::sqrt)
    }

    pub fn erf(&mut self, x: ValueId) -> Result<ValueId> {
        self.unary("Erf", x, kernels::erf)
    }

    fn matmul_output_dims(&self, a: ValueId, b: ValueId) -> Vec<Option<Symbol>> {
        let mut dims = self.dims(a);
        dims.pop();
        dims.push(self.values[b.0].dims.last().cloned().flatten());
        dims
    }

    pub fn matmul(&mut self, a: ValueId, b: ValueId) -> Result<ValueId> {
        let tensor = kernels::matmul(self.tensor(a), self.tensor(b))?;
        let dims = self.matmul_output_dims(a, b);
        self.apply_one("MatMul", &[a, b], BTreeMap::new(), Computed::new(tensor, dims))
    }

    pub fn matmul_integer(&mut self, a: ValueId, b: ValueId, a_zero_point: ValueId, b_zero_point: ValueId) -> Result<ValueId> {
        let tensor = kernels::matmul_integer(
            self.tensor(a),
            self.tensor(b),
            self.tensor(a_zero_point),
            self.tensor(b_zero_point),
        )?;
        let dims = self.matmul_output_dims(a, b);
        self.apply_one("MatMulInteger", &[a, b, a_zero_point, b_zero_point], BTreeMap::new(), Computed::new(tensor, dims))
    }

    pub fn softmax(&mut self, x: ValueId, axis: i64) -> Result<ValueId> {
        let output = Computed::new(kernels::softmax(self.tensor(x), axis)?, self.dims(x));
        self.apply_one("Softmax", &[x], attributes([("axis", Attribute::Int(axis))]), output)
    }

    /// Mean over `axis`, keeping the reduced dimension.
    pub fn reduce_mean(&mut self, x: ValueId, axis: i64) -> Result<ValueId> {
        let tensor = kernels::reduce_mean(self.tensor(x), axis)?;
        let mut dims = self.dims(x);
        if let Some(last) = dims.last_mut() {
            *last = None;
        }
        let attrs = attributes([("axes", Attribute::Ints(vec![axis])), ("keepdims", Attribute::Int(1))]);
        self.apply_one("ReduceMean", &[x], attrs, Computed::new(tensor, dims))
    }

    pub fn transpose(&mut self, x: ValueId, perm: &[usize]) -> Result<ValueId> {
        let tensor = kernels::transpose(self.tensor(x), perm)?;
        let source = &self.values[x.0].dims;
        let dims = perm.iter().map(|&p| source[p].clone()).collect();
        let perm_attr = Attribute::Ints(perm.iter().map(|&p| p as i64).collect());
        self.apply_one("Transpose", &[x], attributes([("perm", perm_attr)]), Computed::new(tensor, dims))
    }

    /// Reshape to `target`, where `0` copies an input dimension and `-1` is inferred.
    pub fn reshape(&mut self, x: ValueId, target: &[i64]) -> Result<ValueId> {
        let tensor = kernels::reshape(self.tensor(x), target)?;
        let source = self.dims(x);

        // Symbols not carried over by a `0` either flow into the inferred axis or are lost.
        let copied = |axis: usize| target.get(axis) == Some(&0);
        let moving: Vec<Symbol> = source
            .iter()
            .enumerate()
            .filter(|&(axis, _)| !copied(axis))
            .filter_map(|(_, symbol)| symbol.clone())
            .collect();
        let inferred = target.iter().position(|&d| d == -1);

        let dims = target
            .iter()
            .enumerate()
            .map(|(axis, &d)| match d {
                0 => source.get(axis).cloned().flatten(),
                -1 => match moving.as_slice() {
                    [] => None,
                    [single] => Some(single.clone()),
                    many => Some(Symbol::from(many.iter().map(|s| s.to_string()).collect::<Vec<_>>().join("*"))),
                },
                _ => None,
            })
            .collect();
        if inferred.is_none() {
            self.specialized.extend(moving.iter().map(|symbol| symbol.to_string()));
        }

        let shape = self.constant(Tensor::vector_i64(target.to_vec()));
        self.apply_one("Reshape", &[x, shape], BTreeMap::new(), Computed::new(tensor, dims))
    }

    /// Rows of `table` selected by `indices` (axis 0).
    pub fn gather(&mut self, table: ValueId, indices: ValueId) -> Result<ValueId> {
        let tensor = kernels::gather(self.tensor(table), self.tensor(indices))?;
        let mut dims = self.dims(indices);
        dims.extend(self.values[table.0].dims.iter().skip(1).cloned());

        // Picking a dimension out of a `Shape` result keeps its symbol.
        let elements = self.values[table.0].elements.as_ref().and_then(|symbols| {
            let picked = self.tensor(indices).as_i64().ok()?;
            picked
                .iter()
                .map(|&i| {
                    let i = if i < 0 { i + symbols.len() as i64 } else { i };
                    symbols.get(i as usize).cloned()
                })
                .collect::<Option<Vec<_>>>()
        });

        let output = Computed { tensor, dims, elements };
        self.apply_one("Gather", &[table, indices], attributes([("axis", Attribute::Int(0))]), output)
    }

    /// Inserts size-one axes. The axes travel as an input from opset 13 on.
    pub fn unsqueeze(&mut self, x: ValueId, axes: &[i64]) -> Result<ValueId> {
        let tensor = kernels::unsqueeze(self.tensor(x), axes)?;
        let source = &self.values[x.0];
        let output_rank = tensor.rank() as i64;
        let mut inserted: Vec<usize> =
            axes.iter().map(|&axis| (if axis < 0 { axis + output_rank } else { axis }) as usize).collect();
        inserted.sort_unstable();
        let mut dims = source.dims.clone();
        for axis in inserted {
            dims.insert(axis, None);
        }
        let output = Computed { tensor, dims, elements: source.elements.clone() };

        let axes_as_input = self.opset().is_some_and(|opset| opset >= opset::UNSQUEEZE_AXES_AS_INPUT);
        if axes_as_input {
            let axes = self.constant(Tensor::vector_i64(axes.to_vec()));
            self.apply_one("Unsqueeze", &[x, axes], BTreeMap::new(), output)
        } else {
            self.apply_one("Unsqueeze", &[x], attributes([("axes", Attribute::Ints(axes.to_vec()))]), output)
        }
    }

    /// 1-D tensor of the dimensions of `x`; symbolic dimensions stay symbolic.
    pub fn shape_of(&mut self, x: ValueId) -> Result<ValueId> {
        let tensor = kernels::shape_of(self.tensor(x));
        let output = Computed { tensor, dims: vec![None], elements: Some(self.dims(x)) };
        self.apply_one("Shape", &[x], BTreeMap::new(), output)
    }

    /// `[start, limit)` with step `delta`; all three are int64 scalars.
    pub fn range(&mut self, start: ValueId, limit: ValueId, delta: ValueId) -> Result<ValueId> {
        let scalar = |tracer: &Self, id: ValueId| -> Result<i64> {
            tracer.tensor(id).as_i64()?.first().copied().ok_or_else(|| anyhow::anyhow!("Range expects scalar operands"))
        };
        let tensor = kernels::range(scalar(self, start)?, scalar(self, limit)?, scalar(self, delta)?)?;
        let length = self.values[limit.0].elements.as_ref().and_then(|symbols| symbols.first().cloned().flatten());
        self.apply_one("Range", &[start, limit, delta], BTreeMap::new(), Computed::new(tensor, vec![length]))
    }

    pub fn cast(&mut self, x: ValueId, to: DType) -> Result<ValueId> {
        let tensor = kernels::cast(self.tensor(x), to)?;
        let source = &self.values[x.0];
        let output = Computed { tensor, dims: source.dims.clone(), elements: source.elements.clone() };
        self.apply_one("Cast", &[x], attributes([("to", Attribute::Int(to.type_code()))]), output)
    }

    /// Fused layer normalization over the last axis (opset 17 and later).
    pub fn layer_normalization(&mut self, x: ValueId, gamma: ValueId, beta: ValueId, epsilon: f32) -> Result<ValueId> {
        let tensor = kernels::layer_norm(self.tensor(x), self.tensor(gamma), self.tensor(beta), epsilon)?;
        let attrs = attributes([("axis", Attribute::Int(-1)), ("epsilon", Attribute::Float(epsilon))]);
        let output = Computed::new(tensor, self.dims(x));
        self.apply_one("LayerNormalization", &[x, gamma, beta], attrs, output)
    }

    /// `(q - zero_point) * scale`; `axis` selects per-channel parameters.
    pub fn dequantize_linear(&mut self, q: ValueId, scale: ValueId, zero_point: ValueId, axis: Option<usize>) -> Result<ValueId> {
        let tensor = kernels::dequantize_linear(self.tensor(q), self.tensor(scale), self.tensor(zero_point), axis.unwrap_or(0))?;
        let attrs = match axis {
            Some(axis) => attributes([("axis", Attribute::Int(axis as i64))]),
            None => BTreeMap::new(),
        };
        let output = Computed::new(tensor, self.dims(q));
        self.apply_one("DequantizeLinear", &[q, scale, zero_point], attrs, output)
    }

    /// Returns `(quantized, scale, zero_point)`.
    pub fn dynamic_quantize_linear(&mut self, x: ValueId) -> Result<(ValueId, ValueId, ValueId)> {
        let (y, scale, zero_point) = kernels::dynamic_quantize_linear(self.tensor(x))?;
        let outputs = vec![
            Computed::new(y, self.dims(x)),
            Computed::new(scale, Vec::new()),
            Computed::new(zero_point, Vec::new()),
        ];
        let ids = self.apply("DynamicQuantizeLinear", &[x], BTreeMap::new(), outputs)?;
        Ok((ids[0], ids[1], ids[2]))
    }

    pub fn identity(&mut self, x: ValueId) -> Result<ValueId> {
        let source = &self.values[x.0];
        let output = Computed { tensor: source.tensor.as_ref().clone(), dims: source.dims.clone(), elements: None };
        self.apply_one("Identity", &[x], BTreeMap::new(), output)
    }

    /// Finishes a recording trace.
    ///
    /// `outputs` are renamed to their declared names; only initializers that
    /// some node reads end up in the graph.
    pub fn into_graph(mut self, outputs: &[(ValueId, &str)], dynamic_axes: &DynamicAxisSpec) -> Result<ExportedGraph> {
        let Mode::Record { opset } = self.mode else {
            anyhow::bail!("Cannot build a graph from an eager evaluation");
        };

        let mut renamed = BTreeSet::new();
        let mut output_ids = Vec::with_capacity(outputs.len());
        for &(id, name) in outputs {
            let id = if self.values[id.0].kind == ValueKind::Intermediate && renamed.insert(id) {
                id
            } else {
                self.identity(id)?
            };
            self.rename(id, name);
            output_ids.push(id);
        }

        let spec = |value: &Value| TensorSpec {
            name: value.name.clone(),
            dtype: value.tensor.dtype(),
            dims: value
                .tensor
                .shape()
                .iter()
                .zip(&value.dims)
                .map(|(&size, symbol)| match symbol {
                    Some(symbol) => DimSpec::Symbolic(symbol.to_string()),
                    None => DimSpec::Fixed(size),
                })
                .collect(),
        };

        let inputs = self.values.iter().filter(|value| value.kind == ValueKind::Input).map(spec).collect();
        let output_specs = output_ids.iter().map(|id| spec(&self.values[id.0])).collect();

        let referenced: BTreeSet<&str> =
            self.nodes.iter().flat_map(|node| node.inputs.iter().map(String::as_str)).collect();
        let initializers = self
            .values
            .iter()
            .filter(|value| value.kind == ValueKind::Initializer && referenced.contains(value.name.as_str()))
            .map(|value| Initializer { name: value.name.clone(), tensor: Arc::clone(&value.tensor) })
            .collect();

        Ok(ExportedGraph {
            producer: ExportedGraph::PRODUCER.to_string(),
            opset,
            inputs,
            outputs: output_specs,
            nodes: self.nodes,
            initializers,
            dynamic_axes: dynamic_axes.clone(),
        })
    }

    fn rename(&mut self, id: ValueId, name: &str) {
        let old = std::mem::replace(&mut self.values[id.0].name, name.to_string());
        for node in &mut self.nodes {
            node.inputs.iter_mut().chain(node.outputs.iter_mut()).filter(|n| **n == old).for_each(|n| *n = name.to_string());
        }
    }
}

/// Symbolic dims of a broadcast result.
fn broadcast_dims(
    (a_shape, a_dims): (&[usize], &[Option<Symbol>]),
    (b_shape, b_dims): (&[usize], &[Option<Symbol>]),
    rank: usize,
) -> Vec<Option<Symbol>> {
    let aligned = |shape: &[usize], dims: &[Option<Symbol>], axis: usize| -> (usize, Option<Symbol>) {
        let offset = rank - shape.len();
        if axis < offset { (1, None) } else { (shape[axis - offset], dims.get(axis - offset).cloned().flatten()) }
    };

    (0..rank)
        .map(|axis| {
            let (a_size, a_symbol) = aligned(a_shape, a_dims, axis);
            let (b_size, b_symbol) = aligned(b_shape, b_dims, axis);
            match (a_size, b_size) {
                (x, y) if x == y => a_symbol.or(b_symbol),
                (1, _) => b_symbol,
                _ => a_symbol,
            }
        })
        .collect()
}
