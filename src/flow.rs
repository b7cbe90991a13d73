//! Flow-node runtime and graph builder.
//!
//! Each output variable's definition is lowered into a sub-DAG of flow nodes
//! rooted at a validator, and each output file gets a write node consuming
//! its validators. Nodes live in an arena owned by [`Graph`]; edges are
//! argument slots holding arena indices, so no node owns another.
//!
//! A node does one thing: given an index request it produces the physical
//! array slice for that request, or just the metadata when the request is the
//! probe. Evaluation is entirely pull-based; no intermediate whole-array
//! value is ever materialized.
//!
//! [`Graph`]: struct.Graph.html

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use crate::array::{AttrValue, Attrs, Datatype, PhysArray, Positive};
use crate::catalog::Catalog;
use crate::functions::{ArgInfo, ArgValue, Function, FunctionError, FunctionRegistry, LookupError};
use crate::index::{compose, normalize, selection_shape, IndexError, Request, Selector};
use crate::io::{Format, IoError, Store};
use crate::parse::{parse_definition, Expr, ParseError};
use crate::spec::{Definition, DimensionSpec, Direction, Specification, VariableSpec};
use crate::units::{Units, UnitsError};

/// Arena index of a flow node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeId(u32);

impl NodeId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
pub enum FlowError {
    Index(IndexError),
    Io(IoError),
    Units(UnitsError),
    Function(FunctionError),
    Cast {
        variable: String,
        from: Datatype,
        to: Datatype,
    },
    PositiveUnset {
        variable: String,
    },
}

impl From<IndexError> for FlowError {
    fn from(err: IndexError) -> Self {
        FlowError::Index(err)
    }
}

impl From<IoError> for FlowError {
    fn from(err: IoError) -> Self {
        FlowError::Io(err)
    }
}

impl From<UnitsError> for FlowError {
    fn from(err: UnitsError) -> Self {
        FlowError::Units(err)
    }
}

impl From<FunctionError> for FlowError {
    fn from(err: FunctionError) -> Self {
        FlowError::Function(err)
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowError::Index(err) => write!(f, "{}", err),
            FlowError::Io(err) => write!(f, "{}", err),
            FlowError::Units(err) => write!(f, "{}", err),
            FlowError::Function(err) => write!(f, "{}", err),
            FlowError::Cast { variable, from, to } => write!(
                f,
                "variable \"{}\" cannot cast {} data to declared datatype {}",
                variable, from, to
            ),
            FlowError::PositiveUnset { variable } => write!(
                f,
                "variable \"{}\" declares a positive direction but its data carries none",
                variable
            ),
        }
    }
}

#[derive(Debug)]
pub enum BuildError {
    Parse {
        variable: String,
        inner: ParseError,
    },
    Lookup(LookupError),
    Cycle(String),
    Spec(String),
    Flow(FlowError),
}

impl From<LookupError> for BuildError {
    fn from(err: LookupError) -> Self {
        BuildError::Lookup(err)
    }
}

impl From<FlowError> for BuildError {
    fn from(err: FlowError) -> Self {
        BuildError::Flow(err)
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::Parse { variable, inner } => {
                write!(f, "definition of \"{}\": {}", variable, inner)
            }
            BuildError::Lookup(err) => write!(f, "{}", err),
            BuildError::Cycle(name) => {
                write!(f, "definitions form a cycle through \"{}\"", name)
            }
            BuildError::Spec(reason) => write!(f, "{}", reason),
            BuildError::Flow(err) => write!(f, "{}", err),
        }
    }
}

/// A runtime check violation. Warnings never fail a run; the host collects
/// them after execution.
#[derive(Clone, PartialEq, Debug)]
pub struct ValidationWarning {
    pub variable: String,
    pub check: String,
    pub message: String,
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.variable, self.message)
    }
}

/// An argument slot of an evaluation node.
#[derive(Clone, Debug)]
pub enum Slot {
    Node(NodeId),
    Const(ArgValue),
}

/// A source holding a precomputed array.
pub struct DataNode {
    pub array: PhysArray,
}

/// A source bound to one catalog variable. The node-fixed subset indices and
/// the request-time selectors are composed on every read.
pub struct ReadNode {
    pub variable: String,
    pub file: String,
    pub indices: Vec<Selector>,
}

/// Applies one registered operation to its argument slots.
pub struct EvalNode {
    pub implementation: Rc<dyn Function>,
    pub slots: Vec<Slot>,
    /// Result units, fixed by the reconciler.
    pub units: Option<Units>,
    /// Result dimensions, fixed by the reconciler.
    pub dims: Option<Vec<String>>,
}

/// Renames dimensions without touching data.
pub struct MapNode {
    pub input: NodeId,
    /// input dimension name to output dimension name
    pub mapping: BTreeMap<String, String>,
}

/// Resolution state of a validator, advanced by the reconciler.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ValidateState {
    Created,
    UnitsResolved,
    DimensionsResolved,
    Ready,
}

/// Numeric range checks carried by a validator.
#[derive(Clone, Copy, Default, Debug)]
pub struct RangeChecks {
    pub valid_min: Option<f64>,
    pub valid_max: Option<f64>,
    pub ok_min_mean_abs: Option<f64>,
    pub ok_max_mean_abs: Option<f64>,
}

impl RangeChecks {
    fn from_attrs(attrs: &Attrs) -> Self {
        let get = |name: &str| attrs.get(name).and_then(|value| value.as_f64());
        RangeChecks {
            valid_min: get("valid_min"),
            valid_max: get("valid_max"),
            ok_min_mean_abs: get("ok_min_mean_abs"),
            ok_max_mean_abs: get("ok_max_mean_abs"),
        }
    }
}

/// The logical sink of one output variable: enforces the declared contract
/// and carries the attributes the writer emits.
pub struct ValidateNode {
    pub variable: String,
    pub input: NodeId,
    pub datatype: Datatype,
    pub dims: Vec<String>,
    pub units: Units,
    pub positive: Option<Positive>,
    pub direction: Option<Direction>,
    pub coordinate: bool,
    pub attrs: Attrs,
    pub checks: RangeChecks,
    pub state: ValidateState,
}

/// Write-side lifecycle of an output file.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WriteState {
    Closed,
    Open,
    Executing,
}

/// The true sink: one per output file.
pub struct WriteNode {
    pub file: String,
    pub format: Format,
    pub attrs: Attrs,
    pub dimensions: BTreeMap<String, DimensionSpec>,
    pub inputs: Vec<NodeId>,
    /// Dimensions whose direction disagrees with the declaration; reads are
    /// mirrored along them. Fixed by the reconciler.
    pub inverted: BTreeSet<String>,
    pub state: Cell<WriteState>,
}

pub enum FlowNode {
    Data(DataNode),
    Read(ReadNode),
    Eval(EvalNode),
    Map(MapNode),
    Validate(ValidateNode),
    Write(WriteNode),
}

/// The dataflow graph for one run: an arena of nodes plus the shared context
/// needed to evaluate them.
pub struct Graph<'a> {
    pub(crate) nodes: Vec<FlowNode>,
    pub(crate) catalog: &'a Catalog,
    pub(crate) registry: &'a FunctionRegistry,
    pub(crate) store: &'a dyn Store,
    warnings: RefCell<Vec<ValidationWarning>>,
    write_nodes: Vec<NodeId>,
}

impl<'a> Graph<'a> {
    /// Lowers every output variable of the specification into the graph and
    /// verifies it is acyclic.
    pub fn build(
        spec: &Specification,
        catalog: &'a Catalog,
        registry: &'a FunctionRegistry,
        store: &'a dyn Store,
    ) -> Result<Self, BuildError> {
        let mut graph = Graph {
            nodes: Vec::new(),
            catalog,
            registry,
            store,
            warnings: RefCell::new(Vec::new()),
            write_nodes: Vec::new(),
        };

        let mut builder = Builder {
            spec,
            lowered: BTreeMap::new(),
            in_progress: BTreeSet::new(),
        };

        for file in &spec.files {
            let mut inputs = Vec::new();
            for var in &file.variables {
                let sink = builder.lower_variable(&mut graph, var)?;
                inputs.push(sink);
            }

            let id = graph.add_node(FlowNode::Write(WriteNode {
                file: file.name.clone(),
                format: file.format,
                attrs: file.attrs.clone(),
                dimensions: file.dimensions.clone(),
                inputs,
                inverted: BTreeSet::new(),
                state: Cell::new(WriteState::Closed),
            }));
            graph.write_nodes.push(id);
        }

        graph.cycle_guard()?;
        Ok(graph)
    }

    pub(crate) fn add_node(&mut self, node: FlowNode) -> NodeId {
        assert!(
            self.nodes.len() <= u32::MAX as usize,
            "maximum number of flow nodes exceeded"
        );
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: NodeId) -> &FlowNode {
        &self.nodes[id.index()]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut FlowNode {
        &mut self.nodes[id.index()]
    }

    pub fn write_nodes(&self) -> &[NodeId] {
        &self.write_nodes
    }

    /// The validator of an output variable, if it exists.
    pub fn validator(&self, variable: &str) -> Option<NodeId> {
        self.nodes.iter().enumerate().find_map(|(at, node)| {
            match node {
                FlowNode::Validate(validate) if validate.variable == variable => {
                    Some(NodeId(at as u32))
                }
                _ => None,
            }
        })
    }

    pub fn take_warnings(&self) -> Vec<ValidationWarning> {
        self.warnings.borrow_mut().drain(..).collect()
    }

    pub(crate) fn warn(&self, warning: ValidationWarning) {
        self.warnings.borrow_mut().push(warning);
    }

    /// Direct data inputs of a node, in slot order.
    pub(crate) fn inputs_of(&self, id: NodeId) -> Vec<NodeId> {
        match self.node(id) {
            FlowNode::Data(_) | FlowNode::Read(_) => Vec::new(),
            FlowNode::Eval(eval) => eval
                .slots
                .iter()
                .filter_map(|slot| match slot {
                    Slot::Node(input) => Some(*input),
                    Slot::Const(_) => None,
                })
                .collect(),
            FlowNode::Map(map) => vec![map.input],
            FlowNode::Validate(validate) => vec![validate.input],
            FlowNode::Write(write) => write.inputs.clone(),
        }
    }

    fn cycle_guard(&self) -> Result<(), BuildError> {
        let mut dag = DiGraph::<NodeId, ()>::new();
        let indices = (0..self.nodes.len())
            .map(|at| dag.add_node(NodeId(at as u32)))
            .collect::<Vec<_>>();

        for at in 0..self.nodes.len() {
            for input in self.inputs_of(NodeId(at as u32)) {
                dag.add_edge(indices[input.index()], indices[at], ());
            }
        }

        match toposort(&dag, None) {
            Ok(_) => Ok(()),
            Err(cycle) => {
                let id = dag[cycle.node_id()];
                Err(BuildError::Cycle(self.describe(id)))
            }
        }
    }

    fn describe(&self, id: NodeId) -> String {
        match self.node(id) {
            FlowNode::Data(data) => data.array.name.clone(),
            FlowNode::Read(read) => read.variable.clone(),
            FlowNode::Eval(eval) => eval.implementation.name().to_owned(),
            FlowNode::Map(_) => String::from("map"),
            FlowNode::Validate(validate) => validate.variable.clone(),
            FlowNode::Write(write) => write.file.clone(),
        }
    }

    /// Pulls a slice through the graph.
    pub fn pull(&self, id: NodeId, request: &Request) -> Result<PhysArray, FlowError> {
        match self.node(id) {
            FlowNode::Data(data) => self.pull_data(data, request),
            FlowNode::Read(read) => self.pull_read(read, request),
            FlowNode::Eval(eval) => self.pull_eval(eval, request),
            FlowNode::Map(map) => self.pull_map(map, request),
            FlowNode::Validate(validate) => self.pull_validate(validate, request),
            FlowNode::Write(_) => unreachable!("write nodes are executed, not pulled"),
        }
    }

    /// Metadata of a slot as seen by the unit and dimension rules. Constant
    /// scalars become numbers, everything else is probed.
    pub(crate) fn slot_info(&self, slot: &Slot) -> Result<ArgInfo, FlowError> {
        match slot {
            Slot::Const(ArgValue::Str(text)) => Ok(ArgInfo::Str(text.clone())),
            Slot::Const(ArgValue::Array(array)) => Ok(if array.is_scalar() {
                ArgInfo::Num(array.data[0])
            } else {
                ArgInfo::Data {
                    units: array.units.clone(),
                    dims: array.dims.clone(),
                    positive: array.positive,
                }
            }),
            Slot::Node(id) => {
                let probe = self.pull(*id, &Request::Probe)?;
                Ok(ArgInfo::Data {
                    units: probe.units,
                    dims: probe.dims,
                    positive: probe.positive,
                })
            }
        }
    }

    fn pull_data(&self, node: &DataNode, request: &Request) -> Result<PhysArray, FlowError> {
        match request.align(&node.array.dims)? {
            None => Ok(probe_of(&node.array)),
            Some(selectors) => {
                let selection = selectors
                    .iter()
                    .zip(node.array.shape.iter())
                    .map(|(selector, size)| normalize(selector, *size))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(node.array.slice(&selection))
            }
        }
    }

    fn pull_read(&self, node: &ReadNode, request: &Request) -> Result<PhysArray, FlowError> {
        // The backing file is open only for the duration of this read.
        let mut handle = self.store.open_read(&node.file)?;

        let variables = handle.variables();
        let info = variables
            .iter()
            .find(|var| var.name == node.variable)
            .ok_or_else(|| IoError::UnknownVariable {
                file: node.file.clone(),
                variable: node.variable.clone(),
            })?;

        let file_dims = info.dimensions.clone();
        let dim_table = handle.dimensions();
        let sizes = file_dims
            .iter()
            .map(|dim| {
                dim_table
                    .iter()
                    .find(|have| &have.name == dim)
                    .map(|have| have.size)
                    .ok_or_else(|| IoError::UnknownDimension {
                        file: node.file.clone(),
                        dimension: dim.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        // First layer: the node-fixed subset window.
        let aligned = Request::Ordered(node.indices.clone())
            .align(&file_dims)?
            .unwrap();
        let inner = aligned
            .iter()
            .zip(sizes.iter())
            .map(|(selector, size)| normalize(selector, *size))
            .collect::<Result<Vec<_>, _>>()?;

        let visible = file_dims
            .iter()
            .zip(inner.iter())
            .filter_map(|(dim, selector)| selector.len().map(|len| (dim.clone(), len)))
            .collect::<Vec<_>>();
        let visible_dims = visible.iter().map(|(dim, _)| dim.clone()).collect::<Vec<_>>();

        let units = Units::from_attrs(
            info.attrs.get("units").and_then(|value| value.as_str()),
            info.attrs.get("calendar").and_then(|value| value.as_str()),
        )?;
        let positive = info
            .attrs
            .get("positive")
            .and_then(|value| value.as_str())
            .and_then(Positive::parse);

        let scale = info
            .attrs
            .get("scale_factor")
            .and_then(|value| value.as_f64());
        let offset = info
            .attrs
            .get("add_offset")
            .and_then(|value| value.as_f64());
        let packed = scale.is_some() || offset.is_some();

        let datatype = if packed || info.datatype == Datatype::F32 {
            Datatype::F64
        } else {
            info.datatype
        };

        let name = if node.indices.is_empty() {
            node.variable.clone()
        } else {
            let indices = node
                .indices
                .iter()
                .map(|selector| selector.to_string())
                .collect::<Vec<_>>();
            format!("{}[{}]", node.variable, indices.join(", "))
        };

        match request.align(&visible_dims)? {
            None => Ok(PhysArray {
                name,
                data: Vec::new(),
                shape: vec![0; visible_dims.len()],
                dims: visible_dims,
                units,
                positive,
                datatype,
            }),
            Some(selectors) => {
                // Second layer: the caller's request, composed through the
                // window.
                let outer = selectors
                    .iter()
                    .zip(visible.iter())
                    .map(|(selector, (_, len))| normalize(selector, *len))
                    .collect::<Result<Vec<_>, _>>()?;
                let selection = compose(&outer, &inner);

                let (raw, _) = handle.read(&node.variable, &selection)?;
                let mut data = raw.to_f64();
                if packed {
                    let scale = scale.unwrap_or(1.0);
                    let offset = offset.unwrap_or(0.0);
                    for value in &mut data {
                        *value = *value * scale + offset;
                    }
                }

                let shape = selection_shape(&selection);
                let dims = file_dims
                    .iter()
                    .zip(selection.iter())
                    .filter(|(_, selector)| selector.len().is_some())
                    .map(|(dim, _)| dim.clone())
                    .collect();

                Ok(PhysArray {
                    name,
                    data,
                    shape,
                    dims,
                    units,
                    positive,
                    datatype,
                })
            }
        }
    }

    fn pull_eval(&self, node: &EvalNode, request: &Request) -> Result<PhysArray, FlowError> {
        let request = self.eval_request(node, request)?;

        let mut args = Vec::with_capacity(node.slots.len());
        for slot in &node.slots {
            match slot {
                Slot::Const(value) => args.push(value.clone()),
                Slot::Node(input) => {
                    args.push(ArgValue::Array(self.pull(*input, &request)?));
                }
            }
        }

        Ok(node.implementation.value(&args)?)
    }

    /// The request an evaluation forwards to its inputs. Ordered selectors
    /// are positional in this node's result dimensions; turn them into a
    /// named request so they survive the trip through inputs with differently
    /// ordered or reduced dimensions. Selectors along sum-like dimensions are
    /// dropped so the reduction always sees the full axis.
    fn eval_request(&self, node: &EvalNode, request: &Request) -> Result<Request, FlowError> {
        let mut request = match (request, &node.dims) {
            (Request::Ordered(selectors), Some(dims)) if !selectors.is_empty() => {
                let aligned = request.align(dims)?.unwrap();
                Request::Named(dims.iter().cloned().zip(aligned.into_iter()).collect())
            }
            _ => request.clone(),
        };

        if let Request::Named(map) = &mut request {
            let infos = node.slots.iter().map(shallow_info).collect::<Vec<_>>();
            for dim in node.implementation.sum_dims(&infos) {
                map.remove(&dim);
            }
        }

        Ok(request)
    }

    fn pull_map(&self, node: &MapNode, request: &Request) -> Result<PhysArray, FlowError> {
        // Translate the request through the inverse of the rename map.
        let translated = match request {
            Request::Named(map) => {
                let inverse = node
                    .mapping
                    .iter()
                    .map(|(input, output)| (output.clone(), input.clone()))
                    .collect::<BTreeMap<_, _>>();
                Request::Named(
                    map.iter()
                        .map(|(dim, selector)| {
                            let dim = inverse.get(dim).cloned().unwrap_or_else(|| dim.clone());
                            (dim, *selector)
                        })
                        .collect(),
                )
            }
            other => other.clone(),
        };

        let mut result = self.pull(node.input, &translated)?;
        for dim in &mut result.dims {
            if let Some(renamed) = node.mapping.get(dim) {
                *dim = renamed.clone();
            }
        }
        Ok(result)
    }

    fn pull_validate(
        &self,
        node: &ValidateNode,
        request: &Request,
    ) -> Result<PhysArray, FlowError> {
        let named;
        let request = match request {
            Request::Ordered(selectors) if !selectors.is_empty() => {
                let aligned = request.align(&node.dims)?.unwrap();
                named = Request::Named(
                    node.dims.iter().cloned().zip(aligned.into_iter()).collect(),
                );
                &named
            }
            other => other,
        };

        let mut result = self.pull(node.input, request)?;

        if !result.datatype.castable_to(node.datatype) {
            return Err(FlowError::Cast {
                variable: node.variable.clone(),
                from: result.datatype,
                to: node.datatype,
            });
        }
        result.datatype = node.datatype;

        if let Some(declared) = node.positive {
            match result.positive {
                Some(actual) if actual != declared => {
                    for value in &mut result.data {
                        *value = -*value;
                    }
                    result.positive = Some(declared);
                }
                Some(_) => {}
                None => {
                    return Err(FlowError::PositiveUnset {
                        variable: node.variable.clone(),
                    })
                }
            }
        }

        self.run_checks(node, &result);

        result.name = node.variable.clone();
        result.units = node.units.clone();
        Ok(result)
    }

    fn run_checks(&self, node: &ValidateNode, result: &PhysArray) {
        if result.data.is_empty() {
            return;
        }

        if let Some(valid_min) = node.checks.valid_min {
            let minimum = result.data.iter().cloned().fold(f64::INFINITY, f64::min);
            if minimum < valid_min {
                self.warn(ValidationWarning {
                    variable: node.variable.clone(),
                    check: String::from("valid_min"),
                    message: format!("minimum value {} is below valid_min {}", minimum, valid_min),
                });
            }
        }

        if let Some(valid_max) = node.checks.valid_max {
            let maximum = result
                .data
                .iter()
                .cloned()
                .fold(f64::NEG_INFINITY, f64::max);
            if maximum > valid_max {
                self.warn(ValidationWarning {
                    variable: node.variable.clone(),
                    check: String::from("valid_max"),
                    message: format!("maximum value {} is above valid_max {}", maximum, valid_max),
                });
            }
        }

        if node.checks.ok_min_mean_abs.is_some() || node.checks.ok_max_mean_abs.is_some() {
            let mean_abs =
                result.data.iter().map(|value| value.abs()).sum::<f64>() / result.data.len() as f64;

            if let Some(ok_min) = node.checks.ok_min_mean_abs {
                if mean_abs < ok_min {
                    self.warn(ValidationWarning {
                        variable: node.variable.clone(),
                        check: String::from("ok_min_mean_abs"),
                        message: format!(
                            "mean of absolute values {} is below ok_min_mean_abs {}",
                            mean_abs, ok_min
                        ),
                    });
                }
            }

            if let Some(ok_max) = node.checks.ok_max_mean_abs {
                if mean_abs > ok_max {
                    self.warn(ValidationWarning {
                        variable: node.variable.clone(),
                        check: String::from("ok_max_mean_abs"),
                        message: format!(
                            "mean of absolute values {} is above ok_max_mean_abs {}",
                            mean_abs, ok_max
                        ),
                    });
                }
            }
        }
    }
}

/// Slot metadata available without touching data. Constant arguments are
/// exact; node inputs are placeholders, which is enough for the sum-dims
/// lookup that only inspects constants.
fn shallow_info(slot: &Slot) -> ArgInfo {
    match slot {
        Slot::Const(ArgValue::Str(text)) => ArgInfo::Str(text.clone()),
        Slot::Const(ArgValue::Array(array)) if array.is_scalar() => ArgInfo::Num(array.data[0]),
        _ => ArgInfo::Data {
            units: Units::one(),
            dims: Vec::new(),
            positive: None,
        },
    }
}

fn probe_of(array: &PhysArray) -> PhysArray {
    PhysArray {
        name: array.name.clone(),
        data: Vec::new(),
        shape: vec![0; array.shape.len()],
        dims: array.dims.clone(),
        units: array.units.clone(),
        positive: array.positive,
        datatype: array.datatype,
    }
}

struct Builder<'s> {
    spec: &'s Specification,
    /// Definition roots of output variables already lowered, by name.
    lowered: BTreeMap<String, Slot>,
    /// Output variables currently being lowered; re-entry means a cycle.
    in_progress: BTreeSet<String>,
}

impl<'s> Builder<'s> {
    fn lower_variable(
        &mut self,
        graph: &mut Graph<'_>,
        var: &VariableSpec,
    ) -> Result<NodeId, BuildError> {
        let root = self.lower_definition(graph, &var.name)?;

        // Materialize a fully folded definition so the sink always has a
        // node upstream.
        let mut upstream = match root {
            Slot::Node(id) => id,
            Slot::Const(ArgValue::Array(array)) => {
                graph.add_node(FlowNode::Data(DataNode { array }))
            }
            Slot::Const(ArgValue::Str(_)) => {
                return Err(BuildError::Spec(format!(
                    "definition of \"{}\" is a bare string",
                    var.name
                )))
            }
        };

        upstream = self.map_dimensions(graph, var, upstream)?;

        let history = graph.pull(upstream, &Request::Probe)?.name;
        let mut attrs = var.attrs.clone();
        attrs
            .entry(String::from("history"))
            .or_insert_with(|| AttrValue::Str(history));

        let units = Units::from_attrs(var.units_attr(), var.calendar_attr())
            .map_err(|err| BuildError::Flow(FlowError::Units(err)))?;
        let positive = var
            .attr_str("positive")
            .and_then(Positive::parse);

        let id = graph.add_node(FlowNode::Validate(ValidateNode {
            variable: var.name.clone(),
            input: upstream,
            datatype: var.datatype,
            dims: var.dimensions.clone(),
            units,
            positive,
            direction: var.direction(),
            coordinate: var.is_coordinate(),
            attrs,
            checks: RangeChecks::from_attrs(&var.attrs),
            state: ValidateState::Created,
        }));

        Ok(id)
    }

    /// Lowers the named output variable's definition, memoized so shared
    /// references evaluate once.
    fn lower_definition(
        &mut self,
        graph: &mut Graph<'_>,
        name: &str,
    ) -> Result<Slot, BuildError> {
        if let Some(slot) = self.lowered.get(name) {
            return Ok(slot.clone());
        }
        if !self.in_progress.insert(name.to_owned()) {
            return Err(BuildError::Cycle(name.to_owned()));
        }

        let var = self
            .spec
            .variables()
            .map(|(_, var)| var)
            .find(|var| var.name == name)
            .expect("lower_definition called for undeclared variable");

        let slot = match &var.definition {
            Definition::Data { values, shape } => {
                if shape.len() != var.dimensions.len() {
                    return Err(BuildError::Spec(format!(
                        "array definition of \"{}\" has rank {} but {} dimensions are declared",
                        var.name,
                        shape.len(),
                        var.dimensions.len()
                    )));
                }
                let units = Units::from_attrs(var.units_attr(), var.calendar_attr())
                    .map_err(|err| BuildError::Flow(FlowError::Units(err)))?;
                let array = PhysArray {
                    name: var.name.clone(),
                    data: values.clone(),
                    shape: shape.clone(),
                    dims: var.dimensions.clone(),
                    units,
                    positive: var.attr_str("positive").and_then(Positive::parse),
                    datatype: if var.datatype == Datatype::F32 {
                        Datatype::F64
                    } else {
                        var.datatype
                    },
                };
                Slot::Node(graph.add_node(FlowNode::Data(DataNode { array })))
            }
            Definition::Expression(text) => {
                let expr = parse_definition(text).map_err(|inner| BuildError::Parse {
                    variable: var.name.clone(),
                    inner,
                })?;
                self.lower_expr(graph, &expr)?
            }
        };

        self.in_progress.remove(name);
        self.lowered.insert(name.to_owned(), slot.clone());
        Ok(slot)
    }

    fn lower_expr(&mut self, graph: &mut Graph<'_>, expr: &Expr) -> Result<Slot, BuildError> {
        match expr {
            Expr::Int(value) => Ok(Slot::Const(ArgValue::Array(PhysArray::scalar(
                value.to_string(),
                *value as f64,
                Datatype::I64,
            )))),
            Expr::Float(value) => Ok(Slot::Const(ArgValue::Array(PhysArray::scalar(
                value.to_string(),
                *value,
                Datatype::F64,
            )))),
            Expr::Str(text) => Ok(Slot::Const(ArgValue::Str(text.clone()))),
            Expr::Var { name, indices } => self.lower_var(graph, name, indices),
            Expr::Op { symbol, args } => {
                let implementation = graph.registry.find_operator(*symbol)?;
                let slots = args
                    .iter()
                    .map(|arg| self.lower_expr(graph, arg))
                    .collect::<Result<Vec<_>, _>>()?;
                self.finish_call(graph, implementation, slots)
            }
            Expr::Call { name, args, kwargs } => {
                let n_args = args.len() + kwargs.len();
                let implementation = graph.registry.find_function(name, n_args)?;

                let mut slots = args
                    .iter()
                    .map(|arg| self.lower_expr(graph, arg).map(Some))
                    .collect::<Result<Vec<_>, _>>()?;
                slots.resize(n_args, None);

                for (key, value) in kwargs {
                    let at = implementation.keyword_slot(key).ok_or_else(|| {
                        LookupError::UnknownKeyword {
                            name: name.clone(),
                            keyword: key.clone(),
                        }
                    })?;
                    if at >= slots.len() {
                        slots.resize(at + 1, None);
                    }
                    if slots[at].is_some() {
                        return Err(BuildError::Spec(format!(
                            "argument {} of \"{}\" is given twice",
                            at + 1,
                            name
                        )));
                    }
                    slots[at] = Some(self.lower_expr(graph, value)?);
                }

                let slots = slots
                    .into_iter()
                    .enumerate()
                    .map(|(at, slot)| {
                        slot.ok_or_else(|| {
                            BuildError::Spec(format!(
                                "argument {} of \"{}\" is missing",
                                at + 1,
                                name
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                self.finish_call(graph, implementation, slots)
            }
        }
    }

    /// Wraps resolved slots into an evaluation node, or evaluates right away
    /// when every slot is constant, so no all-constant evaluation survives
    /// the build.
    fn finish_call(
        &mut self,
        graph: &mut Graph<'_>,
        implementation: Rc<dyn Function>,
        slots: Vec<Slot>,
    ) -> Result<Slot, BuildError> {
        let all_const = slots.iter().all(|slot| matches!(slot, Slot::Const(_)));

        if all_const {
            let args = slots
                .iter()
                .map(|slot| match slot {
                    Slot::Const(value) => value.clone(),
                    Slot::Node(_) => unreachable!(),
                })
                .collect::<Vec<_>>();
            let value = implementation
                .value(&args)
                .map_err(|err| BuildError::Flow(FlowError::Function(err)))?;
            return Ok(Slot::Const(ArgValue::Array(value)));
        }

        Ok(Slot::Node(graph.add_node(FlowNode::Eval(EvalNode {
            implementation,
            slots,
            units: None,
            dims: None,
        }))))
    }

    fn lower_var(
        &mut self,
        graph: &mut Graph<'_>,
        name: &str,
        indices: &[Selector],
    ) -> Result<Slot, BuildError> {
        if let Some(var) = graph.catalog.variable(name) {
            if indices.len() > var.dimensions.len() {
                return Err(BuildError::Spec(format!(
                    "variable \"{}\" has {} dimensions but {} indices are given",
                    name,
                    var.dimensions.len(),
                    indices.len()
                )));
            }
            let file = graph
                .catalog
                .backing_file(name)
                .expect("catalog variable without a backing file")
                .to_owned();
            return Ok(Slot::Node(graph.add_node(FlowNode::Read(ReadNode {
                variable: name.to_owned(),
                file,
                indices: indices.to_vec(),
            }))));
        }

        // Not an input: maybe another output variable's definition.
        let declared = self
            .spec
            .variables()
            .any(|(_, var)| var.name == name);
        if declared {
            if !indices.is_empty() {
                return Err(BuildError::Spec(format!(
                    "output variable \"{}\" cannot be referenced with indices",
                    name
                )));
            }
            return self.lower_definition(graph, name);
        }

        Err(LookupError::UnknownVariable(name.to_owned()).into())
    }

    /// Inserts a rename node when the upstream dimensions differ from the
    /// declared ones by name only. Unmatched dimensions pair up positionally.
    fn map_dimensions(
        &mut self,
        graph: &mut Graph<'_>,
        var: &VariableSpec,
        upstream: NodeId,
    ) -> Result<NodeId, BuildError> {
        let probe = graph.pull(upstream, &Request::Probe)?;

        if probe.dims.len() != var.dimensions.len() {
            // Leave rank mismatches for the reconciler to report.
            return Ok(upstream);
        }

        let unmatched_have = probe
            .dims
            .iter()
            .filter(|dim| !var.dimensions.contains(dim))
            .cloned()
            .collect::<Vec<_>>();
        let unmatched_want = var
            .dimensions
            .iter()
            .filter(|dim| !probe.dims.contains(dim))
            .cloned()
            .collect::<Vec<_>>();

        if unmatched_have.is_empty() || unmatched_have.len() != unmatched_want.len() {
            return Ok(upstream);
        }

        let mapping = unmatched_have
            .into_iter()
            .zip(unmatched_want.into_iter())
            .collect::<BTreeMap<_, _>>();

        Ok(graph.add_node(FlowNode::Map(MapNode {
            input: upstream,
            mapping,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{AttrValue, RawArray};
    use crate::io::memory::{FileImage, MemoryStore};

    fn store_with_temperature() -> MemoryStore {
        let store = MemoryStore::new();
        let mut image = FileImage::new(Format::Classic);
        image.add_dimension("t", 2, false);
        image.add_dimension("x", 3, false);

        let mut attrs = Attrs::new();
        attrs.insert(String::from("units"), AttrValue::Str(String::from("K")));
        image.add_variable(
            "T",
            Datatype::F64,
            &["t", "x"],
            attrs,
            RawArray::F64(vec![270.0, 271.0, 272.0, 280.0, 281.0, 282.0]),
        );
        store.insert("in.arr", image);
        store
    }

    fn simple_spec(definition: &str, units: &str, dims: &[&str]) -> Specification {
        let dims_json = dims
            .iter()
            .map(|dim| format!("\"{}\": {}", dim, if *dim == "t" { 2 } else { 3 }))
            .collect::<Vec<_>>()
            .join(", ");
        let dim_list = dims
            .iter()
            .map(|dim| format!("\"{}\"", dim))
            .collect::<Vec<_>>()
            .join(", ");
        let text = format!(
            r#"{{
                "files": {{
                    "out.arr": {{
                        "format": "v4",
                        "dimensions": {{ {} }},
                        "variables": {{
                            "y": {{
                                "datatype": "double",
                                "dimensions": [{}],
                                "attributes": {{"units": "{}"}},
                                "definition": "{}"
                            }}
                        }}
                    }}
                }}
            }}"#,
            dims_json, dim_list, units, definition
        );
        Specification::from_json_str(&text).unwrap()
    }

    #[test]
    fn constant_definition_folds_to_a_data_node() {
        let store = store_with_temperature();
        let catalog = Catalog::from_store(&store, &[String::from("in.arr")]).unwrap();
        let registry = FunctionRegistry::standard();

        let spec = simple_spec("2 + 3*4", "1", &[]);
        let graph = Graph::build(&spec, &catalog, &registry, &store).unwrap();

        let validator = graph.validator("y").unwrap();
        let upstream = match graph.node(validator) {
            FlowNode::Validate(validate) => validate.input,
            _ => unreachable!(),
        };
        match graph.node(upstream) {
            FlowNode::Data(data) => {
                assert_eq!(data.array.data, vec![14.0]);
                assert!(data.array.is_scalar());
            }
            _ => panic!("expected a data node upstream of the validator"),
        }
    }

    #[test]
    fn constant_function_call_folds() {
        let store = store_with_temperature();
        let catalog = Catalog::from_store(&store, &[String::from("in.arr")]).unwrap();
        let registry = FunctionRegistry::standard();

        let spec = simple_spec("sqrt(16)", "1", &[]);
        let graph = Graph::build(&spec, &catalog, &registry, &store).unwrap();

        let validator = graph.validator("y").unwrap();
        let upstream = match graph.node(validator) {
            FlowNode::Validate(validate) => validate.input,
            _ => unreachable!(),
        };
        match graph.node(upstream) {
            FlowNode::Data(data) => assert_eq!(data.array.data, vec![4.0]),
            _ => panic!("expected a folded data node"),
        }
    }

    #[test]
    fn read_node_pulls_selected_data() {
        let store = store_with_temperature();
        let catalog = Catalog::from_store(&store, &[String::from("in.arr")]).unwrap();
        let registry = FunctionRegistry::standard();

        let spec = simple_spec("T", "K", &["t", "x"]);
        let graph = Graph::build(&spec, &catalog, &registry, &store).unwrap();
        let validator = graph.validator("y").unwrap();

        let result = graph
            .pull(
                validator,
                &Request::Ordered(vec![Selector::Int(1), Selector::Full]),
            )
            .unwrap();
        assert_eq!(result.data, vec![280.0, 281.0, 282.0]);
        assert_eq!(result.dims, vec![String::from("x")]);
    }

    #[test]
    fn two_layer_indexing_composes() {
        let store = store_with_temperature();
        let catalog = Catalog::from_store(&store, &[String::from("in.arr")]).unwrap();
        let registry = FunctionRegistry::standard();

        // The definition window selects row 1; the request then selects
        // column 2 of the window.
        let spec = simple_spec("T[1]", "K", &["x"]);
        let graph = Graph::build(&spec, &catalog, &registry, &store).unwrap();
        let validator = graph.validator("y").unwrap();

        let result = graph
            .pull(validator, &Request::Ordered(vec![Selector::Int(2)]))
            .unwrap();
        assert_eq!(result.data, vec![282.0]);
        assert!(result.is_scalar());
    }

    #[test]
    fn probe_returns_metadata_without_data() {
        let store = store_with_temperature();
        let catalog = Catalog::from_store(&store, &[String::from("in.arr")]).unwrap();
        let registry = FunctionRegistry::standard();

        let spec = simple_spec("T + 1", "K", &["t", "x"]);
        let graph = Graph::build(&spec, &catalog, &registry, &store).unwrap();
        let validator = graph.validator("y").unwrap();
        let upstream = match graph.node(validator) {
            FlowNode::Validate(validate) => validate.input,
            _ => unreachable!(),
        };

        let probe = graph.pull(upstream, &Request::Probe).unwrap();
        assert!(probe.data.is_empty());
        assert_eq!(probe.dims, vec![String::from("t"), String::from("x")]);
        assert_eq!(probe.name, "(T+1)");
        assert_eq!(probe.units, Units::parse("K", None).unwrap());
    }

    #[test]
    fn history_attribute_seeds_from_upstream_name() {
        let store = store_with_temperature();
        let catalog = Catalog::from_store(&store, &[String::from("in.arr")]).unwrap();
        let registry = FunctionRegistry::standard();

        let spec = simple_spec("T + 1", "K", &["t", "x"]);
        let graph = Graph::build(&spec, &catalog, &registry, &store).unwrap();
        let validator = graph.validator("y").unwrap();

        match graph.node(validator) {
            FlowNode::Validate(validate) => {
                assert_eq!(
                    validate.attrs.get("history"),
                    Some(&AttrValue::Str(String::from("(T+1)")))
                );
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn unknown_variable_is_a_lookup_error() {
        let store = store_with_temperature();
        let catalog = Catalog::from_store(&store, &[String::from("in.arr")]).unwrap();
        let registry = FunctionRegistry::standard();

        let spec = simple_spec("nope + 1", "1", &[]);
        assert!(matches!(
            Graph::build(&spec, &catalog, &registry, &store),
            Err(BuildError::Lookup(LookupError::UnknownVariable(_)))
        ));
    }

    #[test]
    fn unknown_function_is_a_lookup_error() {
        let store = store_with_temperature();
        let catalog = Catalog::from_store(&store, &[String::from("in.arr")]).unwrap();
        let registry = FunctionRegistry::standard();

        let spec = simple_spec("frobnicate(T)", "K", &["t", "x"]);
        assert!(matches!(
            Graph::build(&spec, &catalog, &registry, &store),
            Err(BuildError::Lookup(LookupError::UnknownFunction(_)))
        ));
    }

    #[test]
    fn self_referential_definition_is_a_cycle() {
        let store = store_with_temperature();
        let catalog = Catalog::from_store(&store, &[String::from("in.arr")]).unwrap();
        let registry = FunctionRegistry::standard();

        let spec = simple_spec("y + 1", "1", &[]);
        assert!(matches!(
            Graph::build(&spec, &catalog, &registry, &store),
            Err(BuildError::Cycle(_))
        ));
    }

    #[test]
    fn output_variables_may_reference_each_other() {
        let store = store_with_temperature();
        let catalog = Catalog::from_store(&store, &[String::from("in.arr")]).unwrap();
        let registry = FunctionRegistry::standard();

        let text = r#"{
            "files": {
                "out.arr": {
                    "format": "v4",
                    "dimensions": {"t": 2, "x": 3},
                    "variables": {
                        "a": {
                            "datatype": "double",
                            "dimensions": ["t", "x"],
                            "attributes": {"units": "K"},
                            "definition": "T"
                        },
                        "b": {
                            "datatype": "double",
                            "dimensions": ["t", "x"],
                            "attributes": {"units": "K"},
                            "definition": "a + 1"
                        }
                    }
                }
            }
        }"#;
        let spec = Specification::from_json_str(text).unwrap();
        let graph = Graph::build(&spec, &catalog, &registry, &store).unwrap();

        let validator = graph.validator("b").unwrap();
        let result = graph.pull(validator, &Request::full()).unwrap();
        assert_eq!(result.data[0], 271.0);
    }

    #[test]
    fn rename_map_translates_requests_and_dims() {
        let store = store_with_temperature();
        let catalog = Catalog::from_store(&store, &[String::from("in.arr")]).unwrap();
        let registry = FunctionRegistry::standard();

        let text = r#"{
            "files": {
                "out.arr": {
                    "format": "v4",
                    "dimensions": {"time": 2, "x": 3},
                    "variables": {
                        "y": {
                            "datatype": "double",
                            "dimensions": ["time", "x"],
                            "attributes": {"units": "K"},
                            "definition": "T"
                        }
                    }
                }
            }
        }"#;
        let spec = Specification::from_json_str(text).unwrap();
        let graph = Graph::build(&spec, &catalog, &registry, &store).unwrap();
        let validator = graph.validator("y").unwrap();

        let mut map = BTreeMap::new();
        map.insert(String::from("time"), Selector::Int(0));
        let result = graph.pull(validator, &Request::Named(map)).unwrap();
        assert_eq!(result.dims, vec![String::from("x")]);
        assert_eq!(result.data, vec![270.0, 271.0, 272.0]);
    }

    #[test]
    fn reductions_always_see_the_full_axis() {
        let store = store_with_temperature();
        let catalog = Catalog::from_store(&store, &[String::from("in.arr")]).unwrap();
        let registry = FunctionRegistry::standard();

        let spec = simple_spec("mean(T, 't')", "K", &["x"]);
        let graph = Graph::build(&spec, &catalog, &registry, &store).unwrap();
        let validator = graph.validator("y").unwrap();

        // Even when the request restricts the reduced dimension, the
        // reduction runs over all of it.
        let mut map = BTreeMap::new();
        map.insert(String::from("t"), Selector::Int(0));
        let result = graph.pull(validator, &Request::Named(map)).unwrap();
        assert_eq!(result.data, vec![275.0, 276.0, 277.0]);
        assert_eq!(result.dims, vec![String::from("x")]);
    }

    #[test]
    fn empty_chunk_request_yields_zero_length_axes() {
        let store = store_with_temperature();
        let catalog = Catalog::from_store(&store, &[String::from("in.arr")]).unwrap();
        let registry = FunctionRegistry::standard();

        let spec = simple_spec("T", "K", &["t", "x"]);
        let graph = Graph::build(&spec, &catalog, &registry, &store).unwrap();
        let validator = graph.validator("y").unwrap();

        let result = graph
            .pull(
                validator,
                &Request::Ordered(vec![Selector::slice(0, 0), Selector::Full]),
            )
            .unwrap();
        assert_eq!(result.shape, vec![0, 3]);
        assert!(result.data.is_empty());
    }
}
