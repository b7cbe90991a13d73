//! Reconciliation passes.
//!
//! After the graph is built, two post-order traversals from each sink make
//! every edge carry data in exactly the units and dimension order its
//! consumer requires. Where a producer disagrees with its consumer's
//! requirement the pass repairs locally by inserting a `convert` or
//! `transpose` node; only when no repair exists does it fail. A third pass
//! decides, per output file, which coordinate dimensions must be written in
//! the opposite direction from their source.
//!
//! Running the passes again on an already reconciled graph inserts nothing.

use std::fmt;

use crate::array::PhysArray;
use crate::flow::{FlowError, FlowNode, Graph, NodeId, Slot, ValidateState};
use crate::functions::{ArgInfo, ArgValue, Function};
use crate::index::Request;
use crate::spec::Direction;
use crate::units::{Units, UnitsError};

#[derive(Debug)]
pub struct DimensionsError {
    pub context: String,
    pub wanted: Vec<String>,
    pub found: Vec<String>,
}

impl fmt::Display for DimensionsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} requires dimensions [{}] but its input has [{}]",
            self.context,
            self.wanted.join(", "),
            self.found.join(", ")
        )
    }
}

#[derive(Debug)]
pub enum ReconcileError {
    Units(UnitsError),
    Dimensions(DimensionsError),
    Positive { variable: String },
    Flow(FlowError),
}

impl From<UnitsError> for ReconcileError {
    fn from(err: UnitsError) -> Self {
        ReconcileError::Units(err)
    }
}

impl From<FlowError> for ReconcileError {
    fn from(err: FlowError) -> Self {
        // Unit failures surfaced by probing (through function unit rules)
        // are unit errors of this pass, not runtime failures.
        match err {
            FlowError::Units(inner) => ReconcileError::Units(inner),
            other => ReconcileError::Flow(other),
        }
    }
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::Units(err) => write!(f, "{}", err),
            ReconcileError::Dimensions(err) => write!(f, "{}", err),
            ReconcileError::Positive { variable } => write!(
                f,
                "variable \"{}\" declares a positive direction but its definition carries none",
                variable
            ),
            ReconcileError::Flow(err) => write!(f, "{}", err),
        }
    }
}

/// Runs all three passes over every sink of the graph.
pub fn reconcile(graph: &mut Graph<'_>) -> Result<(), ReconcileError> {
    let write_ids = graph.write_nodes().to_vec();

    for write_id in &write_ids {
        for validator in write_inputs(graph, *write_id) {
            resolve_units(graph, validator)?;
        }
    }

    for write_id in &write_ids {
        for validator in write_inputs(graph, *write_id) {
            resolve_dimensions(graph, validator)?;
        }
    }

    for write_id in &write_ids {
        resolve_directions(graph, *write_id)?;
    }

    Ok(())
}

fn write_inputs(graph: &Graph<'_>, id: NodeId) -> Vec<NodeId> {
    match graph.node(id) {
        FlowNode::Write(write) => write.inputs.clone(),
        _ => Vec::new(),
    }
}

fn resolve_units(graph: &mut Graph<'_>, id: NodeId) -> Result<(), ReconcileError> {
    // Post-order: inputs first.
    for input in graph.inputs_of(id) {
        resolve_units(graph, input)?;
    }

    match graph.node(id) {
        FlowNode::Eval(eval) => {
            let implementation = eval.implementation.clone();
            let slots = eval.slots.clone();

            let infos = slots
                .iter()
                .map(|slot| graph.slot_info(slot))
                .collect::<Result<Vec<_>, _>>()?;
            let (result, required) = implementation
                .units(&infos)
                .map_err(|err| ReconcileError::from(FlowError::Function(err)))?;

            let mut new_slots = slots;
            for (at, requirement) in required.into_iter().enumerate() {
                let requirement = match requirement {
                    Some(requirement) => requirement,
                    None => continue,
                };
                let input = match new_slots[at] {
                    Slot::Node(input) => input,
                    // Constants are never re-routed through a conversion.
                    Slot::Const(_) => continue,
                };
                let current = match &infos[at] {
                    ArgInfo::Data { units, .. } => units.clone(),
                    _ => continue,
                };

                if current == requirement {
                    continue;
                }
                if !current.is_convertible(&requirement) {
                    // Produce the precise error, calendar mismatches
                    // included.
                    current.conversion(&requirement)?;
                }

                new_slots[at] = Slot::Node(insert_convert(graph, input, &requirement));
            }

            match graph.node_mut(id) {
                FlowNode::Eval(eval) => {
                    eval.slots = new_slots;
                    eval.units = Some(result);
                }
                _ => unreachable!(),
            }
        }
        FlowNode::Validate(validate) => {
            let declared = validate.units.clone();
            let declared_positive = validate.positive;
            let variable = validate.variable.clone();
            let input = validate.input;

            let probe = graph.pull(input, &Request::Probe)?;

            if declared_positive.is_some() && probe.positive.is_none() {
                return Err(ReconcileError::Positive { variable });
            }

            if probe.units != declared {
                if !probe.units.is_convertible(&declared) {
                    probe.units.conversion(&declared)?;
                }
                let converted = insert_convert(graph, input, &declared);
                match graph.node_mut(id) {
                    FlowNode::Validate(validate) => validate.input = converted,
                    _ => unreachable!(),
                }
            }

            match graph.node_mut(id) {
                FlowNode::Validate(validate) => {
                    validate.state = ValidateState::UnitsResolved;
                }
                _ => unreachable!(),
            }
        }
        _ => {}
    }

    Ok(())
}

fn resolve_dimensions(graph: &mut Graph<'_>, id: NodeId) -> Result<(), ReconcileError> {
    for input in graph.inputs_of(id) {
        resolve_dimensions(graph, input)?;
    }

    match graph.node(id) {
        FlowNode::Eval(eval) => {
            let implementation = eval.implementation.clone();
            let slots = eval.slots.clone();

            let infos = slots
                .iter()
                .map(|slot| graph.slot_info(slot))
                .collect::<Result<Vec<_>, _>>()?;
            let (result, required) = implementation
                .dims(&infos)
                .map_err(|err| ReconcileError::from(FlowError::Function(err)))?;

            let mut new_slots = slots;
            for (at, requirement) in required.into_iter().enumerate() {
                let requirement = match requirement {
                    Some(requirement) => requirement,
                    None => continue,
                };
                let input = match new_slots[at] {
                    Slot::Node(input) => input,
                    Slot::Const(_) => continue,
                };
                let current = match &infos[at] {
                    ArgInfo::Data { dims, .. } => dims.clone(),
                    _ => continue,
                };

                if current == requirement {
                    continue;
                }
                if !is_permutation(&current, &requirement) {
                    return Err(ReconcileError::Dimensions(DimensionsError {
                        context: format!("\"{}\"", implementation.name()),
                        wanted: requirement,
                        found: current,
                    }));
                }

                new_slots[at] = Slot::Node(insert_transpose(graph, input, &requirement));
            }

            match graph.node_mut(id) {
                FlowNode::Eval(eval) => {
                    eval.slots = new_slots;
                    eval.dims = Some(result);
                }
                _ => unreachable!(),
            }
        }
        FlowNode::Validate(validate) => {
            let declared = validate.dims.clone();
            let variable = validate.variable.clone();
            let input = validate.input;

            let probe = graph.pull(input, &Request::Probe)?;

            if probe.dims != declared {
                // A scalar definition broadcast into a declared shape is not
                // repairable by reordering.
                if !is_permutation(&probe.dims, &declared) {
                    return Err(ReconcileError::Dimensions(DimensionsError {
                        context: format!("variable \"{}\"", variable),
                        wanted: declared,
                        found: probe.dims,
                    }));
                }
                let transposed = insert_transpose(graph, input, &declared);
                match graph.node_mut(id) {
                    FlowNode::Validate(validate) => validate.input = transposed,
                    _ => unreachable!(),
                }
            }

            match graph.node_mut(id) {
                FlowNode::Validate(validate) => {
                    validate.state = ValidateState::DimensionsResolved;
                }
                _ => unreachable!(),
            }
        }
        _ => {}
    }

    Ok(())
}

fn resolve_directions(graph: &mut Graph<'_>, write_id: NodeId) -> Result<(), ReconcileError> {
    let validators = write_inputs(graph, write_id);
    let mut inverted = Vec::new();

    for validator in &validators {
        let (input, dim, declared) = match graph.node(*validator) {
            FlowNode::Validate(validate) => {
                let declared = match validate.direction {
                    Some(direction) if validate.coordinate && validate.dims.len() == 1 => {
                        direction
                    }
                    _ => continue,
                };
                (validate.input, validate.dims[0].clone(), declared)
            }
            _ => continue,
        };

        let coordinate = graph.pull(input, &Request::full())?;
        let observed = match observed_direction(&coordinate) {
            Some(observed) => observed,
            None => continue,
        };

        if observed != declared {
            inverted.push(dim);
        }
    }

    match graph.node_mut(write_id) {
        FlowNode::Write(write) => {
            for dim in inverted {
                write.inverted.insert(dim);
            }
        }
        _ => unreachable!(),
    }

    for validator in validators {
        match graph.node_mut(validator) {
            FlowNode::Validate(validate) => validate.state = ValidateState::Ready,
            _ => unreachable!(),
        }
    }

    Ok(())
}

/// Direction of a one-dimensional coordinate: strictly increasing or
/// strictly decreasing first differences, `None` otherwise.
fn observed_direction(coordinate: &PhysArray) -> Option<Direction> {
    if coordinate.data.len() < 2 {
        return None;
    }

    let increasing = coordinate
        .data
        .windows(2)
        .all(|pair| pair[1] > pair[0]);
    let decreasing = coordinate
        .data
        .windows(2)
        .all(|pair| pair[1] < pair[0]);

    if increasing {
        Some(Direction::Increasing)
    } else if decreasing {
        Some(Direction::Decreasing)
    } else {
        None
    }
}

fn is_permutation(left: &[String], right: &[String]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    let mut sorted_left = left.to_vec();
    let mut sorted_right = right.to_vec();
    sorted_left.sort();
    sorted_right.sort();
    sorted_left == sorted_right
}

fn insert_convert(graph: &mut Graph<'_>, input: NodeId, target: &Units) -> NodeId {
    let mut slots = vec![
        Slot::Node(input),
        Slot::Const(ArgValue::Str(target.to_string())),
    ];
    if let Some(calendar) = target.calendar() {
        slots.push(Slot::Const(ArgValue::Str(calendar.to_string())));
    }

    let implementation = graph
        .registry
        .find_function("convert", slots.len())
        .expect("convert is a built-in");

    add_eval(graph, implementation, slots, Some(target.clone()), None)
}

fn insert_transpose(graph: &mut Graph<'_>, input: NodeId, new_dims: &[String]) -> NodeId {
    let mut slots = vec![Slot::Node(input)];
    for dim in new_dims {
        slots.push(Slot::Const(ArgValue::Str(dim.clone())));
    }

    let implementation = graph
        .registry
        .find_function("transpose", slots.len())
        .expect("transpose is a built-in");

    add_eval(
        graph,
        implementation,
        slots,
        None,
        Some(new_dims.to_vec()),
    )
}

fn add_eval(
    graph: &mut Graph<'_>,
    implementation: std::rc::Rc<dyn Function>,
    slots: Vec<Slot>,
    units: Option<Units>,
    dims: Option<Vec<String>>,
) -> NodeId {
    graph.add_node(FlowNode::Eval(crate::flow::EvalNode {
        implementation,
        slots,
        units,
        dims,
    }))
}
