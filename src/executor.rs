//! Writer and executor.
//!
//! One execute call drives one output file to completion: open the file and
//! declare its header, then iterate the file's index space in chunks,
//! pulling each variable's sub-chunk through its validator and streaming it
//! into the file, and finally close. Chunks follow a deterministic nested
//! counter over the file's dimensions; chunk sizes come from a user table
//! and default to the full dimension.
//!
//! Dimensions marked inverted by the reconciler are read through their
//! mirror: the write chunk stays as counted, the read chunk walks the source
//! backwards.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::array::{AttrValue, RawArray};
use crate::flow::{FlowError, FlowNode, Graph, NodeId, ValidateNode, WriteState};
use crate::index::{Request, Selector};
use crate::io::{IoError, WriteHandle};

#[derive(Debug)]
pub enum ExecutionError {
    Io(IoError),
    Flow(FlowError),
    UnsetDimension {
        file: String,
        dimension: String,
    },
    ChunkShape {
        file: String,
        variable: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
}

impl From<IoError> for ExecutionError {
    fn from(err: IoError) -> Self {
        ExecutionError::Io(err)
    }
}

impl From<FlowError> for ExecutionError {
    fn from(err: FlowError) -> Self {
        ExecutionError::Flow(err)
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionError::Io(err) => write!(f, "{}", err),
            ExecutionError::Flow(err) => write!(f, "{}", err),
            ExecutionError::UnsetDimension { file, dimension } => write!(
                f,
                "dimension \"{}\" of file \"{}\" has no resolvable size",
                dimension, file
            ),
            ExecutionError::ChunkShape {
                file,
                variable,
                expected,
                found,
            } => write!(
                f,
                "variable \"{}\" of file \"{}\" produced a chunk of shape {:?} where {:?} was expected",
                variable, file, found, expected
            ),
        }
    }
}

/// Drives write nodes of a reconciled graph.
pub struct Executor<'g, 'a> {
    graph: &'g Graph<'a>,
    chunks: BTreeMap<String, usize>,
    keep_history: bool,
}

impl<'g, 'a> Executor<'g, 'a> {
    pub fn new(graph: &'g Graph<'a>, chunks: BTreeMap<String, usize>, keep_history: bool) -> Self {
        Executor {
            graph,
            chunks,
            keep_history,
        }
    }

    /// Executes every output file of the graph, in specification order.
    pub fn execute_all(&self) -> Result<(), ExecutionError> {
        for write_id in self.graph.write_nodes() {
            self.execute(*write_id)?;
        }
        Ok(())
    }

    /// Produces one output file. The file is closed on both success and
    /// failure; a failed run leaves no open handle behind.
    pub fn execute(&self, write_id: NodeId) -> Result<(), ExecutionError> {
        let write = match self.graph.node(write_id) {
            FlowNode::Write(write) => write,
            _ => unreachable!("execute called on a non-write node"),
        };

        write.state.set(WriteState::Open);
        let mut handle = match self.graph.store.create_write(&write.file, write.format) {
            Ok(handle) => handle,
            Err(err) => {
                write.state.set(WriteState::Closed);
                return Err(err.into());
            }
        };

        let result = self.produce(write_id, &mut *handle);
        if result.is_err() {
            // Release the partial file before re-raising.
            let _ = handle.close();
        }
        write.state.set(WriteState::Closed);
        result
    }

    fn produce(
        &self,
        write_id: NodeId,
        handle: &mut dyn WriteHandle,
    ) -> Result<(), ExecutionError> {
        let write = match self.graph.node(write_id) {
            FlowNode::Write(write) => write,
            _ => unreachable!(),
        };

        let validators = write
            .inputs
            .iter()
            .map(|id| match self.graph.node(*id) {
                FlowNode::Validate(validate) => (*id, validate),
                _ => unreachable!("write inputs are validators"),
            })
            .collect::<Vec<_>>();

        // Open phase: global attributes, dimensions, variables.
        handle.set_global_attrs(&write.attrs)?;

        let mut sizes = BTreeMap::new();
        for (_, validate) in &validators {
            for dim in &validate.dims {
                if sizes.contains_key(dim) {
                    continue;
                }
                let declared = write.dimensions.get(dim).ok_or_else(|| {
                    ExecutionError::UnsetDimension {
                        file: write.file.clone(),
                        dimension: dim.clone(),
                    }
                })?;
                // An unlimited dimension takes its extent from the inputs.
                let size = declared
                    .size
                    .or_else(|| self.graph.catalog.dimension(dim).and_then(|have| have.size))
                    .ok_or_else(|| ExecutionError::UnsetDimension {
                        file: write.file.clone(),
                        dimension: dim.clone(),
                    })?;
                handle.create_dimension(dim, size, declared.unlimited)?;
                sizes.insert(dim.clone(), size);
            }
        }

        for (_, validate) in &validators {
            handle.create_variable(
                &validate.variable,
                validate.datatype,
                &validate.dims,
                validate.attrs.get("_FillValue").and_then(AttrValue::as_f64),
            )?;
            handle.set_attrs(&validate.variable, &self.variable_attrs(write_id, validate))?;
        }

        // Execute phase: nested counter over the file's index space.
        write.state.set(WriteState::Executing);

        let dims = sizes.keys().cloned().collect::<Vec<_>>();
        let mut committed = BTreeSet::new();

        for chunk in self.chunk_plan(&dims, &sizes) {
            for (id, validate) in &validators {
                let region = validate
                    .dims
                    .iter()
                    .map(|dim| chunk[dim])
                    .collect::<Vec<_>>();

                // A variable spanning a strict subset of the file's
                // dimensions revisits the same region on later chunks.
                if !committed.insert((validate.variable.clone(), region.clone())) {
                    continue;
                }

                let request = self.read_request(validate, &chunk, &sizes, &write.inverted);
                let result = self.graph.pull(*id, &request)?;

                let expected = region.iter().map(|(_, len)| *len).collect::<Vec<_>>();
                if result.shape != expected {
                    return Err(ExecutionError::ChunkShape {
                        file: write.file.clone(),
                        variable: validate.variable.clone(),
                        expected,
                        found: result.shape,
                    });
                }

                let origin = region.iter().map(|(start, _)| *start).collect::<Vec<_>>();
                let shape = expected;
                let raw = RawArray::from_f64(validate.datatype, &result.data);
                handle.write(&validate.variable, &origin, &shape, &raw)?;
            }
        }

        handle.close()?;
        Ok(())
    }

    /// The attributes emitted for one variable: everything it carries except
    /// the fill value and direction markers, with the history dropped when
    /// disabled and wrapped when the variable's dimension is inverted.
    fn variable_attrs(&self, write_id: NodeId, validate: &ValidateNode) -> crate::array::Attrs {
        let write = match self.graph.node(write_id) {
            FlowNode::Write(write) => write,
            _ => unreachable!(),
        };

        let mut attrs = validate.attrs.clone();
        attrs.remove("_FillValue");
        attrs.remove("direction");
        if !self.keep_history {
            attrs.remove("history");
        }

        if validate.dims.len() == 1 && write.inverted.contains(&validate.dims[0]) {
            if let Some(AttrValue::Str(prior)) = attrs.get("history").cloned() {
                attrs.insert(
                    String::from("history"),
                    AttrValue::Str(format!(
                        "invdims({}, dims=[{}])",
                        prior, validate.dims[0]
                    )),
                );
            }
        }

        attrs
    }

    /// All write chunks in nested counter order. Each chunk maps a dimension
    /// to its `(start, len)` range.
    fn chunk_plan(
        &self,
        dims: &[String],
        sizes: &BTreeMap<String, usize>,
    ) -> Vec<BTreeMap<String, (usize, usize)>> {
        if dims.is_empty() {
            // A file of scalar variables still takes one pass.
            return vec![BTreeMap::new()];
        }

        let steps = dims
            .iter()
            .map(|dim| {
                let size = sizes[dim];
                let step = self.chunks.get(dim).copied().unwrap_or(size);
                (size, step.max(1).min(size.max(1)))
            })
            .collect::<Vec<_>>();

        let mut plan = Vec::new();
        let mut starts = vec![0usize; dims.len()];

        'odometer: loop {
            let chunk = dims
                .iter()
                .zip(starts.iter().zip(steps.iter()))
                .map(|(dim, (start, (size, step)))| {
                    (dim.clone(), (*start, (*step).min(size - start)))
                })
                .collect::<BTreeMap<_, _>>();
            plan.push(chunk);

            for axis in (0..dims.len()).rev() {
                starts[axis] += steps[axis].1;
                if starts[axis] < steps[axis].0 {
                    continue 'odometer;
                }
                starts[axis] = 0;
            }
            break;
        }

        plan
    }

    /// The read-side request for one variable's chunk, with inverted
    /// dimensions mirror-indexed.
    fn read_request(
        &self,
        validate: &ValidateNode,
        chunk: &BTreeMap<String, (usize, usize)>,
        sizes: &BTreeMap<String, usize>,
        inverted: &BTreeSet<String>,
    ) -> Request {
        let mut map = BTreeMap::new();
        for dim in &validate.dims {
            let (start, len) = chunk[dim];
            let selector = if inverted.contains(dim) {
                let size = sizes[dim];
                let first = size - start - 1;
                let stop = size as i64 - (start + len) as i64 - 1;
                Selector::Slice {
                    start: Some(first as i64),
                    stop: if stop < 0 { None } else { Some(stop) },
                    step: Some(-1),
                }
            } else {
                Selector::slice(start as i64, (start + len) as i64)
            };
            map.insert(dim.clone(), selector);
        }
        Request::Named(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{Attrs, Datatype};
    use crate::catalog::Catalog;
    use crate::functions::FunctionRegistry;
    use crate::io::memory::{FileImage, MemoryStore};
    use crate::io::Format;
    use crate::reconcile::{reconcile, ReconcileError};
    use crate::spec::Specification;
    use crate::units::UnitsError;

    fn attrs(entries: &[(&str, AttrValue)]) -> Attrs {
        entries
            .iter()
            .map(|(name, value)| ((*name).to_owned(), value.clone()))
            .collect()
    }

    fn units(text: &str) -> AttrValue {
        AttrValue::Str(text.to_owned())
    }

    fn input_store() -> MemoryStore {
        let store = MemoryStore::new();
        let mut image = FileImage::new(Format::Classic);
        image.add_dimension("t", 2, false);
        image.add_dimension("x", 3, false);
        image.add_dimension("lev", 4, false);
        image.add_variable(
            "T",
            Datatype::F64,
            &["t", "x"],
            attrs(&[("units", units("K"))]),
            RawArray::F64(vec![273.15, 274.15, 275.15, 283.15, 284.15, 285.15]),
        );
        image.add_variable(
            "p",
            Datatype::F64,
            &["x"],
            attrs(&[("units", units("Pa"))]),
            RawArray::F64(vec![1000.0, 900.0, 800.0]),
        );
        image.add_variable(
            "lev",
            Datatype::F64,
            &["lev"],
            attrs(&[("units", units("hPa")), ("axis", units("Z"))]),
            RawArray::F64(vec![1000.0, 850.0, 500.0, 200.0]),
        );
        image.add_variable(
            "q",
            Datatype::F64,
            &["lev"],
            attrs(&[("units", units("1"))]),
            RawArray::F64(vec![0.1, 0.2, 0.3, 0.4]),
        );
        store.insert("in.arr", image);
        store
    }

    fn run(
        spec_text: &str,
        store: &MemoryStore,
        chunks: BTreeMap<String, usize>,
    ) -> Result<(), String> {
        let catalog = Catalog::from_store(store, &[String::from("in.arr")])
            .map_err(|err| err.to_string())?;
        let registry = FunctionRegistry::standard();
        let spec = Specification::from_json_str(spec_text).map_err(|err| err.to_string())?;
        let mut graph = Graph::build(&spec, &catalog, &registry, store)
            .map_err(|err| err.to_string())?;
        reconcile(&mut graph).map_err(|err| err.to_string())?;
        Executor::new(&graph, chunks, true)
            .execute_all()
            .map_err(|err| err.to_string())
    }

    #[test]
    fn pure_arithmetic_writes_a_scalar() {
        let store = input_store();
        let spec = r#"{
            "files": {
                "out.arr": {
                    "format": "v4",
                    "dimensions": {},
                    "variables": {
                        "y": {
                            "datatype": "double",
                            "dimensions": [],
                            "attributes": {"units": "1"},
                            "definition": "2 + 3*4"
                        }
                    }
                }
            }
        }"#;
        run(spec, &store, BTreeMap::new()).unwrap();

        let image = store.image("out.arr").unwrap();
        assert_eq!(image.data["y"], RawArray::F64(vec![14.0]));
    }

    #[test]
    fn unit_conversion_applies_on_write() {
        let store = input_store();
        let spec = r#"{
            "files": {
                "out.arr": {
                    "format": "v4",
                    "dimensions": {"t": 2, "x": 3},
                    "variables": {
                        "Tc": {
                            "datatype": "double",
                            "dimensions": ["t", "x"],
                            "attributes": {"units": "degC"},
                            "definition": "T"
                        }
                    }
                }
            }
        }"#;
        run(spec, &store, BTreeMap::new()).unwrap();

        let image = store.image("out.arr").unwrap();
        match &image.data["Tc"] {
            RawArray::F64(values) => {
                assert!((values[0] - 0.0).abs() < 1e-9);
                assert!((values[5] - 12.0).abs() < 1e-9);
            }
            other => panic!("unexpected buffer {:?}", other),
        }
    }

    #[test]
    fn transposed_output_reorders_data() {
        let store = input_store();
        let spec = r#"{
            "files": {
                "out.arr": {
                    "format": "v4",
                    "dimensions": {"t": 2, "x": 3},
                    "variables": {
                        "u_out": {
                            "datatype": "double",
                            "dimensions": ["x", "t"],
                            "attributes": {"units": "K"},
                            "definition": "T"
                        }
                    }
                }
            }
        }"#;
        run(spec, &store, BTreeMap::new()).unwrap();

        let image = store.image("out.arr").unwrap();
        match &image.data["u_out"] {
            RawArray::F64(values) => {
                // (x=0, t=1) equals input (t=1, x=0).
                assert_eq!(values[1], 283.15);
                // (x=2, t=0) equals input (t=0, x=2).
                assert_eq!(values[4], 275.15);
            }
            other => panic!("unexpected buffer {:?}", other),
        }
    }

    const INVERSION_SPEC: &str = r#"{
        "files": {
            "out.arr": {
                "format": "v4",
                "dimensions": {"lev": 4},
                "variables": {
                    "lev": {
                        "datatype": "double",
                        "dimensions": ["lev"],
                        "attributes": {
                            "units": "hPa",
                            "axis": "Z",
                            "direction": "increasing"
                        },
                        "definition": "lev"
                    },
                    "q_out": {
                        "datatype": "double",
                        "dimensions": ["lev"],
                        "attributes": {"units": "1"},
                        "definition": "q"
                    }
                }
            }
        }
    }"#;

    #[test]
    fn axis_inversion_mirrors_every_dependent_variable() {
        let store = input_store();
        run(INVERSION_SPEC, &store, BTreeMap::new()).unwrap();

        let image = store.image("out.arr").unwrap();
        assert_eq!(
            image.data["lev"],
            RawArray::F64(vec![200.0, 500.0, 850.0, 1000.0])
        );
        assert_eq!(
            image.data["q_out"],
            RawArray::F64(vec![0.4, 0.3, 0.2, 0.1])
        );

        let lev = image.variable("lev").unwrap();
        assert_eq!(
            lev.attrs.get("history"),
            Some(&AttrValue::Str(String::from("invdims(lev, dims=[lev])")))
        );
        // The direction marker itself never reaches the file.
        assert!(lev.attrs.get("direction").is_none());
    }

    #[test]
    fn chunked_inversion_matches_unchunked() {
        let store = input_store();
        run(INVERSION_SPEC, &store, BTreeMap::new()).unwrap();
        let whole = store.image("out.arr").unwrap();

        let mut chunks = BTreeMap::new();
        chunks.insert(String::from("lev"), 1);
        run(INVERSION_SPEC, &store, chunks).unwrap();
        assert_eq!(store.image("out.arr").unwrap(), whole);
    }

    #[test]
    fn unconvertible_units_create_no_file() {
        let store = input_store();
        let spec = r#"{
            "files": {
                "out.arr": {
                    "format": "v4",
                    "dimensions": {"x": 3},
                    "variables": {
                        "h": {
                            "datatype": "double",
                            "dimensions": ["x"],
                            "attributes": {"units": "m"},
                            "definition": "p"
                        }
                    }
                }
            }
        }"#;

        let catalog = Catalog::from_store(&store, &[String::from("in.arr")]).unwrap();
        let registry = FunctionRegistry::standard();
        let spec = Specification::from_json_str(spec).unwrap();
        let mut graph = Graph::build(&spec, &catalog, &registry, &store).unwrap();
        assert!(matches!(
            reconcile(&mut graph),
            Err(ReconcileError::Units(UnitsError::NotConvertible { .. }))
        ));
        assert!(!store.contains("out.arr"));
    }

    const CHUNK_SPEC: &str = r#"{
        "files": {
            "out.arr": {
                "format": "v4",
                "dimensions": {"t": 2, "x": 3},
                "variables": {
                    "Tc": {
                        "datatype": "double",
                        "dimensions": ["t", "x"],
                        "attributes": {"units": "degC"},
                        "definition": "T"
                    },
                    "pr": {
                        "datatype": "double",
                        "dimensions": ["x"],
                        "attributes": {"units": "hPa"},
                        "definition": "p"
                    }
                }
            }
        }
    }"#;

    #[test]
    fn chunked_run_is_bitwise_equal_to_unchunked() {
        let store = input_store();
        run(CHUNK_SPEC, &store, BTreeMap::new()).unwrap();
        let whole = store.image("out.arr").unwrap();

        let mut chunks = BTreeMap::new();
        chunks.insert(String::from("t"), 1);
        run(CHUNK_SPEC, &store, chunks).unwrap();
        let chunked = store.image("out.arr").unwrap();

        assert_eq!(chunked, whole);
    }

    #[test]
    fn global_and_variable_attributes_reach_the_file() {
        let store = input_store();
        let spec = r#"{
            "attributes": {"institution": "somewhere"},
            "files": {
                "out.arr": {
                    "format": "v4",
                    "attributes": {"title": "test output"},
                    "dimensions": {"x": 3},
                    "variables": {
                        "pr": {
                            "datatype": "double",
                            "dimensions": ["x"],
                            "attributes": {"units": "hPa", "long_name": "pressure"},
                            "definition": "p"
                        }
                    }
                }
            }
        }"#;
        run(spec, &store, BTreeMap::new()).unwrap();

        let image = store.image("out.arr").unwrap();
        assert_eq!(
            image.attrs.get("title"),
            Some(&AttrValue::Str(String::from("test output")))
        );
        let pr = image.variable("pr").unwrap();
        assert_eq!(
            pr.attrs.get("long_name"),
            Some(&AttrValue::Str(String::from("pressure")))
        );
        // History is seeded at build time, before any conversions are
        // inserted.
        assert_eq!(
            pr.attrs.get("history"),
            Some(&AttrValue::Str(String::from("p")))
        );
    }

    #[test]
    fn fill_value_is_consumed_not_emitted() {
        let store = input_store();
        let spec = r#"{
            "files": {
                "out.arr": {
                    "format": "v4",
                    "dimensions": {"x": 3},
                    "variables": {
                        "pr": {
                            "datatype": "double",
                            "dimensions": ["x"],
                            "attributes": {"units": "Pa", "_FillValue": 1e20},
                            "definition": "p"
                        }
                    }
                }
            }
        }"#;
        run(spec, &store, BTreeMap::new()).unwrap();

        let image = store.image("out.arr").unwrap();
        let pr = image.variable("pr").unwrap();
        // The fill value is consumed by variable creation, not emitted as an
        // attribute.
        assert!(pr.attrs.get("_FillValue").is_none());
        assert_eq!(
            image.data["pr"],
            RawArray::F64(vec![1000.0, 900.0, 800.0])
        );
    }

    #[test]
    fn validation_warnings_are_collected_not_fatal() {
        let store = input_store();
        let spec = r#"{
            "files": {
                "out.arr": {
                    "format": "v4",
                    "dimensions": {"x": 3},
                    "variables": {
                        "pr": {
                            "datatype": "double",
                            "dimensions": ["x"],
                            "attributes": {"units": "Pa", "valid_min": 900.0},
                            "definition": "p"
                        }
                    }
                }
            }
        }"#;

        let catalog = Catalog::from_store(&store, &[String::from("in.arr")]).unwrap();
        let registry = FunctionRegistry::standard();
        let spec = Specification::from_json_str(spec).unwrap();
        let mut graph = Graph::build(&spec, &catalog, &registry, &store).unwrap();
        reconcile(&mut graph).unwrap();
        Executor::new(&graph, BTreeMap::new(), true)
            .execute_all()
            .unwrap();

        let warnings = graph.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].check, "valid_min");
        assert!(store.contains("out.arr"));
    }

    #[test]
    fn history_can_be_disabled() {
        let store = input_store();
        let catalog = Catalog::from_store(&store, &[String::from("in.arr")]).unwrap();
        let registry = FunctionRegistry::standard();
        let spec = Specification::from_json_str(CHUNK_SPEC).unwrap();
        let mut graph = Graph::build(&spec, &catalog, &registry, &store).unwrap();
        reconcile(&mut graph).unwrap();
        Executor::new(&graph, BTreeMap::new(), false)
            .execute_all()
            .unwrap();

        let image = store.image("out.arr").unwrap();
        assert!(image.variable("Tc").unwrap().attrs.get("history").is_none());
    }

    #[test]
    fn round_trip_identity_read() {
        // Writing a variable defined as a plain read of the input yields the
        // input data.
        let store = input_store();
        let spec = r#"{
            "files": {
                "out.arr": {
                    "format": "v4",
                    "dimensions": {"t": 2, "x": 3},
                    "variables": {
                        "T": {
                            "datatype": "double",
                            "dimensions": ["t", "x"],
                            "attributes": {"units": "K"},
                            "definition": "T"
                        }
                    }
                }
            }
        }"#;
        run(spec, &store, BTreeMap::new()).unwrap();

        let written = store.image("out.arr").unwrap();
        let source = store.image("in.arr").unwrap();
        assert_eq!(written.data["T"], source.data["T"]);
    }
}
