//! Coordinate transformation graphs.
//!
//! A [`CoordTransformGraph`] maps coordinate names to [`Node`]s: constants,
//! aliases of other coordinates, or pure functions of other named
//! coordinates. Graphs are plain data and can be merged. Evaluation happens in
//! two phases:
//!
//! 1. [`CoordTransformGraph::plan`] resolves the requested targets against
//!    the coordinates already available and orders the required nodes
//!    topologically. Missing inputs and cycles are reported here, before any
//!    arithmetic runs.
//! 2. [`TransformPlan::execute`] evaluates every planned node exactly once and
//!    attaches the results to a copy of the data.
//!
//! Coordinates already present on the data always take precedence over graph
//! nodes of the same name.

use bifrost_core::{
    Coord, CoordKind, DataArray, Error, Result, Variable, EVENT_DIM,
};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Signature of a graph function: input values in declaration order.
pub type NodeFn = Arc<dyn Fn(&[&Variable]) -> Result<Variable> + Send + Sync>;

/// A node of a coordinate transformation graph.
#[derive(Clone)]
pub enum Node {
    /// A fixed value, typically captured instrument parameters.
    Constant(Variable),
    /// Another coordinate under a different name.
    Alias(String),
    /// A pure function of other coordinates.
    Function { inputs: Vec<String>, func: NodeFn },
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Constant(v) => write!(f, "Constant({:?} {})", v.dims(), v.unit()),
            Node::Alias(source) => write!(f, "Alias({source})"),
            Node::Function { inputs, .. } => write!(f, "Function({inputs:?})"),
        }
    }
}

fn arity_error(expected: usize, found: usize) -> Error {
    Error::ShapeMismatch(format!(
        "graph function takes {expected} inputs, got {found}"
    ))
}

impl Node {
    /// Alias of `source`.
    #[must_use]
    pub fn alias(source: &str) -> Self {
        Node::Alias(source.to_string())
    }

    /// Function of an arbitrary number of inputs.
    #[must_use]
    pub fn function<F>(inputs: &[&str], func: F) -> Self
    where
        F: Fn(&[&Variable]) -> Result<Variable> + Send + Sync + 'static,
    {
        Node::Function {
            inputs: inputs.iter().map(ToString::to_string).collect(),
            func: Arc::new(func),
        }
    }

    /// Function of one input.
    #[must_use]
    pub fn unary<F>(input: &str, func: F) -> Self
    where
        F: Fn(&Variable) -> Result<Variable> + Send + Sync + 'static,
    {
        Self::function(&[input], move |args| match args {
            [a] => func(a),
            _ => Err(arity_error(1, args.len())),
        })
    }

    /// Function of two inputs.
    #[must_use]
    pub fn binary<F>(inputs: [&str; 2], func: F) -> Self
    where
        F: Fn(&Variable, &Variable) -> Result<Variable> + Send + Sync + 'static,
    {
        Self::function(&inputs, move |args| match args {
            [a, b] => func(a, b),
            _ => Err(arity_error(2, args.len())),
        })
    }

    /// Function of three inputs.
    #[must_use]
    pub fn ternary<F>(inputs: [&str; 3], func: F) -> Self
    where
        F: Fn(&Variable, &Variable, &Variable) -> Result<Variable> + Send + Sync + 'static,
    {
        Self::function(&inputs, move |args| match args {
            [a, b, c] => func(a, b, c),
            _ => Err(arity_error(3, args.len())),
        })
    }

    /// Function of four inputs.
    #[must_use]
    pub fn quaternary<F>(inputs: [&str; 4], func: F) -> Self
    where
        F: Fn(&Variable, &Variable, &Variable, &Variable) -> Result<Variable>
            + Send
            + Sync
            + 'static,
    {
        Self::function(&inputs, move |args| match args {
            [a, b, c, d] => func(a, b, c, d),
            _ => Err(arity_error(4, args.len())),
        })
    }
}

/// Named nodes computing coordinates from other coordinates.
#[derive(Debug, Clone, Default)]
pub struct CoordTransformGraph {
    nodes: BTreeMap<String, Node>,
}

impl CoordTransformGraph {
    /// Empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a node.
    #[must_use]
    pub fn with(mut self, name: &str, node: Node) -> Self {
        self.insert(name, node);
        self
    }

    /// Add or replace a node in place.
    pub fn insert(&mut self, name: &str, node: Node) {
        if self.nodes.insert(name.to_string(), node).is_some() {
            debug!("Graph node '{name}' overridden");
        }
    }

    /// Union of two graphs; nodes of `other` replace nodes of the same name.
    #[must_use]
    pub fn merge(mut self, other: &CoordTransformGraph) -> Self {
        for (name, node) in &other.nodes {
            self.insert(name, node.clone());
        }
        self
    }

    /// Node by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    /// Names of all nodes.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Resolve `targets` given the coordinate names in `available`.
    ///
    /// # Errors
    /// Returns [`Error::MissingCoordinate`] if a required coordinate is
    /// neither available nor computable, and [`Error::CyclicGraph`] if a
    /// node depends on itself.
    pub fn plan(&self, targets: &[&str], available: &BTreeSet<String>) -> Result<TransformPlan> {
        let mut planner = Planner {
            graph: self,
            available,
            steps: Vec::new(),
            done: BTreeSet::new(),
            visiting: Vec::new(),
        };
        for target in targets {
            planner.visit(target)?;
        }
        let plan = TransformPlan {
            targets: targets.iter().map(ToString::to_string).collect(),
            steps: planner.steps,
        };
        debug!(
            "Planned {} steps for {:?}: {:?}",
            plan.steps.len(),
            plan.targets,
            plan.steps.iter().map(|s| s.name.as_str()).collect::<Vec<_>>()
        );
        Ok(plan)
    }

    /// Plan against the coordinates of `data` and execute.
    ///
    /// # Errors
    /// Returns planning or evaluation errors.
    pub fn transform(
        &self,
        data: &DataArray,
        targets: &[&str],
        options: TransformOptions,
    ) -> Result<DataArray> {
        self.plan(targets, &available_coords(data))?
            .execute(data, options)
    }
}

/// Names of all dense and event coordinates of `data`.
#[must_use]
pub fn available_coords(data: &DataArray) -> BTreeSet<String> {
    let mut names: BTreeSet<String> = data.coords().keys().cloned().collect();
    if let Some(events) = data.events() {
        names.extend(events.coords.keys().cloned());
    }
    names
}

struct Planner<'a> {
    graph: &'a CoordTransformGraph,
    available: &'a BTreeSet<String>,
    steps: Vec<Step>,
    done: BTreeSet<String>,
    visiting: Vec<String>,
}

impl Planner<'_> {
    fn visit(&mut self, name: &str) -> Result<()> {
        if self.done.contains(name) {
            return Ok(());
        }
        if self.visiting.iter().any(|v| v == name) {
            return Err(Error::CyclicGraph(name.to_string()));
        }
        let graph = self.graph;
        let action = if self.available.contains(name) {
            Action::Input
        } else {
            match graph.get(name) {
                None => {
                    let needed_by = self
                        .visiting
                        .last()
                        .map_or(String::new(), |p| format!(" (required by '{p}')"));
                    return Err(Error::MissingCoordinate(format!("{name}{needed_by}")));
                }
                Some(Node::Constant(value)) => Action::Constant(value.clone()),
                Some(Node::Alias(source)) => {
                    self.visiting.push(name.to_string());
                    self.visit(source)?;
                    self.visiting.pop();
                    Action::Alias(source.clone())
                }
                Some(Node::Function { inputs, func }) => {
                    self.visiting.push(name.to_string());
                    for input in inputs {
                        self.visit(input)?;
                    }
                    self.visiting.pop();
                    Action::Function {
                        inputs: inputs.clone(),
                        func: Arc::clone(func),
                    }
                }
            }
        };
        self.done.insert(name.to_string());
        self.steps.push(Step {
            name: name.to_string(),
            action,
        });
        Ok(())
    }
}

#[derive(Clone)]
enum Action {
    Input,
    Constant(Variable),
    Alias(String),
    Function { inputs: Vec<String>, func: NodeFn },
}

#[derive(Clone)]
struct Step {
    name: String,
    action: Action,
}

/// Which coordinates a transformation attaches besides its targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformOptions {
    /// Keep data coordinates consumed by the transformation.
    pub keep_inputs: bool,
    /// Keep computed coordinates that are not targets.
    pub keep_intermediate: bool,
    /// Keep coordinates produced by aliases.
    pub keep_aliases: bool,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            keep_inputs: true,
            keep_intermediate: true,
            keep_aliases: true,
        }
    }
}

impl TransformOptions {
    /// Keep only targets (and untouched coordinates).
    #[must_use]
    pub fn targets_only() -> Self {
        Self {
            keep_inputs: false,
            keep_intermediate: false,
            keep_aliases: false,
        }
    }

    /// Set whether consumed inputs are kept.
    #[must_use]
    pub fn keep_inputs(mut self, keep: bool) -> Self {
        self.keep_inputs = keep;
        self
    }

    /// Set whether intermediate results are kept.
    #[must_use]
    pub fn keep_intermediate(mut self, keep: bool) -> Self {
        self.keep_intermediate = keep;
        self
    }

    /// Set whether aliases are kept.
    #[must_use]
    pub fn keep_aliases(mut self, keep: bool) -> Self {
        self.keep_aliases = keep;
        self
    }
}

/// Topologically ordered evaluation steps for a set of targets.
#[derive(Clone)]
pub struct TransformPlan {
    targets: Vec<String>,
    steps: Vec<Step>,
}

impl fmt::Debug for TransformPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformPlan")
            .field("targets", &self.targets)
            .field("steps", &self.step_names())
            .finish()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Level {
    Dense,
    Event,
}

struct Evaluated {
    var: Variable,
    kind: CoordKind,
    level: Level,
}

impl TransformPlan {
    /// Names of the planned steps in evaluation order.
    #[must_use]
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    /// Names of data coordinates the plan reads.
    #[must_use]
    pub fn inputs(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| matches!(s.action, Action::Input))
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Evaluate the plan against `data`.
    ///
    /// Each node runs once. Dense per-pixel values are gathered to events
    /// only for nodes that also read event coordinates.
    ///
    /// # Errors
    /// Returns errors raised by node functions, or shape errors when results
    /// cannot be attached to `data`.
    pub fn execute(&self, data: &DataArray, options: TransformOptions) -> Result<DataArray> {
        let mut values: BTreeMap<&str, Evaluated> = BTreeMap::new();
        for step in &self.steps {
            let evaluated = match &step.action {
                Action::Input => read_input(data, &step.name)?,
                Action::Constant(value) => Evaluated {
                    var: value.clone(),
                    kind: CoordKind::Point,
                    level: Level::Dense,
                },
                Action::Alias(source) => {
                    let source = lookup(&values, source)?;
                    Evaluated {
                        var: source.var.clone(),
                        kind: source.kind.clone(),
                        level: source.level,
                    }
                }
                Action::Function { inputs, func } => {
                    let args: Vec<&Evaluated> = inputs
                        .iter()
                        .map(|name| lookup(&values, name))
                        .collect::<Result<_>>()?;
                    evaluate_function(data, &step.name, &args, func.as_ref())?
                }
            };
            values.insert(step.name.as_str(), evaluated);
        }

        let mut out = data.clone();
        for step in &self.steps {
            let is_target = self.targets.contains(&step.name);
            let attach = is_target
                || match step.action {
                    Action::Input => options.keep_inputs,
                    Action::Alias(_) => options.keep_aliases,
                    Action::Constant(_) | Action::Function { .. } => options.keep_intermediate,
                };
            match (&step.action, attach) {
                (Action::Input, true) => {}
                (Action::Input, false) => {
                    out.remove_coord(&step.name);
                    if let Some(events) = out.events_mut() {
                        events.coords.remove(&step.name);
                    }
                }
                (_, false) => {}
                (_, true) => {
                    let evaluated = lookup(&values, &step.name)?;
                    attach_coord(&mut out, &step.name, evaluated)?;
                }
            }
        }
        Ok(out)
    }
}

fn lookup<'a>(values: &'a BTreeMap<&str, Evaluated>, name: &str) -> Result<&'a Evaluated> {
    values
        .get(name)
        .ok_or_else(|| Error::MissingCoordinate(name.to_string()))
}

fn read_input(data: &DataArray, name: &str) -> Result<Evaluated> {
    if let Some(var) = data.events().and_then(|e| e.coords.get(name)) {
        return Ok(Evaluated {
            var: var.clone(),
            kind: CoordKind::Point,
            level: Level::Event,
        });
    }
    let Coord { kind, var } = data
        .coord_entry(name)
        .ok_or_else(|| Error::MissingCoordinate(name.to_string()))?;
    Ok(Evaluated {
        var: var.clone(),
        kind: kind.clone(),
        level: Level::Dense,
    })
}

fn depends_on_data_dims(data: &DataArray, var: &Variable) -> bool {
    var.dims().iter().any(|d| data.dims().contains(d))
}

fn evaluate_function(
    data: &DataArray,
    name: &str,
    args: &[&Evaluated],
    func: &(dyn Fn(&[&Variable]) -> Result<Variable> + Send + Sync),
) -> Result<Evaluated> {
    let event_level = args.iter().any(|a| a.level == Level::Event);
    let var = if event_level {
        let events = data.require_events()?;
        let mut gathered: Vec<Variable> = Vec::with_capacity(args.len());
        for arg in args {
            if arg.level == Level::Dense && depends_on_data_dims(data, &arg.var) {
                if matches!(arg.kind, CoordKind::BinEdges { .. }) {
                    return Err(Error::Unsupported(format!(
                        "'{name}' mixes event coordinates with bin edges"
                    )));
                }
                gathered.push(arg.var.gather(data.dims(), data.shape(), &events.bin, EVENT_DIM)?);
            } else {
                gathered.push(arg.var.clone());
            }
        }
        let refs: Vec<&Variable> = gathered.iter().collect();
        func(&refs)?
    } else {
        let refs: Vec<&Variable> = args.iter().map(|a| &a.var).collect();
        func(&refs)?
    };
    let level = if event_level { Level::Event } else { Level::Dense };
    let kind = match level {
        Level::Event => CoordKind::Point,
        Level::Dense => edge_kind(data, args, &var),
    };
    Ok(Evaluated { var, kind, level })
}

/// Results keep the bin-edge tag of an input if they still have one extra
/// element along that dimension.
fn edge_kind(data: &DataArray, args: &[&Evaluated], var: &Variable) -> CoordKind {
    for arg in args {
        if let CoordKind::BinEdges { dim } = &arg.kind {
            let is_edges = match (var.size_of(dim), data.size_of(dim)) {
                (Some(n), Some(size)) => n == size + 1,
                _ => false,
            };
            if is_edges {
                return arg.kind.clone();
            }
        }
    }
    CoordKind::Point
}

fn attach_coord(out: &mut DataArray, name: &str, evaluated: &Evaluated) -> Result<()> {
    match evaluated.level {
        Level::Event => {
            out.remove_coord(name);
            let events = out.events_mut().ok_or_else(|| {
                Error::Unsupported(format!("event coordinate '{name}' on dense data"))
            })?;
            events.insert_coord(name, evaluated.var.clone())
        }
        Level::Dense => out.insert_coord_entry(
            name,
            Coord {
                kind: evaluated.kind.clone(),
                var: evaluated.var.clone(),
            },
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bifrost_core::{EventTable, Unit};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pixels() -> DataArray {
        let mut events = EventTable::unit_weights(vec![0, 1, 1, 2]);
        events
            .insert_coord(
                "toa",
                Variable::floats_1d(EVENT_DIM, vec![1.0, 2.0, 3.0, 4.0], Unit::SECOND),
            )
            .unwrap();
        let mut da = DataArray::binned(&["pixel"], &[3], events, Unit::COUNTS).unwrap();
        da.insert_coord(
            "L",
            Variable::floats_1d("pixel", vec![10.0, 20.0, 30.0], Unit::METER),
        )
        .unwrap();
        da
    }

    fn speed_graph(counter: Arc<AtomicUsize>) -> CoordTransformGraph {
        CoordTransformGraph::new()
            .with("length", Node::alias("L"))
            .with(
                "speed",
                Node::binary(["length", "toa"], move |l, t| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    l.try_div(t)
                }),
            )
            .with("double_speed", Node::unary("speed", |v| v.scaled(2.0)))
            .with(
                "both",
                Node::binary(["speed", "double_speed"], |a, b| a.try_add(b)),
            )
    }

    #[test]
    fn test_shared_nodes_evaluate_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let graph = speed_graph(Arc::clone(&counter));
        let out = graph
            .transform(&pixels(), &["both", "speed"], TransformOptions::default())
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let speed = out.events().unwrap().coord("speed").unwrap();
        assert_eq!(speed.unit(), Unit::METER_PER_SECOND);
        assert_eq!(speed.to_vec::<f64>().unwrap(), vec![10.0, 10.0, 20.0 / 3.0, 7.5]);
        // Per-pixel alias stays dense.
        assert_eq!(out.coord("length").unwrap().dims(), ["pixel"]);
    }

    #[test]
    fn test_options_control_attached_coords() {
        let graph = speed_graph(Arc::new(AtomicUsize::new(0)));
        let out = graph
            .transform(&pixels(), &["both"], TransformOptions::targets_only())
            .unwrap();
        let events = out.events().unwrap();
        assert!(events.coords.contains_key("both"));
        assert!(!events.coords.contains_key("speed"));
        assert!(!events.coords.contains_key("toa"));
        assert!(out.coord("L").is_err());
        assert!(out.coord("length").is_err());
    }

    #[test]
    fn test_missing_input_fails_before_evaluation() {
        let counter = Arc::new(AtomicUsize::new(0));
        let graph = speed_graph(Arc::clone(&counter))
            .with("needs_mass", Node::binary(["speed", "mass"], |a, b| a.try_mul(b)));
        let err = graph
            .plan(&["needs_mass"], &available_coords(&pixels()))
            .unwrap_err();
        assert!(matches!(err, Error::MissingCoordinate(ref m) if m.starts_with("mass")));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let graph = CoordTransformGraph::new()
            .with("a", Node::unary("b", |v| Ok(v.clone())))
            .with("b", Node::unary("a", |v| Ok(v.clone())));
        let err = graph.plan(&["a"], &BTreeSet::new()).unwrap_err();
        assert_eq!(err, Error::CyclicGraph("a".to_string()));
    }

    #[test]
    fn test_existing_coords_take_precedence() {
        let graph = CoordTransformGraph::new().with(
            "L",
            Node::Constant(Variable::scalar(-1.0, Unit::METER)),
        );
        let plan = graph.plan(&["L"], &available_coords(&pixels())).unwrap();
        assert_eq!(plan.inputs(), vec!["L"]);
    }

    #[test]
    fn test_merge_overrides() {
        let first = CoordTransformGraph::new().with("x", Node::alias("a"));
        let second = CoordTransformGraph::new().with("x", Node::alias("b"));
        let merged = first.merge(&second);
        assert!(matches!(merged.get("x"), Some(Node::Alias(s)) if s == "b"));
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_bin_edges_propagate() {
        let data = Variable::floats_1d("tof", vec![1.0, 1.0], Unit::COUNTS);
        let mut da = DataArray::dense(&data, None).unwrap();
        da.insert_edges(
            "tof",
            "tof",
            Variable::floats_1d("tof", vec![0.0, 1.0, 2.0], Unit::SECOND),
        )
        .unwrap();
        let graph = CoordTransformGraph::new()
            .with("twice", Node::unary("tof", |t| t.scaled(2.0)));
        let out = graph
            .transform(&da, &["twice"], TransformOptions::default())
            .unwrap();
        assert!(out.coord_entry("twice").unwrap().is_edges());
    }
}
