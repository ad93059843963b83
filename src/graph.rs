use std::cell::{Ref, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;
use std::sync::Mutex;

use lazy_static::lazy_static;
use log::{debug, trace};
use ndarray::prelude::*;

use topological_sort::TopologicalSort;

use crate::error::TrackerError;
use crate::operations::Operation;
use crate::registry;

lazy_static! {
    static ref COUNTER: Mutex<u64> = Mutex::new(0);
}

fn generate_sequential_value_id() -> String {
    let mut num = COUNTER.lock().unwrap();
    *num += 1;
    format!("TrackedValue{}", num)
}

/// One node in the dynamic computation graph: the raw array, a gradient
/// accumulator of the same shape, and (for non-leaves) the call record that
/// produced it. The data is immutable once the node is built; only the
/// accumulator is interiorly mutable, and only the backward traversal writes
/// to it.
pub struct TrackedValue {
    identifier: String,
    data: ArrayD<f32>,
    requires_gradient: bool,
    gradient: RefCell<ArrayD<f32>>,
    producer: Option<CallRecord>,
}

impl fmt::Debug for TrackedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedValue")
            .field("identifier", &self.identifier)
            .field("data", &self.data)
            .field("gradient", &self.gradient)
            .finish()
    }
}

impl PartialEq for TrackedValue {
    // equality is about the arrays, not graph identity; the traversal keys
    // its bookkeeping by identifier instead
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl TrackedValue {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn data(&self) -> &ArrayD<f32> {
        &self.data
    }

    pub fn gradient(&self) -> Ref<'_, ArrayD<f32>> {
        self.gradient.borrow()
    }

    pub fn requires_gradient(&self) -> bool {
        self.requires_gradient
    }

    pub fn producer(&self) -> Option<&CallRecord> {
        self.producer.as_ref()
    }

    pub fn zero_gradient(&self) {
        self.gradient.borrow_mut().fill(0.);
    }

    fn accumulate_gradient(&self, contribution: &ArrayD<f32>) {
        // read-modify-write, never overwrite: a node can receive
        // contributions from several consumers
        *self.gradient.borrow_mut() += contribution;
    }
}

pub struct TrackedValueBuilder {
    data: ArrayD<f32>,
    identifier: Option<String>,
    requires_gradient: bool,
    producer: Option<CallRecord>,
}

impl TrackedValueBuilder {
    pub fn new(data: ArrayD<f32>) -> TrackedValueBuilder {
        TrackedValueBuilder {
            data,
            identifier: None,
            requires_gradient: true,
            producer: None,
        }
    }

    pub fn identifier(mut self, identifier: &str) -> TrackedValueBuilder {
        self.identifier = Some(identifier.to_owned());
        self
    }

    pub fn requires_gradient(mut self, requires: bool) -> TrackedValueBuilder {
        self.requires_gradient = requires;
        self
    }

    pub(crate) fn producer(mut self, record: CallRecord) -> TrackedValueBuilder {
        self.producer = Some(record);
        self
    }

    pub fn build(self) -> TrackedValue {
        let gradient = Array::zeros(self.data.shape()).into_dyn();
        TrackedValue {
            identifier: match self.identifier {
                Some(identifier) => identifier,
                None => generate_sequential_value_id(),
            },
            data: self.data,
            requires_gradient: self.requires_gradient,
            gradient: RefCell::new(gradient),
            producer: self.producer,
        }
    }
}

/// An immutable record of one applied operation: the backward rule (with any
/// non-differentiable parameters captured as fields on the operation) and the
/// input nodes it consumed, in call order. The same input may appear twice.
pub struct CallRecord {
    operation: Box<dyn Operation>,
    inputs: Vec<Rc<TrackedValue>>,
}

impl CallRecord {
    pub fn operation(&self) -> &dyn Operation {
        self.operation.as_ref()
    }

    pub fn inputs(&self) -> &[Rc<TrackedValue>] {
        &self.inputs
    }
}

/// The dispatch surface: either a plain array (no derivative bookkeeping at
/// all) or a node in the computation graph. Whether a primitive call gets
/// recorded is decided purely by whether any of its arguments is `Tracked`.
#[derive(Clone)]
pub enum Value {
    Raw(ArrayD<f32>),
    Tracked(Rc<TrackedValue>),
}

impl Value {
    pub fn is_tracked(&self) -> bool {
        matches!(self, Value::Tracked(_))
    }

    pub fn view(&self) -> ArrayViewD<'_, f32> {
        match self {
            Value::Raw(array) => array.view(),
            Value::Tracked(node) => node.data.view(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Value::Raw(array) => array.shape(),
            Value::Tracked(node) => node.data.shape(),
        }
    }

    pub fn node(&self) -> Option<&Rc<TrackedValue>> {
        match self {
            Value::Tracked(node) => Some(node),
            Value::Raw(_) => None,
        }
    }

    /// The accumulated gradient, if this value participates in tracking.
    pub fn gradient(&self) -> Option<ArrayD<f32>> {
        match self {
            Value::Tracked(node) => Some(node.gradient.borrow().clone()),
            Value::Raw(_) => None,
        }
    }

    pub fn zero_gradient(&self) {
        if let Value::Tracked(node) = self {
            node.zero_gradient();
        }
    }

    /// In-place element assignment. Allowed on raw arrays; rejected on
    /// tracked values, because a destructive write would falsify every
    /// recorded derivative that read the old element.
    pub fn set_element(&mut self, index: &[usize], element: f32) -> Result<(), TrackerError> {
        match self {
            Value::Raw(array) => {
                array[index] = element;
                Ok(())
            }
            Value::Tracked(_) => Err(TrackerError::UnsupportedMutation),
        }
    }

    fn into_node(self) -> Rc<TrackedValue> {
        match self {
            Value::Tracked(node) => node,
            // untracked arguments still need to be readable during the
            // backward pass, but they never accumulate gradient
            Value::Raw(array) => Rc::new(
                TrackedValueBuilder::new(array)
                    .requires_gradient(false)
                    .build(),
            ),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.view() == other.view()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Raw(array) => f.debug_tuple("Raw").field(array).finish(),
            Value::Tracked(node) => f.debug_tuple("Tracked").field(node).finish(),
        }
    }
}

/// Wrap raw data as a tracked leaf.
pub fn leaf(data: ArrayD<f32>) -> Value {
    Value::Tracked(Rc::new(TrackedValueBuilder::new(data).build()))
}

/// Wrap raw data as an untracked constant.
pub fn constant(data: ArrayD<f32>) -> Value {
    Value::Raw(data)
}

/// Extract the raw data of a value.
pub fn data(value: &Value) -> ArrayD<f32> {
    match value {
        Value::Raw(array) => array.clone(),
        Value::Tracked(node) => node.data.clone(),
    }
}

/// The accumulated gradient of a value after a backward traversal.
pub fn gradient(value: &Value) -> Option<ArrayD<f32>> {
    value.gradient()
}

/// Execute a primitive on the arguments' raw data and, if any argument is
/// tracked, record a call so the result participates in backward traversal.
/// With no tracked argument the recording layer is bypassed entirely.
pub fn track(operation: Box<dyn Operation>, inputs: Vec<Value>) -> Value {
    let descriptor = registry::descriptor(operation.name())
        .unwrap_or_else(|| panic!("operation {:?} should be registered", operation.name()));
    assert!(
        descriptor.arity.admits(inputs.len()),
        "operation {} takes {} inputs, got {}",
        operation.name(),
        descriptor.arity,
        inputs.len()
    );
    let primal = {
        let views = inputs.iter().map(|input| input.view()).collect::<Vec<_>>();
        operation.evaluate(&views)
    };
    if !inputs.iter().any(|input| input.is_tracked()) {
        return Value::Raw(primal);
    }
    trace!("recording {} over {} inputs", operation.name(), inputs.len());
    let parents = inputs
        .into_iter()
        .map(|input| input.into_node())
        .collect::<Vec<_>>();
    let record = CallRecord {
        operation,
        inputs: parents,
    };
    Value::Tracked(Rc::new(TrackedValueBuilder::new(primal).producer(record).build()))
}

fn register_parents(
    sorter: &mut TopologicalSort<String>,
    nodes: &mut HashMap<String, Rc<TrackedValue>>,
    child: Rc<TrackedValue>,
) {
    if nodes.insert(child.identifier.clone(), child.clone()).is_some() {
        return;
    }
    if let Some(record) = &child.producer {
        let mut edged = HashSet::new();
        for parent in &record.inputs {
            // a record may consume the same input twice; one edge suffices
            if edged.insert(parent.identifier.clone()) {
                sorter.add_dependency(parent.identifier.clone(), child.identifier.clone());
            }
            register_parents(sorter, nodes, parent.clone());
        }
    }
}

fn drain_sorted(mut sorter: TopologicalSort<String>) -> Result<Vec<String>, TrackerError> {
    let mut sorted = Vec::new();
    while let Some(identifier) = sorter.pop() {
        sorted.push(identifier);
    }
    if sorter.len() > 0 {
        // nodes with unresolvable dependencies remain: the "graph" loops
        return Err(TrackerError::CyclicGraph);
    }
    // We actually want reverse-topological order
    sorted.reverse();
    Ok(sorted)
}

fn sorted_computation_graph(
    culmination: Rc<TrackedValue>,
) -> Result<Vec<Rc<TrackedValue>>, TrackerError> {
    let mut sorter = TopologicalSort::new();
    let mut nodes = HashMap::new();
    register_parents(&mut sorter, &mut nodes, culmination);
    Ok(drain_sorted(sorter)?
        .into_iter()
        .map(|identifier| {
            nodes
                .remove(&identifier)
                .expect("every sorted identifier should have a registered node")
        })
        .collect())
}

/// Walk the call-record graph from `culmination` back to every reachable
/// node, accumulating gradients. Without an explicit out-gradient the
/// culmination must be a single-element value, and the seed is one.
pub fn back(
    culmination: &Rc<TrackedValue>,
    out_gradient: Option<ArrayD<f32>>,
) -> Result<(), TrackerError> {
    let seed = match out_gradient {
        Some(seed) => {
            assert_eq!(
                seed.shape(),
                culmination.data.shape(),
                "out-gradient shape should match the value shape"
            );
            seed
        }
        None => {
            if culmination.data.len() != 1 {
                return Err(TrackerError::NotScalar {
                    identifier: culmination.identifier.clone(),
                });
            }
            Array::ones(culmination.data.shape()).into_dyn()
        }
    };

    if culmination.producer.is_none() {
        culmination.accumulate_gradient(&seed);
        return Ok(());
    }

    let sorted = sorted_computation_graph(culmination.clone())?;
    debug!(
        "backward traversal over {} nodes from {}",
        sorted.len(),
        culmination.identifier
    );

    let mut gradients = HashMap::<String, ArrayD<f32>>::new();
    gradients.insert(culmination.identifier.clone(), seed);
    for node in sorted {
        let Some(gradient) = gradients.remove(&node.identifier) else {
            // reachable only through no-gradient slots (e.g. index inputs)
            continue;
        };

        if node.requires_gradient {
            node.accumulate_gradient(&gradient);
        }

        if let Some(record) = &node.producer {
            let contributions = record.operation.backward(&gradient, &record.inputs);
            if contributions.len() != record.inputs.len() {
                return Err(TrackerError::GradientArityMismatch {
                    operation: record.operation.name(),
                    expected: record.inputs.len(),
                    actual: contributions.len(),
                });
            }
            for (parent, contribution) in record.inputs.iter().zip(contributions) {
                let Some(contribution) = contribution else {
                    continue;
                };
                match gradients.get_mut(&parent.identifier) {
                    Some(gradient) => {
                        *gradient = &*gradient + &contribution;
                    }
                    None => {
                        gradients.insert(parent.identifier.clone(), contribution);
                    }
                }
            }
        }
    }
    Ok(())
}

/// Trigger a backward traversal from a value. A no-op for raw values, which
/// carry no graph.
pub fn backward(value: &Value, out_gradient: Option<ArrayD<f32>>) -> Result<(), TrackerError> {
    match value {
        Value::Tracked(node) => back(node, out_gradient),
        Value::Raw(_) => Ok(()),
    }
}
