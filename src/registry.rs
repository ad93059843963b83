use std::collections::HashMap;
use std::fmt;

use lazy_static::lazy_static;

/// How many inputs an operation accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn admits(&self, count: usize) -> bool {
        match self {
            Arity::Exactly(n) => count == *n,
            Arity::AtLeast(n) => count >= *n,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exactly(n) => write!(f, "exactly {}", n),
            Arity::AtLeast(n) => write!(f, "at least {}", n),
        }
    }
}

pub struct OperationDescriptor {
    pub name: &'static str,
    pub arity: Arity,
}

lazy_static! {
    static ref OPERATION_REGISTRY: HashMap<&'static str, OperationDescriptor> = {
        let mut registry = HashMap::new();
        for descriptor in [
            OperationDescriptor { name: "negate", arity: Arity::Exactly(1) },
            OperationDescriptor { name: "transpose", arity: Arity::Exactly(1) },
            OperationDescriptor { name: "slice", arity: Arity::Exactly(1) },
            OperationDescriptor { name: "take", arity: Arity::Exactly(2) },
            OperationDescriptor { name: "reshape", arity: Arity::Exactly(1) },
            OperationDescriptor { name: "permute", arity: Arity::Exactly(1) },
            OperationDescriptor { name: "repeat", arity: Arity::Exactly(1) },
            OperationDescriptor { name: "concatenate", arity: Arity::AtLeast(1) },
            OperationDescriptor { name: "add", arity: Arity::Exactly(2) },
            OperationDescriptor { name: "multiply", arity: Arity::Exactly(2) },
            OperationDescriptor { name: "dot", arity: Arity::Exactly(2) },
            OperationDescriptor { name: "matmul", arity: Arity::Exactly(2) },
            OperationDescriptor { name: "diagonal", arity: Arity::Exactly(1) },
            OperationDescriptor { name: "sum", arity: Arity::Exactly(1) },
            OperationDescriptor { name: "mean", arity: Arity::Exactly(1) },
            OperationDescriptor { name: "product", arity: Arity::Exactly(1) },
            OperationDescriptor { name: "maximum", arity: Arity::Exactly(1) },
            OperationDescriptor { name: "minimum", arity: Arity::Exactly(1) },
            OperationDescriptor { name: "softmax", arity: Arity::Exactly(1) },
            OperationDescriptor { name: "log_softmax", arity: Arity::Exactly(1) },
            OperationDescriptor { name: "conv2d", arity: Arity::Exactly(2) },
            OperationDescriptor { name: "max_pool2d", arity: Arity::Exactly(1) },
            OperationDescriptor { name: "mean_pool2d", arity: Arity::Exactly(1) },
            OperationDescriptor { name: "broadcast", arity: Arity::AtLeast(1) },
        ] {
            registry.insert(descriptor.name, descriptor);
        }
        registry
    };
}

pub fn descriptor(name: &str) -> Option<&'static OperationDescriptor> {
    OPERATION_REGISTRY.get(name)
}
