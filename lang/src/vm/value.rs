use std::{cell::RefCell, fmt::Display, rc::Rc};

use itertools::Itertools;

use crate::bytecode::{Constant, FunctionIndex, TypeIndex};

#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Unit,
    Int(i64),
    Bool(bool),
    Str(Rc<str>),
    Array(Rc<Vec<Value>>),
    Seq(Rc<LazySeq>),
    Closure(Rc<Closure>),
    Object(Rc<RefCell<Instance>>),
    /// Iteration state of a `for` loop; never visible to guest code.
    Cursor { items: Rc<Vec<Value>>, pos: usize },
}

#[derive(Debug)]
pub struct Closure {
    pub function: FunctionIndex,
    pub captures: Vec<Value>,
}

#[derive(Debug)]
pub struct Instance {
    pub ty: TypeIndex,
    pub type_name: String,
    pub fields: Vec<Value>,
}

/// A sequence whose elements are only computed when something enumerates it.
///
/// Stacking a filter or map copies the stage list rather than pointing at
/// the previous sequence, so enumerating and dropping never recurse.
#[derive(Debug, Default)]
pub struct LazySeq {
    pub source: Rc<Vec<Value>>,
    pub stages: Vec<SeqStage>,
}

#[derive(Debug, Clone)]
pub enum SeqStage {
    Filter(Rc<Closure>),
    Map(Rc<Closure>),
}

impl LazySeq {
    pub fn new(source: Rc<Vec<Value>>) -> Self {
        LazySeq {
            source,
            stages: vec![],
        }
    }

    /// This sequence with one more stage, or `None` past `limit` stages.
    pub fn then(&self, stage: SeqStage, limit: usize) -> Option<LazySeq> {
        if self.stages.len() >= limit {
            return None;
        }
        let mut stages = Vec::with_capacity(self.stages.len() + 1);
        stages.extend(self.stages.iter().cloned());
        stages.push(stage);
        Some(LazySeq {
            source: self.source.clone(),
            stages,
        })
    }
}

/// Tears down nested values with a worklist. Chains of closures, sequences
/// and objects built by a guest loop can be far deeper than the host stack.
fn release(mut pending: Vec<Value>) {
    while let Some(value) = pending.pop() {
        match value {
            Value::Array(items) | Value::Cursor { items, .. } => {
                if let Ok(items) = Rc::try_unwrap(items) {
                    pending.extend(items);
                }
            }
            Value::Closure(closure) => {
                if let Ok(mut closure) = Rc::try_unwrap(closure) {
                    pending.append(&mut closure.captures);
                }
            }
            Value::Object(object) => {
                if let Ok(object) = Rc::try_unwrap(object) {
                    pending.append(&mut object.into_inner().fields);
                }
            }
            Value::Seq(seq) => {
                if let Ok(mut seq) = Rc::try_unwrap(seq) {
                    seq.drain_into(&mut pending);
                }
            }
            Value::Unit | Value::Int(_) | Value::Bool(_) | Value::Str(_) => {}
        }
    }
}

impl LazySeq {
    fn drain_into(&mut self, pending: &mut Vec<Value>) {
        pending.push(Value::Array(std::mem::take(&mut self.source)));
        pending.extend(self.stages.drain(..).map(|stage| match stage {
            SeqStage::Filter(closure) | SeqStage::Map(closure) => Value::Closure(closure),
        }));
    }
}

impl Drop for LazySeq {
    fn drop(&mut self) {
        let mut pending = vec![];
        self.drain_into(&mut pending);
        release(pending);
    }
}

impl Drop for Closure {
    fn drop(&mut self) {
        release(std::mem::take(&mut self.captures));
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        release(std::mem::take(&mut self.fields));
    }
}

impl Value {
    pub fn r#type(&self) -> ValueType {
        match self {
            Value::Unit => ValueType::Unit,
            Value::Int(_) => ValueType::Int,
            Value::Bool(_) => ValueType::Bool,
            Value::Str(_) => ValueType::Str,
            Value::Array(_) => ValueType::Array,
            Value::Seq(_) => ValueType::Seq,
            Value::Closure(_) => ValueType::Closure,
            Value::Object(_) => ValueType::Object,
            Value::Cursor { .. } => ValueType::Cursor,
        }
    }

    pub fn str(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }

    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(items))
    }

    /// Views an array or a sequence as a sequence without enumerating it.
    pub fn into_seq(self) -> Result<Rc<LazySeq>, ConversionError> {
        match self {
            Value::Seq(seq) => Ok(seq),
            Value::Array(items) => Ok(Rc::new(LazySeq::new(items))),
            other => Err(ConversionError {
                found: other.r#type(),
                expected: ValueType::Seq,
            }),
        }
    }

    /// Structural equality for plain data, identity for objects.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Unit, Value::Unit) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(a, b)| a.equals(b))
            }
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Seq(a), Value::Seq(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<&Constant> for Value {
    fn from(value: &Constant) -> Self {
        match value {
            Constant::Unit => Value::Unit,
            Constant::Int(i) => Value::Int(*i),
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Str(s) => Value::str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

/// Sequences print opaquely so that printing never runs guest code.
impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Unit => write!(f, "()"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Array(items) => write!(f, "[{}]", items.iter().join(", ")),
            Value::Seq(_) => write!(f, "<seq>"),
            Value::Closure(_) => write!(f, "<fn>"),
            Value::Object(o) => write!(f, "<{}>", o.borrow().type_name),
            Value::Cursor { .. } => write!(f, "<cursor>"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum ValueType {
    Unit,
    Int,
    Bool,
    Str,
    Array,
    Seq,
    Closure,
    Object,
    Cursor,
}

impl Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueType::Unit => write!(f, "unit"),
            ValueType::Int => write!(f, "int"),
            ValueType::Bool => write!(f, "bool"),
            ValueType::Str => write!(f, "str"),
            ValueType::Array => write!(f, "array"),
            ValueType::Seq => write!(f, "seq"),
            ValueType::Closure => write!(f, "closure"),
            ValueType::Object => write!(f, "object"),
            ValueType::Cursor => write!(f, "cursor"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("expected {expected}, found {found}")]
pub struct ConversionError {
    pub found: ValueType,
    pub expected: ValueType,
}

macro_rules! conversions {
    {
        $(($target:ty, $variant:ident, $expected:ident),)*
    } => {
        $(
            impl TryFrom<Value> for $target {
                type Error = ConversionError;
                fn try_from(value: Value) -> Result<Self, Self::Error> {
                    match value {
                        Value::$variant(v) => Ok(v),
                        other => Err(ConversionError {
                            found: other.r#type(),
                            expected: ValueType::$expected,
                        }),
                    }
                }
            }
        )*
    };
}

conversions! {
    (i64, Int, Int),
    (bool, Bool, Bool),
    (Rc<str>, Str, Str),
    (Rc<Vec<Value>>, Array, Array),
    (Rc<Closure>, Closure, Closure),
    (Rc<RefCell<Instance>>, Object, Object),
}
