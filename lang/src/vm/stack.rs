use crate::{
    bytecode::{FunctionIndex, ImportIndex, TypeIndex},
    runtime::NativeError,
    vm::value::{ConversionError, Value, ValueType},
};

/// Operand stack of a single call frame.
#[derive(Debug, Default, Clone)]
pub struct Stack {
    inner: Vec<Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("operand stack empty")]
    EmptyStack,

    #[error("type mismatch: {0}")]
    TypeMismatch(#[from] ConversionError),

    #[error("division by zero")]
    DivisionByZero,

    #[error("integer overflow in `{op}`")]
    Overflow { op: &'static str },

    #[error("index out of bounds: {index}, length: {len}")]
    IndexOutOfBounds { index: i64, len: usize },

    #[error("explicit panic: {0}")]
    ExplicitPanic(String),

    #[error("call depth limit of {limit} exceeded")]
    StackOverflow { limit: usize },

    #[error("in native function {function}: {source}")]
    Native {
        function: String,
        #[source]
        source: NativeError,
    },

    #[error("field {field} does not exist on {type_name}")]
    MissingField { type_name: String, field: usize },

    #[error("`for` over a {found} value")]
    NotIterable { found: ValueType },

    #[error("{function} takes {expected} arguments, got {found}")]
    Arity {
        function: String,
        expected: usize,
        found: usize,
    },

    #[error("function {0:?} does not exist")]
    MissingFunction(FunctionIndex),

    #[error("type {0:?} does not exist")]
    MissingType(TypeIndex),

    #[error("import {0:?} is not linked")]
    MissingImport(ImportIndex),
}

impl Stack {
    pub fn pop(&mut self) -> Result<Value, EvalError> {
        self.inner.pop().ok_or(EvalError::EmptyStack)
    }

    /// Pops and converts in one step.
    pub fn pop_as<T>(&mut self) -> Result<T, EvalError>
    where
        T: TryFrom<Value, Error = ConversionError>,
    {
        Ok(T::try_from(self.pop()?)?)
    }

    pub fn push(&mut self, value: Value) {
        self.inner.push(value)
    }

    /// Pops the top `count` values, oldest first.
    pub fn pop_n(&mut self, count: usize) -> Result<Vec<Value>, EvalError> {
        let Some(at) = self.inner.len().checked_sub(count) else {
            return Err(EvalError::EmptyStack);
        };
        Ok(self.inner.split_off(at))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
