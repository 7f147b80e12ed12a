use std::{cell::RefCell, rc::Rc};

use tracing::trace;

use crate::{
    bytecode::{BinaryOp, Function, FunctionIndex, ImportIndex, Op, TypeIndex, UnaryOp},
    loader::LinkedModule,
    runtime::{Console, NativeError},
};

mod stack;
mod value;

pub use stack::*;
pub use value::*;

pub const MAX_CALL_DEPTH: usize = 200;

/// How many filters and maps may be stacked onto one sequence.
pub const MAX_SEQ_STAGES: usize = 1024;

/// Interpreter over one linked module.
///
/// Every call gets its own operand stack and local slots; guest calls
/// recurse on the host stack, bounded by [`MAX_CALL_DEPTH`].
pub struct Vm<'m> {
    module: &'m LinkedModule,
    console: Console,
    depth: usize,
}

impl<'m> Vm<'m> {
    pub fn new(module: &'m LinkedModule, console: Console) -> Self {
        Vm {
            module,
            console,
            depth: 0,
        }
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    pub fn call(&mut self, function: FunctionIndex, args: Vec<Value>) -> Result<Value, EvalError> {
        let module = self.module;
        let func = module
            .image
            .functions
            .get(function)
            .ok_or(EvalError::MissingFunction(function))?;
        if args.len() != func.arity {
            return Err(EvalError::Arity {
                function: func.name.clone(),
                expected: func.arity,
                found: args.len(),
            });
        }
        if self.depth >= MAX_CALL_DEPTH {
            return Err(EvalError::StackOverflow {
                limit: MAX_CALL_DEPTH,
            });
        }

        let mut locals = args;
        locals.resize(func.locals, Value::Unit);
        self.depth += 1;
        trace!(function = %func.name, depth = self.depth, "call");
        let result = self.run(func, &mut locals);
        self.depth -= 1;
        result
    }

    pub fn call_closure(&mut self, closure: &Closure, args: Vec<Value>) -> Result<Value, EvalError> {
        let mut all = closure.captures.clone();
        all.extend(args);
        self.call(closure.function, all)
    }

    /// Allocates an instance and runs the field initializers.
    pub fn construct(&mut self, ty: TypeIndex) -> Result<Value, EvalError> {
        let module = self.module;
        let def = module.image.types.get(ty).ok_or(EvalError::MissingType(ty))?;
        let instance = Value::Object(Rc::new(RefCell::new(Instance {
            ty,
            type_name: def.full_name(),
            fields: vec![Value::Unit; def.fields.len()],
        })));
        if let Some(initializer) = def.initializer {
            self.call(initializer, vec![instance.clone()])?;
        }
        Ok(instance)
    }

    /// Enumerates a lazy sequence, running any pending filters and maps.
    pub fn force(&mut self, seq: &LazySeq) -> Result<Vec<Value>, EvalError> {
        let mut items = seq.source.as_ref().clone();
        for stage in &seq.stages {
            items = match stage {
                SeqStage::Filter(predicate) => {
                    let mut kept = vec![];
                    for item in items {
                        let keep: bool = self.call_closure(predicate, vec![item.clone()])?.try_into()?;
                        if keep {
                            kept.push(item);
                        }
                    }
                    kept
                }
                SeqStage::Map(mapper) => items
                    .into_iter()
                    .map(|item| self.call_closure(mapper, vec![item]))
                    .collect::<Result<_, _>>()?,
            };
        }
        Ok(items)
    }

    fn call_native(&mut self, import: ImportIndex, args: Vec<Value>) -> Result<Value, EvalError> {
        let module = self.module;
        let native = module
            .natives
            .get(import)
            .ok_or(EvalError::MissingImport(import))?;
        (native.func)(self, args).map_err(|e| match e {
            NativeError::Eval(inner) => *inner,
            source => EvalError::Native {
                function: native.name.clone(),
                source,
            },
        })
    }

    fn run(&mut self, func: &'m Function, locals: &mut [Value]) -> Result<Value, EvalError> {
        let mut stack = Stack::default();
        let mut pc = 0;
        while let Some(op) = func.code.get(pc) {
            pc += 1;
            match op {
                Op::Push(constant) => stack.push(constant.into()),
                Op::Load(slot) => stack.push(locals[*slot].clone()),
                Op::Store(slot) => locals[*slot] = stack.pop()?,
                Op::LoadField(field) => {
                    let object: Rc<RefCell<Instance>> = stack.pop_as()?;
                    let object = object.borrow();
                    let value = object
                        .fields
                        .get(*field)
                        .cloned()
                        .ok_or_else(|| EvalError::MissingField {
                            type_name: object.type_name.clone(),
                            field: *field,
                        })?;
                    stack.push(value);
                }
                Op::StoreField(field) => {
                    let value = stack.pop()?;
                    let object: Rc<RefCell<Instance>> = stack.pop_as()?;
                    let mut object = object.borrow_mut();
                    let type_name = object.type_name.clone();
                    let Some(slot) = object.fields.get_mut(*field) else {
                        return Err(EvalError::MissingField {
                            type_name,
                            field: *field,
                        });
                    };
                    *slot = value;
                }
                Op::Pop => {
                    stack.pop()?;
                }
                Op::Unary(op) => {
                    let operand = stack.pop()?;
                    stack.push(unary(*op, operand)?);
                }
                Op::Binary(op) => {
                    let rhs = stack.pop()?;
                    let lhs = stack.pop()?;
                    stack.push(binary(*op, lhs, rhs)?);
                }
                Op::MakeArray(len) => {
                    let items = stack.pop_n(*len)?;
                    stack.push(Value::array(items));
                }
                Op::Index => {
                    let index: i64 = stack.pop_as()?;
                    let items: Rc<Vec<Value>> = stack.pop_as()?;
                    let item = usize::try_from(index)
                        .ok()
                        .and_then(|i| items.get(i))
                        .cloned()
                        .ok_or(EvalError::IndexOutOfBounds {
                            index,
                            len: items.len(),
                        })?;
                    stack.push(item);
                }
                Op::MakeClosure { function, captures } => {
                    let captures = stack.pop_n(*captures)?;
                    stack.push(Value::Closure(Rc::new(Closure {
                        function: *function,
                        captures,
                    })));
                }
                Op::New(ty) => {
                    let instance = self.construct(*ty)?;
                    stack.push(instance);
                }
                Op::Call { function, argc } => {
                    let args = stack.pop_n(*argc)?;
                    let result = self.call(*function, args)?;
                    stack.push(result);
                }
                Op::CallClosure { argc } => {
                    let args = stack.pop_n(*argc)?;
                    let closure: Rc<Closure> = stack.pop_as()?;
                    let result = self.call_closure(&closure, args)?;
                    stack.push(result);
                }
                Op::CallNative { import, argc } => {
                    let args = stack.pop_n(*argc)?;
                    let result = self.call_native(*import, args)?;
                    stack.push(result);
                }
                Op::IterStart => {
                    let items = match stack.pop()? {
                        Value::Array(items) => items,
                        Value::Seq(seq) => Rc::new(self.force(&seq)?),
                        other => {
                            return Err(EvalError::NotIterable {
                                found: other.r#type(),
                            })
                        }
                    };
                    stack.push(Value::Cursor { items, pos: 0 });
                }
                Op::IterNext { slot, exit } => match &mut locals[*slot] {
                    Value::Cursor { items, pos } if *pos < items.len() => {
                        let item = items[*pos].clone();
                        *pos += 1;
                        stack.push(item);
                    }
                    Value::Cursor { .. } => pc = *exit,
                    other => {
                        return Err(EvalError::TypeMismatch(ConversionError {
                            found: other.r#type(),
                            expected: ValueType::Cursor,
                        }))
                    }
                },
                Op::Jump(target) => pc = *target,
                Op::JumpUnless(target) => {
                    let cond: bool = stack.pop_as()?;
                    if !cond {
                        pc = *target;
                    }
                }
                Op::Return => return stack.pop(),
            }
        }
        Ok(Value::Unit)
    }
}

fn unary(op: UnaryOp, operand: Value) -> Result<Value, EvalError> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!bool::try_from(operand)?)),
        UnaryOp::Neg => checked(op.symbol(), i64::try_from(operand)?.checked_neg()),
    }
}

fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, EvalError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(lhs.equals(&rhs))),
        BinaryOp::Ne => Ok(Value::Bool(!lhs.equals(&rhs))),
        BinaryOp::And => Ok(Value::Bool(bool::try_from(lhs)? && bool::try_from(rhs)?)),
        BinaryOp::Or => Ok(Value::Bool(bool::try_from(lhs)? || bool::try_from(rhs)?)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(lhs, rhs)?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        BinaryOp::Add if matches!(lhs, Value::Str(_)) => {
            let a: Rc<str> = lhs.try_into()?;
            let b: Rc<str> = rhs.try_into()?;
            Ok(Value::str(&format!("{a}{b}")))
        }
        BinaryOp::Add => checked(op.symbol(), i64::try_from(lhs)?.checked_add(rhs.try_into()?)),
        BinaryOp::Sub => checked(op.symbol(), i64::try_from(lhs)?.checked_sub(rhs.try_into()?)),
        BinaryOp::Mul => checked(op.symbol(), i64::try_from(lhs)?.checked_mul(rhs.try_into()?)),
        BinaryOp::Div | BinaryOp::Rem => {
            let a = i64::try_from(lhs)?;
            let b = i64::try_from(rhs)?;
            if b == 0 {
                return Err(EvalError::DivisionByZero);
            }
            if op == BinaryOp::Div {
                checked(op.symbol(), a.checked_div(b))
            } else {
                checked(op.symbol(), a.checked_rem(b))
            }
        }
    }
}

fn compare(lhs: Value, rhs: Value) -> Result<std::cmp::Ordering, EvalError> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Ok(a.cmp(&b)),
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(&b)),
        (Value::Int(_), other) => Err(ConversionError {
            found: other.r#type(),
            expected: ValueType::Int,
        }
        .into()),
        (Value::Str(_), other) => Err(ConversionError {
            found: other.r#type(),
            expected: ValueType::Str,
        }
        .into()),
        (other, _) => Err(ConversionError {
            found: other.r#type(),
            expected: ValueType::Int,
        }
        .into()),
    }
}

fn checked(op: &'static str, result: Option<i64>) -> Result<Value, EvalError> {
    result.map(Value::Int).ok_or(EvalError::Overflow { op })
}
