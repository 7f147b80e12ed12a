use std::{fmt::Debug, io::Write, rc::Rc, sync::Arc};

use parking_lot::Mutex;

use crate::{
    types::Type,
    vm::{Closure, ConversionError, EvalError, LazySeq, SeqStage, Value, Vm, MAX_SEQ_STAGES},
};

/// Where guest output and pipeline diagnostics go.
#[derive(Clone)]
pub struct Console {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Console {
    pub fn stdout() -> Self {
        Self::from_writer(std::io::stdout())
    }

    pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
        Console {
            sink: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// A console writing into memory, plus a handle to read it back.
    pub fn capture() -> (Console, Captured) {
        let captured = Captured::default();
        let console = Self::from_writer(CaptureWriter(captured.0.clone()));
        (console, captured)
    }

    pub fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut sink = self.sink.lock();
        writeln!(sink, "{line}")?;
        sink.flush()
    }

    pub fn write_str(&self, text: &str) -> std::io::Result<()> {
        let mut sink = self.sink.lock();
        write!(sink, "{text}")?;
        sink.flush()
    }
}

impl Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console").finish_non_exhaustive()
    }
}

#[derive(Clone, Default)]
pub struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NativeError {
    #[error("expected {expected} arguments, found {found}")]
    Arity { expected: usize, found: usize },

    #[error("argument {index}: {source}")]
    Argument {
        index: usize,
        #[source]
        source: ConversionError,
    },

    #[error("console write failed: {0}")]
    Io(#[from] std::io::Error),

    /// A fault raised by guest code the native called back into.
    #[error(transparent)]
    Eval(Box<EvalError>),
}

impl From<EvalError> for NativeError {
    fn from(value: EvalError) -> Self {
        NativeError::Eval(Box::new(value))
    }
}

pub type NativeFn = fn(&mut Vm<'_>, Vec<Value>) -> Result<Value, NativeError>;

pub struct NativeFunction {
    pub name: &'static str,
    pub params: Vec<Type>,
    pub ret: Type,
    pub func: NativeFn,
}

impl Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {}",
            self.name,
            Type::func(self.params.clone(), self.ret.clone())
        )
    }
}

#[derive(Debug)]
pub struct NativeModule {
    pub name: &'static str,
    pub functions: Vec<NativeFunction>,
}

impl NativeModule {
    pub fn function(&self, name: &str) -> Option<&NativeFunction> {
        self.functions.iter().find(|f| f.name == name)
    }
}

fn native(name: &'static str, params: Vec<Type>, ret: Type, func: NativeFn) -> NativeFunction {
    NativeFunction {
        name,
        params,
        ret,
        func,
    }
}

pub fn core_module() -> NativeModule {
    NativeModule {
        name: "core",
        functions: vec![native("panic", vec![Type::Str], Type::Unit, core_panic)],
    }
}

pub fn io_module() -> NativeModule {
    NativeModule {
        name: "io",
        functions: vec![
            native("print_line", vec![Type::Dyn], Type::Unit, io_print_line),
            native("print", vec![Type::Dyn], Type::Unit, io_print),
        ],
    }
}

pub fn text_module() -> NativeModule {
    NativeModule {
        name: "text",
        functions: vec![
            native("is_empty", vec![Type::Str], Type::Bool, text_is_empty),
            native("len", vec![Type::Str], Type::Int, text_len),
            native("upper", vec![Type::Str], Type::Str, text_upper),
        ],
    }
}

/// Carries no functions; binding it is what permits `dyn` in source.
pub fn dynamic_module() -> NativeModule {
    NativeModule {
        name: "dynamic",
        functions: vec![],
    }
}

pub fn seq_module() -> NativeModule {
    let seq_t = || Type::seq(Type::Param);
    NativeModule {
        name: "seq",
        functions: vec![
            native(
                "filter",
                vec![seq_t(), Type::func(vec![Type::Param], Type::Bool)],
                seq_t(),
                seq_filter,
            ),
            native(
                "map",
                vec![seq_t(), Type::func(vec![Type::Param], Type::Param)],
                seq_t(),
                seq_map,
            ),
            native("count", vec![seq_t()], Type::Int, seq_count),
            native("to_array", vec![seq_t()], Type::array(Type::Param), seq_to_array),
            native("len", vec![Type::array(Type::Param)], Type::Int, seq_len),
        ],
    }
}

fn take<const N: usize>(args: Vec<Value>) -> Result<[Value; N], NativeError> {
    let found = args.len();
    args.try_into()
        .map_err(|_| NativeError::Arity { expected: N, found })
}

fn arg<T>(value: Value, index: usize) -> Result<T, NativeError>
where
    T: TryFrom<Value, Error = ConversionError>,
{
    T::try_from(value).map_err(|source| NativeError::Argument { index, source })
}

fn seq_arg(value: Value, index: usize) -> Result<Rc<LazySeq>, NativeError> {
    value
        .into_seq()
        .map_err(|source| NativeError::Argument { index, source })
}

fn count(len: usize) -> Value {
    Value::Int(i64::try_from(len).unwrap_or(i64::MAX))
}

fn core_panic(_: &mut Vm<'_>, args: Vec<Value>) -> Result<Value, NativeError> {
    let [message] = take(args)?;
    let message: Rc<str> = arg(message, 0)?;
    Err(EvalError::ExplicitPanic(message.to_string()).into())
}

fn io_print_line(vm: &mut Vm<'_>, args: Vec<Value>) -> Result<Value, NativeError> {
    let [value] = take(args)?;
    vm.console().write_line(&value.to_string())?;
    Ok(Value::Unit)
}

fn io_print(vm: &mut Vm<'_>, args: Vec<Value>) -> Result<Value, NativeError> {
    let [value] = take(args)?;
    vm.console().write_str(&value.to_string())?;
    Ok(Value::Unit)
}

fn text_is_empty(_: &mut Vm<'_>, args: Vec<Value>) -> Result<Value, NativeError> {
    let [s] = take(args)?;
    let s: Rc<str> = arg(s, 0)?;
    Ok(Value::Bool(s.is_empty()))
}

fn text_len(_: &mut Vm<'_>, args: Vec<Value>) -> Result<Value, NativeError> {
    let [s] = take(args)?;
    let s: Rc<str> = arg(s, 0)?;
    Ok(count(s.chars().count()))
}

fn text_upper(_: &mut Vm<'_>, args: Vec<Value>) -> Result<Value, NativeError> {
    let [s] = take(args)?;
    let s: Rc<str> = arg(s, 0)?;
    Ok(Value::str(&s.to_uppercase()))
}

fn seq_filter(_: &mut Vm<'_>, args: Vec<Value>) -> Result<Value, NativeError> {
    let [xs, predicate] = take(args)?;
    let source = seq_arg(xs, 0)?;
    let predicate = arg::<Rc<Closure>>(predicate, 1)?;
    push_stage(&source, SeqStage::Filter(predicate))
}

fn seq_map(_: &mut Vm<'_>, args: Vec<Value>) -> Result<Value, NativeError> {
    let [xs, mapper] = take(args)?;
    let source = seq_arg(xs, 0)?;
    let mapper = arg::<Rc<Closure>>(mapper, 1)?;
    push_stage(&source, SeqStage::Map(mapper))
}

fn push_stage(source: &LazySeq, stage: SeqStage) -> Result<Value, NativeError> {
    let seq = source
        .then(stage, MAX_SEQ_STAGES)
        .ok_or(EvalError::StackOverflow {
            limit: MAX_SEQ_STAGES,
        })?;
    Ok(Value::Seq(Rc::new(seq)))
}

fn seq_count(vm: &mut Vm<'_>, args: Vec<Value>) -> Result<Value, NativeError> {
    let [xs] = take(args)?;
    let seq = seq_arg(xs, 0)?;
    Ok(count(vm.force(&seq)?.len()))
}

fn seq_to_array(vm: &mut Vm<'_>, args: Vec<Value>) -> Result<Value, NativeError> {
    let [xs] = take(args)?;
    let seq = seq_arg(xs, 0)?;
    Ok(Value::array(vm.force(&seq)?))
}

fn seq_len(_: &mut Vm<'_>, args: Vec<Value>) -> Result<Value, NativeError> {
    let [xs] = take(args)?;
    let xs: Rc<Vec<Value>> = arg(xs, 0)?;
    Ok(count(xs.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bytecode::FunctionIndex, loader::LinkedModule};

    fn empty_module() -> LinkedModule {
        LinkedModule {
            image: Default::default(),
            natives: Default::default(),
        }
    }

    fn call(module: &NativeModule, name: &str, vm: &mut Vm<'_>, args: Vec<Value>) -> Result<Value, NativeError> {
        let function = module.function(name).unwrap();
        (function.func)(vm, args)
    }

    #[test]
    fn print_line_writes_to_console() {
        let module = empty_module();
        let (console, captured) = Console::capture();
        let mut vm = Vm::new(&module, console);
        call(&io_module(), "print_line", &mut vm, vec![Value::str("abc")]).unwrap();
        call(&io_module(), "print", &mut vm, vec![Value::Int(1)]).unwrap();
        assert_eq!(captured.text(), "abc\n1");
    }

    #[test]
    fn filter_defers_the_predicate_until_counted() {
        let module = empty_module();
        let (console, _) = Console::capture();
        let mut vm = Vm::new(&module, console);
        // The predicate points at a function that does not exist, so running it fails.
        let predicate = Value::Closure(Rc::new(Closure {
            function: FunctionIndex::from(7),
            captures: vec![],
        }));
        let xs = Value::array(vec![Value::str("a")]);
        let seq = seq_module();
        let filtered = call(&seq, "filter", &mut vm, vec![xs, predicate]).unwrap();
        assert_eq!(filtered.to_string(), "<seq>");

        let err = call(&seq, "count", &mut vm, vec![filtered]).unwrap_err();
        assert!(matches!(
            err,
            NativeError::Eval(inner) if matches!(*inner, EvalError::MissingFunction(_))
        ));
    }

    #[test]
    fn stacking_past_the_stage_limit_faults() {
        let module = empty_module();
        let (console, _) = Console::capture();
        let mut vm = Vm::new(&module, console);
        let seq = seq_module();
        let mut xs = Value::array(vec![Value::Int(1)]);
        for _ in 0..MAX_SEQ_STAGES {
            let identity = Value::Closure(Rc::new(Closure {
                function: FunctionIndex::from(0),
                captures: vec![],
            }));
            xs = call(&seq, "map", &mut vm, vec![xs, identity]).unwrap();
        }
        let predicate = Value::Closure(Rc::new(Closure {
            function: FunctionIndex::from(0),
            captures: vec![],
        }));
        let err = call(&seq, "filter", &mut vm, vec![xs, predicate]).unwrap_err();
        assert!(matches!(
            err,
            NativeError::Eval(inner) if matches!(*inner, EvalError::StackOverflow { limit: MAX_SEQ_STAGES })
        ));
    }

    #[test]
    fn text_functions() {
        let module = empty_module();
        let (console, _) = Console::capture();
        let mut vm = Vm::new(&module, console);
        let text = text_module();
        let upper = call(&text, "upper", &mut vm, vec![Value::str("abc")]).unwrap();
        assert_eq!(upper.to_string(), "ABC");
        let len = call(&text, "len", &mut vm, vec![Value::str("héllo")]).unwrap();
        assert!(len.equals(&Value::Int(5)));
        assert!(matches!(
            call(&text, "is_empty", &mut vm, vec![]),
            Err(NativeError::Arity { expected: 1, found: 0 })
        ));
    }

    #[test]
    fn panic_carries_its_message() {
        let module = empty_module();
        let (console, _) = Console::capture();
        let mut vm = Vm::new(&module, console);
        let err = call(&core_module(), "panic", &mut vm, vec![Value::str("boom")]).unwrap_err();
        assert!(matches!(
            err,
            NativeError::Eval(inner) if matches!(&*inner, EvalError::ExplicitPanic(m) if m == "boom")
        ));
    }
}
