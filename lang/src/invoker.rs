use tracing::{debug, info};

use crate::{
    bytecode::{Binding, FunctionIndex, Image, TypeIndex},
    compiler::{EntryBinding, EntryPointDescriptor},
    loader::{ContextId, LoadedModule},
    runtime::Console,
    vm::{EvalError, Value, Vm},
};

#[derive(Debug, thiserror::Error)]
pub enum EntryPointResolutionError {
    #[error("no entry point was described for this module")]
    Undescribed,

    #[error("type {type_name} not found in the loaded module")]
    TypeNotFound { type_name: String },

    #[error("method {method} not found on {type_name}")]
    MethodNotFound { type_name: String, method: String },

    #[error("{type_name}.{method} was described as {expected:?} but is bound as {found:?}")]
    BindingMismatch {
        type_name: String,
        method: String,
        expected: EntryBinding,
        found: Binding,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("{entry} faulted")]
pub struct RuntimeInvocationFault {
    pub entry: String,
    #[source]
    pub source: EvalError,
}

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("context {0} has been unloaded")]
    Unloaded(ContextId),

    #[error(transparent)]
    EntryPoint(#[from] EntryPointResolutionError),

    #[error(transparent)]
    Runtime(#[from] RuntimeInvocationFault),
}

/// Calls the entry routine of a loaded module with an argument vector.
#[derive(Debug, Clone)]
pub struct Invoker {
    console: Console,
}

impl Invoker {
    pub fn new(console: Console) -> Self {
        Invoker { console }
    }

    /// Returns the entry routine's exit value, if it produced an `int`.
    pub fn invoke(
        &self,
        loaded: &LoadedModule,
        entry: &EntryPointDescriptor,
        args: &[String],
    ) -> Result<Option<i64>, InvokeError> {
        let module = loaded
            .context()
            .module()
            .ok_or_else(|| InvokeError::Unloaded(loaded.id().clone()))?;
        let (ty, function) = resolve(&module.image, entry)?;
        let target = format!("{}.{}", entry.full_type_name(), entry.method);
        info!(context = %loaded.id(), entry = %target, binding = ?entry.binding, "invoking");

        let mut vm = Vm::new(&module, self.console.clone());
        let argv = Value::array(args.iter().map(|a| Value::str(a)).collect());
        let result = match entry.binding {
            EntryBinding::Static => vm.call(function, vec![argv]),
            EntryBinding::Instance => match vm.construct(ty) {
                Ok(instance) => vm.call(function, vec![instance, argv]),
                Err(e) => Err(e),
            },
        };
        let value = result.map_err(|source| RuntimeInvocationFault {
            entry: target.clone(),
            source,
        })?;
        debug!(entry = %target, returned = %value, "entry returned");

        Ok(match value {
            Value::Int(code) => Some(code),
            _ => None,
        })
    }
}

/// Finds the entry routine by the compiler's description, regardless of
/// visibility.
fn resolve(
    image: &Image,
    entry: &EntryPointDescriptor,
) -> Result<(TypeIndex, FunctionIndex), EntryPointResolutionError> {
    let type_name = entry.full_type_name();
    let ty = image
        .find_type(&type_name)
        .ok_or_else(|| EntryPointResolutionError::TypeNotFound {
            type_name: type_name.clone(),
        })?;
    let function = image.find_method(ty, &entry.method).ok_or_else(|| {
        EntryPointResolutionError::MethodNotFound {
            type_name: type_name.clone(),
            method: entry.method.clone(),
        }
    })?;

    let found = image.functions[function].binding;
    let agrees = matches!(
        (entry.binding, found),
        (EntryBinding::Static, Binding::Static) | (EntryBinding::Instance, Binding::Instance)
    );
    if !agrees {
        return Err(EntryPointResolutionError::BindingMismatch {
            type_name,
            method: entry.method.clone(),
            expected: entry.binding,
            found,
        });
    }
    Ok((ty, function))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        compiler::{CompileOptions, Compiler},
        ids::SequentialIds,
        loader::{ContextRegistry, Loader},
        references::{ModuleTable, TableResolver},
        source::SourceUnit,
    };

    fn load(text: &str) -> (LoadedModule, EntryPointDescriptor) {
        let table = Arc::new(ModuleTable::standard());
        let ids = Arc::new(SequentialIds::new("t"));
        let result = Compiler::new(CompileOptions::default(), ids.clone())
            .compile_source(&SourceUnit::latest(text), &TableResolver::new(table.clone()))
            .unwrap();
        assert!(result.success(), "{:?}", result.diagnostics());
        let entry = result.entry_point().unwrap().clone();
        let loader = Loader::new(table, ids, Arc::new(ContextRegistry::new()));
        (loader.load(result.into_image()).unwrap(), entry)
    }

    fn args() -> Vec<String> {
        vec!["abc".to_owned()]
    }

    #[test]
    fn instance_entry_sees_field_defaults() {
        let (loaded, entry) = load(
            r#"type Greeter {
                field greeting: str = "hi";
                fn main(args: [str]) { io::print_line(self.greeting + " " + args[0]); }
            }"#,
        );
        let (console, captured) = Console::capture();
        Invoker::new(console).invoke(&loaded, &entry, &args()).unwrap();
        assert_eq!(captured.text(), "hi abc\n");
    }

    #[test]
    fn int_result_is_returned() {
        let (loaded, entry) = load("type P { static fn main(args: [str]) -> int { return 7; } }");
        let (console, _) = Console::capture();
        let code = Invoker::new(console).invoke(&loaded, &entry, &args()).unwrap();
        assert_eq!(code, Some(7));
    }

    #[test]
    fn descriptor_must_match_the_module() {
        let (loaded, entry) = load("type P { static fn main(args: [str]) {} }");
        let (console, _) = Console::capture();
        let invoker = Invoker::new(console);

        let missing_type = EntryPointDescriptor {
            type_name: "Q".to_owned(),
            ..entry.clone()
        };
        assert!(matches!(
            invoker.invoke(&loaded, &missing_type, &args()),
            Err(InvokeError::EntryPoint(EntryPointResolutionError::TypeNotFound { .. }))
        ));

        let wrong_binding = EntryPointDescriptor {
            binding: EntryBinding::Instance,
            ..entry
        };
        assert!(matches!(
            invoker.invoke(&loaded, &wrong_binding, &args()),
            Err(InvokeError::EntryPoint(EntryPointResolutionError::BindingMismatch { .. }))
        ));
    }

    #[test]
    fn guest_fault_propagates() {
        let (loaded, entry) = load(
            r#"type P { static fn main(args: [str]) { core::panic("boom " + args[0]); } }"#,
        );
        let (console, _) = Console::capture();
        let err = Invoker::new(console)
            .invoke(&loaded, &entry, &args())
            .unwrap_err();
        let fault = match err {
            InvokeError::Runtime(fault) => fault,
            other => panic!("expected a runtime fault, got {other}"),
        };
        assert_eq!(fault.entry, "P.main");
        assert!(matches!(fault.source, EvalError::ExplicitPanic(m) if m == "boom abc"));
    }

    #[test]
    fn unloaded_context_is_rejected() {
        let (loaded, entry) = load("type P { static fn main(args: [str]) {} }");
        loaded.context().release();
        let (console, _) = Console::capture();
        assert!(matches!(
            Invoker::new(console).invoke(&loaded, &entry, &args()),
            Err(InvokeError::Unloaded(_))
        ));
    }
}
