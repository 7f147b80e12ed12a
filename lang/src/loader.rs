use std::{
    collections::HashMap,
    fmt::Display,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;
use tracing::{debug, info};
use typed_index_collections::TiVec;

use crate::{
    bytecode::{Image, ImageError, ImportIndex},
    ids::{IdGenerator, IdPurpose},
    references::{ModuleTable, ModuleVersion},
    runtime::NativeFn,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextId(pub String);

impl Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An image whose imports have been bound to host functions.
#[derive(Debug)]
pub struct LinkedModule {
    pub image: Image,
    pub natives: TiVec<ImportIndex, LinkedNative>,
}

#[derive(Debug, Clone)]
pub struct LinkedNative {
    /// `module::function`, for error messages.
    pub name: String,
    pub func: NativeFn,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadFault {
    #[error("cannot load an empty image")]
    EmptyImage,

    #[error("malformed image: {0}")]
    Malformed(#[from] ImageError),

    #[error("import {module}::{function} ({version}) is not provided by the host")]
    UnresolvedImport {
        module: String,
        version: ModuleVersion,
        function: String,
    },

    #[error("context {0} is still live; refusing to reuse its identity")]
    DuplicateContext(ContextId),
}

/// Every context created by a process, keyed by identity. Entries are weak:
/// an identity becomes free once its module has been reclaimed.
#[derive(Debug, Default)]
pub struct ContextRegistry {
    contexts: Mutex<HashMap<ContextId, Weak<LinkedModule>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, id: &ContextId, module: &Arc<LinkedModule>) -> Result<(), LoadFault> {
        let mut contexts = self.contexts.lock();
        contexts.retain(|_, weak| weak.strong_count() > 0);
        if contexts.contains_key(id) {
            return Err(LoadFault::DuplicateContext(id.clone()));
        }
        contexts.insert(id.clone(), Arc::downgrade(module));
        Ok(())
    }

    /// Identities whose modules have not been reclaimed yet.
    pub fn live(&self) -> Vec<ContextId> {
        let contexts = self.contexts.lock();
        let mut live = contexts
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        live.sort_by(|a, b| a.0.cmp(&b.0));
        live
    }
}

/// Owns the module for as long as the context is loaded.
#[derive(Debug)]
pub struct ExecutionContext {
    id: ContextId,
    module: Mutex<Option<Arc<LinkedModule>>>,
    unloaded: AtomicBool,
}

impl ExecutionContext {
    pub fn id(&self) -> &ContextId {
        &self.id
    }

    pub fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::Acquire)
    }

    /// A strong reference for the duration of one call, or `None` once
    /// unloaded.
    pub(crate) fn module(&self) -> Option<Arc<LinkedModule>> {
        self.module.lock().clone()
    }

    /// Drops the context's own reference and returns a weak one to watch.
    pub(crate) fn release(&self) -> Weak<LinkedModule> {
        let mut module = self.module.lock();
        self.unloaded.store(true, Ordering::Release);
        match module.take() {
            Some(module) => Arc::downgrade(&module),
            None => Weak::new(),
        }
    }
}

/// Handle to a module loaded into its own context.
#[derive(Debug, Clone)]
pub struct LoadedModule {
    context: Arc<ExecutionContext>,
}

impl LoadedModule {
    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.context
    }

    pub fn id(&self) -> &ContextId {
        self.context.id()
    }

    /// Hands out a reference that outlives the context, the way a reflected
    /// handle would. While any pin is alive the module cannot be reclaimed.
    pub fn pin(&self) -> Option<ModulePin> {
        self.context.module().map(ModulePin)
    }
}

/// An escaped strong reference to a loaded module.
#[derive(Debug, Clone)]
pub struct ModulePin(Arc<LinkedModule>);

impl ModulePin {
    pub fn unit_name(&self) -> &str {
        &self.0.image.name
    }
}

pub struct Loader {
    table: Arc<ModuleTable>,
    ids: Arc<dyn IdGenerator>,
    registry: Arc<ContextRegistry>,
}

impl Loader {
    pub fn new(
        table: Arc<ModuleTable>,
        ids: Arc<dyn IdGenerator>,
        registry: Arc<ContextRegistry>,
    ) -> Self {
        Loader {
            table,
            ids,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<ContextRegistry> {
        &self.registry
    }

    /// Loads straight from the buffer into a fresh context.
    pub fn load(&self, image: Vec<u8>) -> Result<LoadedModule, LoadFault> {
        if image.is_empty() {
            return Err(LoadFault::EmptyImage);
        }
        let image = Image::decode(&image)?;
        let natives = self.link(&image)?;
        let module = Arc::new(LinkedModule { image, natives });

        let id = ContextId(self.ids.next_id(IdPurpose::Context));
        self.registry.register(&id, &module)?;
        info!(context = %id, unit = %module.image.name, "loaded module");

        Ok(LoadedModule {
            context: Arc::new(ExecutionContext {
                id,
                module: Mutex::new(Some(module)),
                unloaded: AtomicBool::new(false),
            }),
        })
    }

    fn link(&self, image: &Image) -> Result<TiVec<ImportIndex, LinkedNative>, LoadFault> {
        image
            .imports
            .iter()
            .map(|import| {
                let version = ModuleVersion::new(import.major, import.minor);
                let unresolved = || LoadFault::UnresolvedImport {
                    module: import.module.clone(),
                    version,
                    function: import.function.clone(),
                };
                let binding = self.table.get(&import.module).ok_or_else(unresolved)?;
                // Minor versions only add functions.
                if binding.version.major != version.major || binding.version < version {
                    return Err(unresolved());
                }
                let native = binding.module.function(&import.function).ok_or_else(unresolved)?;
                debug!(module = %import.module, function = %import.function, "linked import");
                Ok(LinkedNative {
                    name: format!("{}::{}", import.module, import.function),
                    func: native.func,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bytecode::{Binding, Constant, Function, Import, Op, Visibility},
        ids::{FixedIds, SequentialIds},
    };

    fn image_with_import(module: &str, major: u16, minor: u16, function: &str) -> Vec<u8> {
        let mut image = Image {
            name: "unit".to_owned(),
            ..Image::default()
        };
        image.imports.push(Import {
            module: module.to_owned(),
            major,
            minor,
            function: function.to_owned(),
        });
        image.functions.push(Function {
            name: "main".to_owned(),
            owner: None,
            visibility: Visibility::Public,
            binding: Binding::Static,
            arity: 0,
            locals: 0,
            code: vec![Op::Push(Constant::Unit), Op::Return],
        });
        image.encode().unwrap()
    }

    fn loader(ids: Arc<dyn IdGenerator>) -> Loader {
        Loader::new(
            Arc::new(ModuleTable::standard()),
            ids,
            Arc::new(ContextRegistry::new()),
        )
    }

    #[test]
    fn links_imports_against_the_table() {
        let loader = loader(Arc::new(SequentialIds::new("t")));
        let loaded = loader.load(image_with_import("io", 1, 0, "print_line")).unwrap();
        assert_eq!(loaded.id().0, "t-ctx-0");
        let module = loaded.context().module().unwrap();
        assert_eq!(module.natives[ImportIndex::from(0)].name, "io::print_line");
    }

    #[test]
    fn rejects_what_the_host_cannot_bind() {
        let loader = loader(Arc::new(SequentialIds::new("t")));
        for (module, major, minor, function) in [
            ("net", 1, 0, "get"),
            ("io", 2, 0, "print_line"),
            ("io", 1, 3, "print_line"),
            ("io", 1, 0, "shout"),
        ] {
            let err = loader
                .load(image_with_import(module, major, minor, function))
                .unwrap_err();
            assert!(matches!(err, LoadFault::UnresolvedImport { .. }), "{err}");
        }
    }

    #[test]
    fn rejects_malformed_buffers() {
        let loader = loader(Arc::new(SequentialIds::new("t")));
        assert!(matches!(loader.load(vec![]), Err(LoadFault::EmptyImage)));
        assert!(matches!(
            loader.load(b"not an image".to_vec()),
            Err(LoadFault::Malformed(_))
        ));
    }

    #[test]
    fn live_identity_cannot_be_reused() {
        let loader = loader(Arc::new(FixedIds("same".to_owned())));
        let first = loader.load(image_with_import("io", 1, 0, "print")).unwrap();
        let err = loader
            .load(image_with_import("io", 1, 0, "print"))
            .unwrap_err();
        assert!(matches!(err, LoadFault::DuplicateContext(id) if id.0 == "same"));

        first.context().release();
        assert!(loader.registry().live().is_empty());
        loader.load(image_with_import("io", 1, 0, "print")).unwrap();
    }
}
