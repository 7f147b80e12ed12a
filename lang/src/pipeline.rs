use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    compiler::{CompileOptions, Compiler, CompilerFault},
    diagnostic::Diagnostic,
    ids::{IdGenerator, RandomIds},
    invoker::{EntryPointResolutionError, InvokeError, Invoker},
    lifecycle::{LifecycleManager, UnloadHandle},
    loader::{ContextRegistry, LoadFault, Loader},
    references::{ModuleTable, ReferenceResolver, TableResolver},
    runtime::Console,
    source::SourceUnit,
};

/// The argument vector handed to the entry routine unless configured otherwise.
pub const DEFAULT_ENTRY_ARGS: [&str; 1] = ["abc"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitPolicy {
    /// Non-zero when compilation fails or the run faults.
    #[default]
    Reflect,
    /// Always zero.
    Legacy,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub compile: CompileOptions,
    pub entry_args: Vec<String>,
    pub exit_policy: ExitPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            compile: CompileOptions::default(),
            entry_args: DEFAULT_ENTRY_ARGS.iter().map(|a| a.to_string()).collect(),
            exit_policy: ExitPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Created,
    Parsed,
    CompiledOk,
    CompiledFail,
    Loaded,
    Invoked,
    Unloaded,
}

/// How a run that did not hit a host fault ended.
#[derive(Debug)]
pub struct RunReport {
    pub trail: Vec<Stage>,
    /// The diagnostics that stopped the run; empty if it compiled.
    pub diagnostics: Vec<Diagnostic>,
    /// Present whenever a context was loaded.
    pub unload: Option<UnloadHandle>,
    /// What an `int`-returning entry routine returned.
    pub returned: Option<i64>,
}

impl RunReport {
    pub fn compiled(&self) -> bool {
        self.trail.contains(&Stage::CompiledOk)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Compiler(#[from] CompilerFault),

    #[error("load failed")]
    Load(#[from] LoadFault),

    /// The context was unloaded before this was returned.
    #[error("invocation failed")]
    Invocation {
        #[source]
        source: InvokeError,
        trail: Vec<Stage>,
        unload: UnloadHandle,
    },
}

pub struct PipelineBuilder {
    config: PipelineConfig,
    table: Arc<ModuleTable>,
    resolver: Option<Box<dyn ReferenceResolver>>,
    ids: Arc<dyn IdGenerator>,
    registry: Arc<ContextRegistry>,
    console: Console,
}

impl PipelineBuilder {
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn table(mut self, table: Arc<ModuleTable>) -> Self {
        self.table = table;
        self
    }

    /// Defaults to a [`TableResolver`] over the module table.
    pub fn resolver(mut self, resolver: impl ReferenceResolver + 'static) -> Self {
        self.resolver = Some(Box::new(resolver));
        self
    }

    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn registry(mut self, registry: Arc<ContextRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn console(mut self, console: Console) -> Self {
        self.console = console;
        self
    }

    pub fn build(self) -> Pipeline {
        let resolver = self
            .resolver
            .unwrap_or_else(|| Box::new(TableResolver::new(self.table.clone())));
        Pipeline {
            compiler: Compiler::new(self.config.compile, self.ids.clone()),
            loader: Loader::new(self.table, self.ids, self.registry),
            invoker: Invoker::new(self.console.clone()),
            lifecycle: LifecycleManager::new(),
            resolver,
            console: self.console,
            config: self.config,
        }
    }
}

/// Compile, load, invoke, unload.
pub struct Pipeline {
    config: PipelineConfig,
    resolver: Box<dyn ReferenceResolver>,
    compiler: Compiler,
    loader: Loader,
    invoker: Invoker,
    lifecycle: LifecycleManager,
    console: Console,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder {
            config: PipelineConfig::default(),
            table: Arc::new(ModuleTable::standard()),
            resolver: None,
            ids: Arc::new(RandomIds),
            registry: Arc::new(ContextRegistry::new()),
            console: Console::stdout(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ContextRegistry> {
        self.loader.registry()
    }

    pub fn run(&self, source: &SourceUnit) -> Result<RunReport, PipelineError> {
        let mut trail = vec![Stage::Created];
        info!(version = %source.version(), "run started");

        let tree = self.compiler.parse(source);
        trail.push(Stage::Parsed);
        let result = match tree {
            Ok(tree) => {
                let references = self.resolver.resolve(&tree.import_names());
                self.compiler.compile(source, &tree, &references)?
            }
            Err(diagnostics) => self.compiler.reject(diagnostics),
        };

        if !result.success() {
            trail.push(Stage::CompiledFail);
            info!(unit = %result.unit_name(), errors = result.diagnostics().len(), "compilation failed");
            self.print(result.diagnostics());
            return Ok(RunReport {
                trail,
                diagnostics: result.diagnostics().to_vec(),
                unload: None,
                returned: None,
            });
        }
        trail.push(Stage::CompiledOk);
        let entry = result.entry_point().cloned();

        let loaded = self.loader.load(result.into_image())?;
        trail.push(Stage::Loaded);

        let outcome = match &entry {
            Some(entry) => {
                let outcome = self
                    .invoker
                    .invoke(&loaded, entry, &self.config.entry_args);
                trail.push(Stage::Invoked);
                outcome
            }
            None => Err(EntryPointResolutionError::Undescribed.into()),
        };

        let unload = self.lifecycle.unload(loaded);
        trail.push(Stage::Unloaded);
        debug!(trail = ?trail, "run finished");

        match outcome {
            Ok(returned) => Ok(RunReport {
                trail,
                diagnostics: vec![],
                unload: Some(unload),
                returned,
            }),
            Err(source) => {
                warn!(error = %source, "invocation failed");
                Err(PipelineError::Invocation {
                    source,
                    trail,
                    unload,
                })
            }
        }
    }

    /// Process exit status for the outcome of [`Pipeline::run`].
    pub fn exit_code(&self, outcome: &Result<RunReport, PipelineError>) -> i32 {
        match self.config.exit_policy {
            ExitPolicy::Legacy => 0,
            ExitPolicy::Reflect => match outcome {
                Ok(report) if report.compiled() => 0,
                Ok(_) => 1,
                Err(_) => 2,
            },
        }
    }

    fn print(&self, diagnostics: &[Diagnostic]) {
        for diagnostic in diagnostics {
            if let Err(e) = self.console.write_line(&diagnostic.to_string()) {
                warn!(error = %e, "could not write diagnostic");
            }
        }
    }
}
