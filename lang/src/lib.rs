pub mod bytecode;
pub mod compiler;
pub mod diagnostic;
pub mod ids;
pub mod invoker;
pub mod lifecycle;
pub mod loader;
pub mod parser;
pub mod pipeline;
pub mod references;
pub mod runtime;
pub mod samples;
pub mod source;
pub mod types;
pub mod vm;

pub use pipeline::{ExitPolicy, Pipeline, PipelineConfig, PipelineError, RunReport, Stage};
pub use source::{LanguageVersion, SourceUnit};
