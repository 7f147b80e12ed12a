use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    bytecode::{qualified_name, ImageError},
    diagnostic::{Code, Diagnostic},
    ids::{IdGenerator, IdPurpose},
    parser::{self, SyntaxTree},
    references::{ReferenceResolver, ReferenceSet},
    source::SourceUnit,
};

mod declare;
mod lower;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputKind {
    /// Requires a `main` entry routine.
    #[default]
    Executable,
    Library,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions {
    pub output_kind: OutputKind,
    pub warnings_as_errors: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryBinding {
    Static,
    Instance,
}

/// Names the routine to call once the image is loaded, as the compiler saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPointDescriptor {
    pub namespace: String,
    pub type_name: String,
    pub method: String,
    pub binding: EntryBinding,
}

impl EntryPointDescriptor {
    pub fn full_type_name(&self) -> String {
        qualified_name(&self.namespace, &self.type_name)
    }
}

#[derive(Debug, Clone)]
pub struct CompilationResult {
    unit_name: String,
    success: bool,
    diagnostics: Vec<Diagnostic>,
    image: Vec<u8>,
    entry_point: Option<EntryPointDescriptor>,
}

impl CompilationResult {
    fn failed(unit_name: String, diagnostics: Vec<Diagnostic>) -> Self {
        CompilationResult {
            unit_name,
            success: false,
            diagnostics,
            image: vec![],
            entry_point: None,
        }
    }

    pub fn unit_name(&self) -> &str {
        &self.unit_name
    }

    pub fn success(&self) -> bool {
        self.success
    }

    /// Errors and escalated warnings only.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Empty unless the compilation succeeded.
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn into_image(self) -> Vec<u8> {
        self.image
    }

    pub fn entry_point(&self) -> Option<&EntryPointDescriptor> {
        self.entry_point.as_ref()
    }
}

/// Host-side faults. Problems in the source never surface here.
#[derive(Debug, thiserror::Error)]
pub enum CompilerFault {
    #[error("compiler produced an invalid image for {unit}: {source}")]
    InvalidImage {
        unit: String,
        #[source]
        source: ImageError,
    },
}

pub struct Compiler {
    options: CompileOptions,
    ids: Arc<dyn IdGenerator>,
}

impl Compiler {
    pub fn new(options: CompileOptions, ids: Arc<dyn IdGenerator>) -> Self {
        Compiler { options, ids }
    }

    pub fn options(&self) -> CompileOptions {
        self.options
    }

    pub fn parse(&self, source: &SourceUnit) -> Result<SyntaxTree, Vec<Diagnostic>> {
        parser::parse(source)
    }

    /// A failed result for a source unit that did not parse.
    pub fn reject(&self, diagnostics: Vec<Diagnostic>) -> CompilationResult {
        let unit_name = self.ids.next_id(IdPurpose::CompilationUnit);
        CompilationResult::failed(unit_name, self.reportable(diagnostics))
    }

    pub fn compile(
        &self,
        source: &SourceUnit,
        tree: &SyntaxTree,
        references: &ReferenceSet,
    ) -> Result<CompilationResult, CompilerFault> {
        let unit_name = self.ids.next_id(IdPurpose::CompilationUnit);
        let lowered = lower::lower(
            source,
            tree,
            references,
            self.options.output_kind,
            unit_name.clone(),
        );

        let diagnostics = self.reportable(lowered.diagnostics);
        if !diagnostics.is_empty() {
            info!(unit = %unit_name, errors = diagnostics.len(), "compilation failed");
            return Ok(CompilationResult::failed(unit_name, diagnostics));
        }

        if let Err(source) = lowered.image.verify() {
            return Err(CompilerFault::InvalidImage {
                unit: unit_name,
                source,
            });
        }
        let image = match lowered.image.encode() {
            Ok(image) => image,
            Err(e) => {
                let diagnostic =
                    Diagnostic::error(Code::EmitFailed, format!("could not emit image: {e}"));
                return Ok(CompilationResult::failed(unit_name, vec![diagnostic]));
            }
        };
        info!(unit = %unit_name, bytes = image.len(), "emitted image");

        Ok(CompilationResult {
            unit_name,
            success: true,
            diagnostics: vec![],
            image,
            entry_point: lowered.entry,
        })
    }

    /// Parses, resolves references and compiles in one step.
    pub fn compile_source(
        &self,
        source: &SourceUnit,
        resolver: &dyn ReferenceResolver,
    ) -> Result<CompilationResult, CompilerFault> {
        match self.parse(source) {
            Ok(tree) => {
                let references = resolver.resolve(&tree.import_names());
                self.compile(source, &tree, &references)
            }
            Err(diagnostics) => Ok(self.reject(diagnostics)),
        }
    }

    fn reportable(&self, diagnostics: Vec<Diagnostic>) -> Vec<Diagnostic> {
        diagnostics
            .into_iter()
            .map(|d| {
                if self.options.warnings_as_errors {
                    d.escalate()
                } else {
                    d
                }
            })
            .filter(|d| {
                if !d.is_reportable() {
                    debug!(diagnostic = %d, "suppressed");
                }
                d.is_reportable()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bytecode::Image,
        diagnostic::{Category, Severity},
        ids::SequentialIds,
        references::{ModuleTable, TableResolver},
        source::LanguageVersion,
    };

    fn compiler(options: CompileOptions) -> Compiler {
        Compiler::new(options, Arc::new(SequentialIds::new("test")))
    }

    fn compile(text: &str) -> CompilationResult {
        compile_with(text, CompileOptions::default())
    }

    fn compile_with(text: &str, options: CompileOptions) -> CompilationResult {
        let resolver = TableResolver::new(Arc::new(ModuleTable::standard()));
        compiler(options)
            .compile_source(&SourceUnit::latest(text), &resolver)
            .unwrap()
    }

    fn codes(result: &CompilationResult) -> Vec<&'static str> {
        result.diagnostics().iter().map(|d| d.code.as_str()).collect()
    }

    #[test]
    fn well_typed_source_produces_image_and_entry() {
        let result = compile(
            r#"
            namespace demo {
                type Program {
                    static fn main(args: [str]) {
                        io::print_line(args[0]);
                    }
                }
            }
            "#,
        );
        assert!(result.success(), "{:?}", result.diagnostics());
        assert!(result.diagnostics().is_empty());
        assert!(!result.image().is_empty());
        assert_eq!(result.unit_name(), "test-unit-0");
        let entry = result.entry_point().unwrap();
        assert_eq!(entry.full_type_name(), "demo.Program");
        assert_eq!(entry.method, "main");
        assert_eq!(entry.binding, EntryBinding::Static);

        let image = Image::decode(result.image()).unwrap();
        assert_eq!(image.name, "test-unit-0");
        assert_eq!(image.imports.len(), 1);
    }

    #[test]
    fn instance_entry_point_is_tagged() {
        let result = compile("type P { field n: int = 1; fn main(args: [str]) -> int { return self.n; } }");
        assert!(result.success(), "{:?}", result.diagnostics());
        let entry = result.entry_point().unwrap();
        assert_eq!(entry.binding, EntryBinding::Instance);
        assert_eq!(entry.full_type_name(), "P");
    }

    #[test]
    fn syntax_error_fails_without_image() {
        let result = compile("type P { static fn main(args: [str]) { ");
        assert!(!result.success());
        assert!(result.image().is_empty());
        assert!(result.entry_point().is_none());
        assert_eq!(result.diagnostics()[0].category(), Category::Syntax);
    }

    #[test]
    fn unresolved_module_is_named() {
        let result = compile("type P { static fn main(args: [str]) { let n = seq::count(args); } }");
        assert!(!result.success());
        assert_eq!(codes(&result), vec!["FL1001"]);
        assert!(result.diagnostics()[0].message.contains("seq::count"));
        assert_eq!(result.diagnostics()[0].severity, Severity::Error);
    }

    #[test]
    fn warnings_are_dropped_unless_escalated() {
        let text = "use seq; type P { static fn main(args: [str]) { let unused = 1; seq::filter(args, |a| true); } }";
        let relaxed = compile(text);
        assert!(relaxed.success(), "{:?}", relaxed.diagnostics());
        assert!(relaxed.diagnostics().is_empty());

        let strict = compile_with(
            text,
            CompileOptions {
                warnings_as_errors: true,
                ..CompileOptions::default()
            },
        );
        assert!(!strict.success());
        assert!(strict.image().is_empty());
        assert_eq!(codes(&strict), vec!["FL3001", "FL3002"]);
        assert!(strict.diagnostics().iter().all(|d| d.escalated));
    }

    #[test]
    fn entry_point_rules() {
        assert_eq!(codes(&compile("type P { static fn helper() {} }")), vec!["FL2101"]);
        assert_eq!(
            codes(&compile(
                "type P { static fn main(args: [str]) {} } type Q { static fn main(args: [str]) {} }"
            )),
            vec!["FL2102", "FL2102"]
        );
        assert_eq!(
            codes(&compile("type P { static fn main(n: int) {} }")),
            vec!["FL2103"]
        );
        let library = compile_with(
            "type P { static fn helper() {} }",
            CompileOptions {
                output_kind: OutputKind::Library,
                ..CompileOptions::default()
            },
        );
        assert!(library.success());
        assert!(library.entry_point().is_none());
    }

    #[test]
    fn type_errors_are_reported() {
        let result = compile(
            r#"type P {
                static fn main(args: [str]) {
                    let n: int = "x";
                    let b = 1 + true;
                    missing();
                    io::print_line(nope);
                }
            }"#,
        );
        assert_eq!(codes(&result), vec!["FL2001", "FL2004", "FL1002", "FL1003"]);
        assert_eq!(result.diagnostics()[0].location.unwrap().line, 3);
    }

    #[test]
    fn dyn_needs_the_dynamic_module() {
        let text = "type P { static fn main(args: [str]) { let d: dyn = 1; io::print_line(d); } }";
        let tree = parser::parse(&SourceUnit::latest(text)).unwrap();
        let mut references = ReferenceSet::default();
        let table = ModuleTable::standard();
        for name in ["core", "io"] {
            references.insert(table.get(name).unwrap().clone());
        }
        let result = compiler(CompileOptions::default())
            .compile(&SourceUnit::latest(text), &tree, &references)
            .unwrap();
        assert_eq!(codes(&result), vec!["FL1008"]);
    }

    #[test]
    fn version_one_rejects_lambdas() {
        let resolver = TableResolver::new(Arc::new(ModuleTable::standard()));
        let source = SourceUnit::new(
            "use seq; type P { static fn main(args: [str]) { seq::filter(args, |a| true); } }",
            LanguageVersion::V1,
        );
        let result = compiler(CompileOptions::default())
            .compile_source(&source, &resolver)
            .unwrap();
        assert_eq!(codes(&result), vec!["FL0002"]);
    }

    #[test]
    fn missing_return_is_an_error() {
        let result = compile(
            "type P { static fn main(args: [str]) {} static fn f(x: int) -> int { if x > 0 { return 1; } } }",
        );
        assert_eq!(codes(&result), vec!["FL2006"]);
    }
}
