use std::{sync::Arc, time::Duration};

use flicker::{
    compiler::{CompileOptions, Compiler},
    diagnostic::Category,
    ids::{FixedIds, SequentialIds},
    invoker::{InvokeError, Invoker},
    lifecycle::LifecycleManager,
    loader::{ContextRegistry, LoadFault, Loader},
    references::{ModuleTable, TableResolver},
    runtime::{Captured, Console},
    samples, LanguageVersion, Pipeline, PipelineConfig, PipelineError, SourceUnit, Stage,
};

fn pipeline_with(config: PipelineConfig) -> (Pipeline, Captured) {
    let (console, captured) = Console::capture();
    let pipeline = Pipeline::builder()
        .config(config)
        .ids(Arc::new(SequentialIds::new("it")))
        .console(console)
        .build();
    (pipeline, captured)
}

fn pipeline() -> (Pipeline, Captured) {
    pipeline_with(PipelineConfig::default())
}

const FULL_TRAIL: [Stage; 6] = [
    Stage::Created,
    Stage::Parsed,
    Stage::CompiledOk,
    Stage::Loaded,
    Stage::Invoked,
    Stage::Unloaded,
];

#[test]
fn echo_prints_its_argument() {
    let (pipeline, captured) = pipeline();
    let outcome = pipeline.run(&SourceUnit::latest(samples::ECHO));
    let report = outcome.as_ref().unwrap();
    assert_eq!(report.trail, FULL_TRAIL);
    assert_eq!(captured.text(), "abc\n");
    assert_eq!(pipeline.exit_code(&outcome), 0);
}

#[test]
fn unenumerated_filter_has_no_effect() {
    let (pipeline, captured) = pipeline();
    let outcome = pipeline.run(&SourceUnit::latest(samples::FILTERED_ECHO));
    assert!(outcome.as_ref().unwrap().diagnostics.is_empty());
    assert_eq!(captured.text(), "abc\n1\n");
    assert_eq!(pipeline.exit_code(&outcome), 0);
}

#[test]
fn counting_a_filter_runs_its_predicate() {
    let (pipeline, captured) = pipeline();
    let source = r#"use seq;
        type P {
            static fn main(args: [str]) {
                let seen = seq::filter(args, |a| {
                    io::print_line("saw " + a);
                    return true;
                });
                io::print_line(seq::count(seen));
            }
        }"#;
    pipeline.run(&SourceUnit::latest(source)).unwrap();
    assert_eq!(captured.text(), "saw abc\n1\n");
}

#[test]
fn instance_entry_point_gets_a_fresh_instance() {
    let (pipeline, captured) = pipeline();
    pipeline.run(&SourceUnit::latest(samples::GREETER)).unwrap();
    assert_eq!(captured.text(), "hello abc\n");
}

#[test]
fn unbalanced_source_never_loads() {
    let (pipeline, captured) = pipeline();
    let outcome = pipeline.run(&SourceUnit::latest(samples::UNBALANCED));
    let report = outcome.as_ref().unwrap();
    assert_eq!(
        report.trail,
        vec![Stage::Created, Stage::Parsed, Stage::CompiledFail]
    );
    assert_eq!(report.diagnostics.len(), 1);
    assert_eq!(report.diagnostics[0].category(), Category::Syntax);
    assert!(report.unload.is_none());

    let printed = captured.text();
    assert_eq!(printed.lines().count(), 1);
    assert!(printed.starts_with("error[FL0001]"), "{printed}");
    assert!(pipeline.registry().live().is_empty());
    assert_eq!(pipeline.exit_code(&outcome), 1);
}

#[test]
fn unresolved_symbol_is_named_and_nothing_loads() {
    let (pipeline, captured) = pipeline();
    let outcome = pipeline.run(&SourceUnit::latest(
        "type P { static fn main(args: [str]) { io::print_line(seq::count(args)); } }",
    ));
    let report = outcome.unwrap();
    assert!(!report.compiled());
    assert!(report.diagnostics[0].message.contains("seq::count"));
    assert!(captured.text().contains("seq::count"));
    assert!(!report.trail.contains(&Stage::Loaded));
}

#[test]
fn repeated_runs_leave_no_residue() {
    let (pipeline, captured) = pipeline();
    let source = SourceUnit::latest(samples::FILTERED_ECHO);
    let first = pipeline.run(&source).unwrap();
    let after_first = captured.text();
    let second = pipeline.run(&source).unwrap();

    assert_eq!(first.trail, second.trail);
    assert_eq!(captured.text(), after_first.repeat(2));
    assert!(first.unload.unwrap().is_complete());
    assert!(second.unload.unwrap().is_complete());
    assert!(pipeline.registry().live().is_empty());
}

#[test]
fn escalated_warnings_fail_the_run() {
    let (pipeline, captured) = pipeline_with(PipelineConfig {
        compile: CompileOptions {
            warnings_as_errors: true,
            ..CompileOptions::default()
        },
        ..PipelineConfig::default()
    });
    let outcome = pipeline.run(&SourceUnit::latest(samples::FILTERED_ECHO));
    let report = outcome.as_ref().unwrap();
    assert_eq!(report.diagnostics.len(), 1);
    assert_eq!(report.diagnostics[0].code.as_str(), "FL3002");
    assert!(captured.text().contains("(warning treated as error)"));
    assert_eq!(pipeline.exit_code(&outcome), 1);
}

#[test]
fn older_language_version_rejects_lambdas() {
    let (pipeline, captured) = pipeline();
    let source = SourceUnit::new(samples::FILTERED_ECHO, LanguageVersion::V1);
    let report = pipeline.run(&source).unwrap();
    assert!(!report.compiled());
    assert!(captured.text().starts_with("error[FL0002]"));
}

#[test]
fn runtime_fault_reaches_the_caller_after_unloading() {
    let (pipeline, _) = pipeline();
    let outcome = pipeline.run(&SourceUnit::latest(
        r#"type P { static fn main(args: [str]) { core::panic("no"); } }"#,
    ));
    let Err(PipelineError::Invocation { source, trail, unload }) = &outcome else {
        panic!("expected an invocation failure");
    };
    assert!(matches!(source, InvokeError::Runtime(_)));
    assert_eq!(trail.as_slice(), FULL_TRAIL);
    assert!(unload.wait(Duration::from_millis(10)));
    assert_eq!(pipeline.exit_code(&outcome), 2);
}

#[test]
fn long_filter_chains_are_forced_without_recursion() {
    let (pipeline, captured) = pipeline();
    let source = r#"use seq;
        type P {
            static fn main(args: [str]) {
                let s = seq::map(args, |a| a);
                let i = 0;
                while i < 1000 {
                    s = seq::filter(s, |a| !text::is_empty(a));
                    i = i + 1;
                }
                io::print_line(seq::count(s));
            }
        }"#;
    let outcome = pipeline.run(&SourceUnit::latest(source));
    assert!(outcome.is_ok(), "{outcome:?}");
    assert_eq!(captured.text(), "1\n");
}

#[test]
fn runaway_filter_chain_faults_and_unloads() {
    let (pipeline, captured) = pipeline();
    let source = r#"use seq;
        type P {
            static fn main(args: [str]) {
                let s = seq::filter(args, |a| true);
                let i = 0;
                while i < 5000 {
                    s = seq::filter(s, |a| true);
                    i = i + 1;
                }
                io::print_line(seq::count(s));
            }
        }"#;
    let outcome = pipeline.run(&SourceUnit::latest(source));
    let Err(PipelineError::Invocation { source, trail, unload }) = &outcome else {
        panic!("expected an invocation failure, got {outcome:?}");
    };
    assert!(matches!(source, InvokeError::Runtime(_)));
    assert_eq!(trail.as_slice(), FULL_TRAIL);
    assert!(unload.wait(Duration::from_millis(10)));
    assert!(pipeline.registry().live().is_empty());
    assert_eq!(captured.text(), "");
    assert_eq!(pipeline.exit_code(&outcome), 2);
}

struct Parts {
    compiler: Compiler,
    loader: Loader,
    resolver: TableResolver,
}

fn parts(ids: Arc<dyn flicker::ids::IdGenerator>) -> Parts {
    let table = Arc::new(ModuleTable::standard());
    Parts {
        compiler: Compiler::new(CompileOptions::default(), ids.clone()),
        loader: Loader::new(table.clone(), ids, Arc::new(ContextRegistry::new())),
        resolver: TableResolver::new(table),
    }
}

#[test]
fn invoking_after_unload_fails_distinctly() {
    let parts = parts(Arc::new(SequentialIds::new("it")));
    let result = parts
        .compiler
        .compile_source(&SourceUnit::latest(samples::ECHO), &parts.resolver)
        .unwrap();
    let entry = result.entry_point().unwrap().clone();
    let loaded = parts.loader.load(result.into_image()).unwrap();
    let (console, captured) = Console::capture();
    let invoker = Invoker::new(console);
    let args = vec!["abc".to_owned()];

    invoker.invoke(&loaded, &entry, &args).unwrap();
    LifecycleManager::new().unload(loaded.clone());
    let err = invoker.invoke(&loaded, &entry, &args).unwrap_err();
    assert!(matches!(err, InvokeError::Unloaded(_)));
    assert_eq!(captured.text(), "abc\n");
}

#[test]
fn escaped_reference_keeps_the_identity_taken() {
    let parts = parts(Arc::new(FixedIds("ctx-fixed".to_owned())));
    let image = parts
        .compiler
        .compile_source(&SourceUnit::latest(samples::ECHO), &parts.resolver)
        .unwrap()
        .into_image();

    let loaded = parts.loader.load(image.clone()).unwrap();
    let pin = loaded.pin().unwrap();
    let handle = LifecycleManager::new().unload(loaded);
    assert!(!handle.wait(Duration::from_millis(5)));
    assert!(matches!(
        parts.loader.load(image.clone()),
        Err(LoadFault::DuplicateContext(_))
    ));

    drop(pin);
    assert!(handle.wait(Duration::from_millis(5)));
    assert!(parts.loader.load(image).is_ok());
}
