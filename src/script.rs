//! Embedded script engine for in-process languages
//!
//! Programs never touch the judge's own stdin/stdout. They receive an I/O
//! capability ([`ProgramIo`]) through which `print`, `write` and `input`
//! are routed:
//! - [`RecordingIo`] feeds scripted inputs and records a trace
//! - [`ConsoleIo`] talks to the real terminal
//!
//! This module does NOT:
//! - Enforce time limits (callers flip the cancel flag)
//! - Decide test case classifications

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rhai::{Dynamic, Engine, EvalAltResult, ParseError, Position, Scope, AST};
use tracing::debug;

use crate::trace::SharedTrace;

/// File name shown in diagnostics
pub const SCRIPT_FILE: &str = "main.rhai";

const MISSING_INPUT: &str = "not enough inputs";

/// I/O capability handed to a running program
pub trait ProgramIo: Send + Sync {
    fn write(&self, text: &str);

    /// Next line of input, or None when input is exhausted
    fn read_line(&self) -> Option<String>;

    /// Whether a read was attempted after input ran out
    fn exhausted(&self) -> bool {
        false
    }
}

/// Scripted inputs in, trace out
#[derive(Debug)]
pub struct RecordingIo {
    inputs: Mutex<VecDeque<String>>,
    trace: SharedTrace,
    exhausted: AtomicBool,
}

impl RecordingIo {
    pub fn new(inputs: Vec<String>, trace: SharedTrace) -> Self {
        Self {
            inputs: Mutex::new(inputs.into()),
            trace,
            exhausted: AtomicBool::new(false),
        }
    }
}

impl ProgramIo for RecordingIo {
    fn write(&self, text: &str) {
        self.trace.push_output(text);
    }

    fn read_line(&self) -> Option<String> {
        let next = self
            .inputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match next {
            Some(line) => {
                self.trace.push_input(&line);
                Some(line)
            }
            None => {
                self.exhausted.store(true, Ordering::SeqCst);
                None
            }
        }
    }

    fn exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }
}

/// The process's own terminal
#[derive(Debug, Default)]
pub struct ConsoleIo;

impl ProgramIo for ConsoleIo {
    fn write(&self, text: &str) {
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }

    fn read_line(&self) -> Option<String> {
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => {
                if line.ends_with('\n') {
                    line.pop();
                    if line.ends_with('\r') {
                        line.pop();
                    }
                }
                Some(line)
            }
        }
    }
}

/// Parsed program plus the namespace it starts with
#[derive(Debug, Clone)]
pub struct CompiledScript {
    pub ast: AST,
    /// Read-only names visible to the program
    pub globals: BTreeMap<String, String>,
    /// Mutable names visible to the program
    pub locals: BTreeMap<String, String>,
}

impl CompiledScript {
    /// Fresh scope for one run; runs never share variables
    pub fn fresh_scope(&self) -> Scope<'static> {
        let mut scope = Scope::new();
        for (name, value) in &self.globals {
            scope.push_constant(name.as_str(), value.clone());
        }
        for (name, value) in &self.locals {
            scope.push(name.as_str(), value.clone());
        }
        scope
    }
}

/// Why a script did not run to completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptFailure {
    /// Stopped through the cancel flag
    Cancelled,
    /// Asked for more input than was supplied; carries the traceback
    MissingInput(String),
    /// Any other uncaught error; carries the traceback
    Error(String),
}

fn base_engine() -> Engine {
    let mut engine = Engine::new();
    engine.disable_symbol("eval");
    engine.on_debug(|text, _source, pos| debug!("script debug at {}: {}", pos, text));
    engine
}

/// Engine wired to an I/O capability and an optional cancel flag
pub fn new_engine(io: Arc<dyn ProgramIo>, cancel: Option<Arc<AtomicBool>>) -> Engine {
    let mut engine = base_engine();

    let out = io.clone();
    engine.on_print(move |text| out.write(&format!("{}\n", text)));

    let out = io.clone();
    engine.register_fn("write", move |value: Dynamic| out.write(&value.to_string()));

    let input = io.clone();
    engine.register_fn("input", move || read_input(input.as_ref()));

    let input = io;
    engine.register_fn("input", move |prompt: Dynamic| {
        input.write(&prompt.to_string());
        read_input(input.as_ref())
    });

    if let Some(cancel) = cancel {
        engine.on_progress(move |_| {
            if cancel.load(Ordering::Relaxed) {
                Some(Dynamic::UNIT)
            } else {
                None
            }
        });
    }

    engine
}

fn read_input(io: &dyn ProgramIo) -> Result<String, Box<EvalAltResult>> {
    io.read_line().ok_or_else(|| MISSING_INPUT.into())
}

/// Parse a program, returning a readable diagnostic on failure
pub fn compile(source: &str) -> Result<AST, String> {
    base_engine()
        .compile(source)
        .map_err(|err| format_parse_error(&err, source))
}

/// Run a compiled program against an I/O capability
pub fn run(
    script: &CompiledScript,
    io: Arc<dyn ProgramIo>,
    cancel: Option<Arc<AtomicBool>>,
    source: &str,
) -> Result<(), ScriptFailure> {
    let engine = new_engine(io.clone(), cancel);
    let mut scope = script.fresh_scope();

    match engine.run_ast_with_scope(&mut scope, &script.ast) {
        Ok(()) => Ok(()),
        Err(err) => {
            if matches!(innermost(&err), EvalAltResult::ErrorTerminated(..)) {
                Err(ScriptFailure::Cancelled)
            } else if io.exhausted() {
                Err(ScriptFailure::MissingInput(format_traceback(
                    &err,
                    source,
                    Some("MissingInputError"),
                )))
            } else {
                Err(ScriptFailure::Error(format_traceback(&err, source, None)))
            }
        }
    }
}

fn innermost(err: &EvalAltResult) -> &EvalAltResult {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => innermost(inner),
        other => other,
    }
}

/// Syntax error diagnostic pointing at the offending column
pub fn format_parse_error(err: &ParseError, source: &str) -> String {
    let pos = err.position();
    let mut lines = Vec::new();
    match pos.line() {
        Some(line_no) => {
            lines.push(format!("  File \"{}\", line {}", SCRIPT_FILE, line_no));
            if let Some(code) = source.lines().nth(line_no - 1) {
                lines.push(format!("    {}", code));
                if let Some(column) = pos.position() {
                    lines.push(format!("    {}^", " ".repeat(column.saturating_sub(1))));
                }
            }
        }
        None => lines.push(format!("  File \"{}\"", SCRIPT_FILE)),
    }
    lines.push(format!("SyntaxError: {}", err.err_type()));
    lines.join("\n")
}

/// Traceback of an uncaught error.
///
/// Program frames show the literal source line. Errors the engine reports
/// without a position (operators, mostly) are attributed to the definition
/// of the function they were raised in.
pub fn format_traceback(err: &EvalAltResult, source: &str, name: Option<&str>) -> String {
    let source_lines: Vec<&str> = source.lines().collect();
    let mut frames: Vec<(String, Position)> = Vec::new();
    let mut enclosing = "<module>".to_string();
    let mut current = err;

    while let EvalAltResult::ErrorInFunctionCall(function, _, inner, pos) = current {
        frames.push((enclosing, *pos));
        enclosing = function.clone();
        current = inner.as_ref();
    }
    frames.push((enclosing, current.position()));

    let mut lines = vec!["Traceback (most recent call last):".to_string()];
    for (function, pos) in &frames {
        let line_no = pos
            .line()
            .or_else(|| definition_line(&source_lines, function));
        match line_no {
            Some(line_no) => {
                lines.push(format!(
                    "  File \"{}\", line {}, in {}",
                    SCRIPT_FILE, line_no, function
                ));
                if let Some(code) = source_lines.get(line_no - 1) {
                    lines.push(format!("    {}", code.trim()));
                }
            }
            None => lines.push(format!("  File \"{}\", in {}", SCRIPT_FILE, function)),
        }
    }
    lines.push(format!(
        "{}: {}",
        name.unwrap_or_else(|| error_name(current)),
        error_message(current)
    ));
    lines.join("\n")
}

/// 1-based line of `fn name(` in the program
fn definition_line(source_lines: &[&str], function: &str) -> Option<usize> {
    let header = format!("fn {}", function);
    source_lines.iter().position(|line| {
        let line = line.trim_start();
        let line = line.strip_prefix("private ").unwrap_or(line);
        line.strip_prefix(&header)
            .map(|rest| rest.trim_start().starts_with('('))
            .unwrap_or(false)
    })
    .map(|idx| idx + 1)
}

fn error_name(err: &EvalAltResult) -> &'static str {
    match err {
        EvalAltResult::ErrorArithmetic(..) => "ArithmeticError",
        EvalAltResult::ErrorVariableNotFound(..) | EvalAltResult::ErrorFunctionNotFound(..) => {
            "NameError"
        }
        EvalAltResult::ErrorArrayBounds(..) | EvalAltResult::ErrorStringBounds(..) => {
            "IndexError"
        }
        EvalAltResult::ErrorMismatchDataType(..) | EvalAltResult::ErrorMismatchOutputType(..) => {
            "TypeError"
        }
        _ => "RuntimeError",
    }
}

fn error_message(err: &EvalAltResult) -> String {
    if let EvalAltResult::ErrorRuntime(value, _) = err {
        return value.to_string();
    }
    let mut message = err.to_string();
    if message.ends_with(')') {
        if let Some(idx) = message.rfind(" (line ") {
            message.truncate(idx);
        }
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::Node;

    fn compiled(source: &str) -> CompiledScript {
        CompiledScript {
            ast: compile(source).unwrap(),
            globals: BTreeMap::new(),
            locals: BTreeMap::new(),
        }
    }

    fn run_recorded(source: &str, inputs: &[&str]) -> (Result<(), ScriptFailure>, Vec<Node>) {
        let trace = SharedTrace::new();
        let io = Arc::new(RecordingIo::new(
            inputs.iter().map(|s| s.to_string()).collect(),
            trace.clone(),
        ));
        let result = run(&compiled(source), io, None, source);
        (result, trace.snapshot().into_nodes())
    }

    #[test]
    fn test_print_and_input_are_recorded() {
        let source = r#"
let a = input("first: ");
let b = input("second: ");
print(a + " " + b);
"#;
        let (result, nodes) = run_recorded(source, &["a", "b"]);
        assert_eq!(result, Ok(()));
        assert_eq!(
            nodes,
            vec![
                Node::Out("first: ".into()),
                Node::In("a".into()),
                Node::Out("second: ".into()),
                Node::In("b".into()),
                Node::Out("a b\n".into()),
            ]
        );
    }

    #[test]
    fn test_consecutive_prints_coalesce() {
        let (result, nodes) = run_recorded("print(1); write(2); print(3);", &[]);
        assert_eq!(result, Ok(()));
        assert_eq!(nodes, vec![Node::Out("1\n23\n".into())]);
    }

    #[test]
    fn test_missing_input_is_reported() {
        let source = "let a = input();\nlet b = input();\nprint(a + b);";
        let (result, nodes) = run_recorded(source, &["only"]);
        match result {
            Err(ScriptFailure::MissingInput(traceback)) => {
                assert!(traceback.contains("line 2"), "{}", traceback);
                assert!(traceback.contains("let b = input();"), "{}", traceback);
                assert!(traceback.ends_with("MissingInputError: not enough inputs"));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(nodes, vec![Node::In("only".into())]);
    }

    #[test]
    fn test_traceback_names_program_frames() {
        let source = "fn divide(a, b) {\n    a / b\n}\nprint(divide(1, 0));";
        let (result, _) = run_recorded(source, &[]);
        match result {
            Err(ScriptFailure::Error(traceback)) => {
                assert!(traceback.starts_with("Traceback (most recent call last):"));
                assert!(traceback.contains("line 4, in <module>"), "{}", traceback);
                assert!(traceback.contains("print(divide(1, 0));"), "{}", traceback);
                assert!(traceback.contains(", in divide"), "{}", traceback);
                assert!(traceback.contains("ArithmeticError"), "{}", traceback);
                assert!(!traceback.contains("(line "), "{}", traceback);
                let module = traceback.find("in <module>").unwrap();
                let divide = traceback.find("in divide").unwrap();
                assert!(module < divide, "{}", traceback);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_positionless_frame_uses_definition_line() {
        let err = EvalAltResult::ErrorInFunctionCall(
            "divide".to_string(),
            String::new(),
            Box::new(EvalAltResult::ErrorArithmetic(
                "Division by zero: 1 / 0".to_string(),
                Position::NONE,
            )),
            Position::new(4, 7),
        );
        let source = "fn divide(a, b) {\n    a / b\n}\nprint(divide(1, 0));";
        let traceback = format_traceback(&err, source, None);
        assert_eq!(
            traceback,
            "Traceback (most recent call last):\n  File \"main.rhai\", line 4, in <module>\n    print(divide(1, 0));\n  File \"main.rhai\", line 1, in divide\n    fn divide(a, b) {\nArithmeticError: Division by zero: 1 / 0"
        );
    }

    #[test]
    fn test_unknown_frame_is_named_without_line() {
        let err = EvalAltResult::ErrorArithmetic("overflow".to_string(), Position::NONE);
        let traceback = format_traceback(&err, "print(1);", None);
        assert_eq!(
            traceback,
            "Traceback (most recent call last):\n  File \"main.rhai\", in <module>\nArithmeticError: overflow"
        );
    }

    #[test]
    fn test_parse_error_points_at_source() {
        let err = compile("let x = 1;\nlet y = ;").unwrap_err();
        assert!(err.contains("line 2"), "{}", err);
        assert!(err.contains("let y = ;"), "{}", err);
        assert!(err.contains("SyntaxError:"), "{}", err);
    }

    #[test]
    fn test_eval_is_disabled() {
        assert!(compile("eval(\"1\")").is_err());
    }

    #[test]
    fn test_cancel_flag_stops_infinite_loop() {
        let trace = SharedTrace::new();
        let io = Arc::new(RecordingIo::new(Vec::new(), trace));
        let cancel = Arc::new(AtomicBool::new(true));
        let result = run(&compiled("loop { }"), io, Some(cancel), "loop { }");
        assert_eq!(result, Err(ScriptFailure::Cancelled));
    }

    #[test]
    fn test_namespace_is_fresh_per_run() {
        let mut script = compiled("counter += 1; print(greeting + counter);");
        script.globals.insert("greeting".into(), "hi ".into());
        script.locals.insert("counter".into(), "0".into());

        for _ in 0..2 {
            let trace = SharedTrace::new();
            let io = Arc::new(RecordingIo::new(Vec::new(), trace.clone()));
            assert_eq!(run(&script, io, None, ""), Ok(()));
            assert_eq!(trace.snapshot().nodes(), &[Node::Out("hi 01\n".into())]);
        }
    }
}
