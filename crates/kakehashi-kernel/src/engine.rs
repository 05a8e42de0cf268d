//! Rhai engine construction shared by session evaluation and skills.
//!
//! A fresh [`Engine`] is built for every evaluation. Engines are cheap and
//! this keeps output capture and the interrupt flag strictly per call.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rhai::{Dynamic, Engine, EvalAltResult};

use crate::host::register_host_api;

/// Tunable engine limits. The remaining safety limits are fixed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineLimits {
    /// Operation budget per evaluation; 0 is unlimited.
    pub max_operations: u64,
}

/// Text a single evaluation printed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }

    /// `log` message bodies for the non-empty streams.
    pub fn log_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if !self.stdout.is_empty() {
            lines.push(format!("STDOUT: {}", self.stdout));
        }
        if !self.stderr.is_empty() {
            lines.push(format!("STDERR: {}", self.stderr));
        }
        lines
    }
}

/// Buffers the engine's `print`/`debug`/`eprint` output.
#[derive(Clone, Default)]
pub struct OutputCapture {
    stdout: Arc<Mutex<String>>,
    stderr: Arc<Mutex<String>>,
}

impl OutputCapture {
    /// Drain both buffers.
    pub fn take(&self) -> CapturedOutput {
        CapturedOutput {
            stdout: std::mem::take(&mut *self.stdout.lock()),
            stderr: std::mem::take(&mut *self.stderr.lock()),
        }
    }
}

/// Create a configured engine with output capture, utilities and the host API.
pub fn build_engine(
    limits: &EngineLimits,
    capture: &OutputCapture,
    interrupted: Arc<AtomicBool>,
) -> Engine {
    let mut engine = Engine::new();

    // Safety limits
    engine.set_max_expr_depths(64, 64);
    engine.set_max_operations(limits.max_operations);
    engine.set_max_modules(10);
    engine.set_max_string_size(1_000_000);
    engine.set_max_array_size(10_000);
    engine.set_max_map_size(10_000);

    register_output(&mut engine, capture);
    register_utility_functions(&mut engine, interrupted.clone());
    register_host_api(&mut engine);

    engine.on_progress(move |_ops| {
        if interrupted.load(Ordering::SeqCst) {
            Some(Dynamic::from("interrupted"))
        } else {
            None
        }
    });

    engine
}

fn register_output(engine: &mut Engine, capture: &OutputCapture) {
    let stdout = capture.stdout.clone();
    engine.on_print(move |text| {
        let mut out = stdout.lock();
        out.push_str(text);
        out.push('\n');
    });

    let stderr = capture.stderr.clone();
    engine.on_debug(move |text, _source, _pos| {
        let mut err = stderr.lock();
        err.push_str(text);
        err.push('\n');
    });

    // eprint(value)
    let stderr = capture.stderr.clone();
    engine.register_fn("eprint", move |value: Dynamic| {
        let mut err = stderr.lock();
        err.push_str(&value.to_string());
        err.push('\n');
    });
}

fn register_utility_functions(engine: &mut Engine, interrupted: Arc<AtomicBool>) {
    // is_interrupted() -> bool
    let int_check = interrupted.clone();
    engine.register_fn("is_interrupted", move || -> bool {
        int_check.load(Ordering::SeqCst)
    });

    // sleep_ms(ms: i64)
    // Sleeps in short slices so an interrupt is noticed promptly.
    let int_sleep = interrupted;
    engine.register_fn("sleep_ms", move |ms: i64| {
        if ms <= 0 {
            return;
        }
        let mut remaining = ms as u64;
        let chunk = 10u64;
        while remaining > 0 {
            if int_sleep.load(Ordering::SeqCst) {
                break;
            }
            let step = remaining.min(chunk);
            std::thread::sleep(Duration::from_millis(step));
            remaining -= step;
        }
    });
}

/// A guest failure flattened into a message and a call trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestFailure {
    /// The innermost error.
    pub message: String,
    /// One line per frame, outermost call first.
    pub trace: String,
}

impl GuestFailure {
    pub fn from_eval(err: &EvalAltResult) -> Self {
        let mut frames = Vec::new();
        let mut current = err;
        loop {
            match current {
                EvalAltResult::ErrorInFunctionCall(name, source, inner, pos) => {
                    if source.is_empty() {
                        frames.push(format!("  in call to function '{name}' at {pos}"));
                    } else {
                        frames.push(format!("  in call to function '{name}' ({source}) at {pos}"));
                    }
                    current = inner.as_ref();
                }
                EvalAltResult::ErrorInModule(path, inner, pos) => {
                    frames.push(format!("  in module '{path}' at {pos}"));
                    current = inner.as_ref();
                }
                root => {
                    let message = root.to_string();
                    frames.push(format!("  {message}"));
                    return Self {
                        message,
                        trace: frames.join("\n"),
                    };
                }
            }
        }
    }

    /// The run was stopped by the interrupt flag.
    pub fn is_interrupt(err: &EvalAltResult) -> bool {
        let mut current = err;
        loop {
            match current {
                EvalAltResult::ErrorInFunctionCall(_, _, inner, _)
                | EvalAltResult::ErrorInModule(_, inner, _) => current = inner.as_ref(),
                EvalAltResult::ErrorTerminated(..) => return true,
                _ => return false,
            }
        }
    }
}

impl fmt::Display for GuestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\nTraceback (outermost first):\n{}", self.message, self.trace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> (Engine, OutputCapture) {
        let capture = OutputCapture::default();
        let engine = build_engine(
            &EngineLimits::default(),
            &capture,
            Arc::new(AtomicBool::new(false)),
        );
        (engine, capture)
    }

    #[test]
    fn test_print_is_captured() {
        let (engine, capture) = engine();
        engine.run(r#"print("hello"); print(42);"#).unwrap();
        let output = capture.take();
        assert_eq!(output.stdout, "hello\n42\n");
        assert!(output.stderr.is_empty());
        assert!(capture.take().is_empty());
    }

    #[test]
    fn test_eprint_and_debug_go_to_stderr() {
        let (engine, capture) = engine();
        engine.run(r#"eprint("oops"); debug("dbg");"#).unwrap();
        let output = capture.take();
        assert!(output.stdout.is_empty());
        assert!(output.stderr.starts_with("oops\n"));
        assert!(output.stderr.contains("dbg"));
    }

    #[test]
    fn test_log_lines() {
        let output = CapturedOutput {
            stdout: "a\n".into(),
            stderr: String::new(),
        };
        assert_eq!(output.log_lines(), vec!["STDOUT: a\n".to_string()]);
        assert!(CapturedOutput::default().log_lines().is_empty());
    }

    #[test]
    fn test_interrupt_stops_loop() {
        let capture = OutputCapture::default();
        let flag = Arc::new(AtomicBool::new(true));
        let engine = build_engine(&EngineLimits::default(), &capture, flag);
        let err = engine.run("loop { }").unwrap_err();
        assert!(GuestFailure::is_interrupt(&err));
    }

    #[test]
    fn test_operation_limit() {
        let capture = OutputCapture::default();
        let limits = EngineLimits {
            max_operations: 1_000,
        };
        let engine = build_engine(&limits, &capture, Arc::new(AtomicBool::new(false)));
        assert!(engine.run("let i = 0; loop { i += 1; }").is_err());
    }

    #[test]
    fn test_failure_trace_lists_frames() {
        let (engine, _) = engine();
        let err = engine
            .run(
                r#"
                fn inner() { throw "boom"; }
                fn outer() { inner() }
                outer();
                "#,
            )
            .unwrap_err();
        let failure = GuestFailure::from_eval(&err);
        assert!(failure.message.contains("boom"));
        assert!(failure.trace.contains("'outer'"));
        assert!(failure.trace.contains("'inner'"));
        let outer = failure.trace.find("'outer'").unwrap();
        let inner = failure.trace.find("'inner'").unwrap();
        assert!(outer < inner);
        assert!(!GuestFailure::is_interrupt(&err));
    }
}
