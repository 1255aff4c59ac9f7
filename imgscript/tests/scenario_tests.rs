//! End-to-end scripts run through the library API.

use std::sync::Arc;

use imgscript::config::Config;
use imgscript::error::OpError;
use imgscript::image::basic::BasicLibrary;
use imgscript::image::{ExprContext, Image, ImageLibrary, ImageList, ImageSlot, OpArg};
use imgscript::script::parallel::THREAD_STACK_SIZE;
use imgscript::script::{Interpreter, RunStatus, Value};
use imgscript::{ErrorKind, InterpreterError};

// ── Helpers ───────────────────────────────────────────────────────────────────

fn run_with(interp: &mut Interpreter, script: &str) -> Result<ImageList, InterpreterError> {
    let mut images = ImageList::new();
    interp.run(script, &mut images)?;
    Ok(images)
}

fn output(script: &str) -> Vec<String> {
    let mut interp = Interpreter::new();
    run_with(&mut interp, script).unwrap_or_else(|e| panic!("{script}: {}", e.rendered()));
    interp.take_output()
}

fn error(script: &str) -> InterpreterError {
    let mut interp = Interpreter::new();
    run_with(&mut interp, script).expect_err(script)
}

/// Delegates to [`BasicLibrary`], except that `abs` leaves an unnamed image
/// behind.
struct LeakyLibrary(BasicLibrary);

impl ImageLibrary for LeakyLibrary {
    fn apply_operation(
        &self,
        name: &str,
        selection: &[usize],
        args: &[OpArg],
        images: &mut Vec<ImageSlot>,
        names: &mut Vec<String>,
    ) -> Result<(), OpError> {
        if name == "abs" {
            images.push(ImageSlot::Owned(Image::scalar(0.0)));
            return Ok(());
        }
        self.0.apply_operation(name, selection, args, images, names)
    }

    fn evaluate_expression(&self, expr: &str, ctx: &ExprContext<'_>) -> Result<Value, imgscript::error::EvalError> {
        self.0.evaluate_expression(expr, ctx)
    }
}

// ── Control flow ──────────────────────────────────────────────────────────────

#[test]
fn repeat_accumulates() {
    assert_eq!(output("(0) repeat 3 add 1 done echo {0,^}"), vec!["3"]);
}

#[test]
fn dash_prefixed_items_and_empty_stack_after_run() {
    let mut interp = Interpreter::new();
    let images = run_with(&mut interp, "-input (0) -repeat 3 -add 1 -done").unwrap();
    assert_eq!(images.image(0).unwrap().data(), &[3.0]);
    assert_eq!(interp.call_stack().len(), 0);

    interp.load_commands("twice : repeat 2 local add 1 endlocal done", "lib.ims");
    let images = run_with(&mut interp, "(0) -twice if 1 -twice -endif").unwrap();
    assert_eq!(images.image(0).unwrap().data(), &[4.0]);
    assert_eq!(interp.call_stack().len(), 0);
}

#[test]
fn stack_is_unwound_after_error() {
    let mut interp = Interpreter::new();
    interp.load_commands("deep : repeat 2 local error stop endlocal done", "lib.ims");
    run_with(&mut interp, "deep").unwrap_err();
    assert_eq!(interp.call_stack().len(), 0);
}

#[test]
fn if_else_picks_branch() {
    assert_eq!(output("x=5 if $x<3 echo 1 else echo 2 endif"), vec!["2"]);
}

#[test]
fn nested_loops_see_their_own_index() {
    assert_eq!(
        output("repeat 2 repeat 2 echo $> done done"),
        vec!["0", "1", "0", "1"]
    );
}

#[test]
fn quit_reports_status() {
    let mut interp = Interpreter::new();
    let status = interp.run("echo a quit echo b", &mut ImageList::new()).unwrap();
    assert_eq!(status, RunStatus::Quit);
    assert_eq!(interp.take_output(), vec!["a"]);
}

#[test]
fn unmatched_block_keywords() {
    let err = error("done");
    assert_eq!(err.kind, ErrorKind::Syntax);
    assert!(err.message.contains("No associated"));
    assert_eq!(error("endif").kind, ErrorKind::Syntax);
    assert_eq!(error("repeat 2 echo x").kind, ErrorKind::Syntax);
}

// ── Custom commands ───────────────────────────────────────────────────────────

#[test]
fn custom_command_shadows_and_uncommand_restores() {
    let mut interp = Interpreter::new();
    interp.load_commands("greet : echo old", "a.ims");
    interp.load_commands("greet : echo new", "b.ims");
    run_with(&mut interp, "greet uncommand greet greet").unwrap();
    assert_eq!(interp.take_output(), vec!["new", "old"]);
}

#[test]
fn default_argument_value() {
    let mut interp = Interpreter::new();
    interp.load_commands("hello : echo ${1=foo}", "lib.ims");
    run_with(&mut interp, "hello").unwrap();
    run_with(&mut interp, "hello bar").unwrap();
    assert_eq!(interp.take_output(), vec!["foo", "bar"]);
}

#[test]
fn unbounded_recursion_overflows() {
    // Default depth limit, on an interpreter-sized stack.
    let handle = std::thread::Builder::new()
        .stack_size(THREAD_STACK_SIZE)
        .spawn(|| {
            let mut interp = Interpreter::new();
            interp.load_commands("forever : forever", "lib.ims");
            run_with(&mut interp, "forever").unwrap_err().kind
        })
        .unwrap();
    assert_eq!(handle.join().unwrap(), ErrorKind::StackOverflow);
}

#[test]
fn negative_subset_arguments_are_bound() {
    let mut interp = Interpreter::new();
    interp.load_commands("last : status ${-1}\ntail : echo ${-2--1}", "lib.ims");
    run_with(&mut interp, "last a,b tail x,y,z").unwrap();
    assert_eq!(interp.status(), "b");
    assert_eq!(interp.take_output(), vec!["y,z"]);
}

// ── Image literals ────────────────────────────────────────────────────────────

#[test]
fn uneven_literal_slices_are_padded() {
    let mut interp = Interpreter::new();
    let images = run_with(&mut interp, "(1;2/3)").unwrap();
    let img = images.image(0).unwrap();
    assert_eq!((img.width(), img.height(), img.depth()), (1, 2, 2));
    assert_eq!(img.data(), &[1.0, 2.0, 3.0, 0.0]);
}

#[test]
fn oversized_input_is_an_argument_error() {
    assert_eq!(error("input 1e30").kind, ErrorKind::Argument);
}

// ── Parallel ──────────────────────────────────────────────────────────────────

#[test]
fn parallel_error_cancels_siblings() {
    let mut interp = Interpreter::new();
    let err = run_with(&mut interp, "(1) parallel \"repeat inf add 1 done\",\"error stop\"").unwrap_err();
    assert_eq!(err.kind, ErrorKind::User);
    assert_eq!(err.message, "stop");
}

#[test]
fn parallel_removal_does_not_duplicate_images() {
    let mut interp = Interpreter::new();
    let images = run_with(&mut interp, "(1) (2) parallel \"remove[0]\",\"skip 0\"").unwrap();
    let got: Vec<f32> = (0..images.len()).map(|i| images.image(i).unwrap().data()[0]).collect();
    assert_eq!(got, vec![1.0, 2.0]);
}

#[test]
fn parallel_shared_variables() {
    let mut interp = Interpreter::new();
    run_with(&mut interp, "__hits=0 parallel \"__hits+=1\",\"__hits+=1\",\"__hits+=1\"").unwrap();
    assert_eq!(interp.variables().get("__hits").as_deref(), Some("3"));
}

// ── Invariants ────────────────────────────────────────────────────────────────

#[test]
fn library_breaking_name_list_is_internal_error() {
    let library = Arc::new(LeakyLibrary(BasicLibrary::new()));
    let mut interp = Interpreter::with_library(library, &Config::default());
    let err = run_with(&mut interp, "(1) abs").unwrap_err();
    assert_eq!(err.kind, ErrorKind::InternalInvariant);
}
