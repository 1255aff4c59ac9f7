use proptest::prelude::*;
use imgscript::image::Image;
use imgscript::script::builtins::levenshtein;
use imgscript::script::expand::{expand, ExpandContext};
use imgscript::script::lexer::tokenize;
use imgscript::script::selection::resolve;
use imgscript::script::Value;
use imgscript::InterpreterError;

/// Context with no variables and no images.
struct Empty;

impl ExpandContext for Empty {
    fn variable(&self, _: &str) -> Option<String> {
        None
    }
    fn image_count(&self) -> usize {
        0
    }
    fn image_names(&self) -> &[String] {
        &[]
    }
    fn image(&self, index: usize) -> Result<&Image, InterpreterError> {
        Err(InterpreterError::argument(format!("no image {index}")))
    }
    fn verbosity(&self) -> i32 {
        0
    }
    fn elapsed(&self) -> f64 {
        0.0
    }
    fn call_stack(&self) -> String {
        String::new()
    }
    fn call_path(&self) -> String {
        String::new()
    }
    fn loop_indices(&self) -> Option<(u64, i64)> {
        None
    }
    fn evaluate(&mut self, _: &str, _: Option<usize>) -> Result<Value, InterpreterError> {
        Ok(Value::Scalar(0.0))
    }
    fn run_subscript(&mut self, _: &str) -> Result<String, InterpreterError> {
        Ok(String::new())
    }
}

fn names(n: usize) -> Vec<String> {
    vec![String::new(); n]
}

proptest! {
    /// `[^]` selects every image in order.
    #[test]
    fn select_all_is_identity(n in 0usize..64) {
        let got = resolve("^", n, &names(n), false).unwrap();
        prop_assert_eq!(got, (0..n).collect::<Vec<_>>());
    }

    /// A range reads the same in either direction.
    #[test]
    fn reversed_range_is_forward_range(n in 1usize..64, a in 0usize..64, b in 0usize..64) {
        let (a, b) = (a % n, b % n);
        let fwd = resolve(&format!("{a}-{b}"), n, &names(n), false).unwrap();
        let rev = resolve(&format!("{b}-{a}"), n, &names(n), false).unwrap();
        prop_assert_eq!(fwd, rev);
    }

    /// Selections never name an index outside the list.
    #[test]
    fn selection_in_bounds(n in 1usize..32, sel in "[0-9]{1,2}(-[0-9]{1,2})?(:[1-3])?") {
        if let Ok(got) = resolve(&sel, n, &names(n), false) {
            prop_assert!(got.iter().all(|&i| i < n));
        }
    }

    /// Text without substitution characters passes through unchanged.
    #[test]
    fn expand_plain_text_unchanged(s in "[^${}]{0,64}") {
        prop_assert_eq!(expand(&s, &mut Empty).unwrap(), s);
    }

    #[test]
    fn levenshtein_symmetric(a in "[a-z]{0,12}", b in "[a-z]{0,12}") {
        prop_assert_eq!(levenshtein(&a, &b), levenshtein(&b, &a));
        prop_assert_eq!(levenshtein(&a, &a), 0);
    }

    /// The lexer returns a result for any input; it never panics.
    #[test]
    fn tokenize_never_panics(s in "\\PC{0,128}") {
        let _ = tokenize(&s);
    }

    /// Whitespace-separated words come back as items.
    #[test]
    fn tokenize_plain_words(words in proptest::collection::vec("[a-z0-9]{1,8}", 0..16)) {
        let items = tokenize(&words.join(" ")).unwrap();
        let texts: Vec<String> = items.into_iter().map(|i| i.text).collect();
        prop_assert_eq!(texts, words);
    }
}
