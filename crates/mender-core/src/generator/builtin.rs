//! Built-in rule-based strategies.
//!
//! Each strategy looks at the event message and the failing source line
//! captured by the analyzer, and proposes a small located edit. None of
//! them read or write the working tree.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::time::Instant;

use super::strategy::{FixStrategy, Proposal};
use crate::domain::{normalize_message, CodeChange, ErrorEvent};

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| unreachable!("strategy regex {pattern}: {e}"))
}

/// Every built-in strategy with its default priority.
pub fn all() -> Vec<Arc<dyn FixStrategy>> {
    vec![
        Arc::new(NullCheck),
        Arc::new(ResourceCleanup),
        Arc::new(ExceptionHandling),
        Arc::new(ConditionInversion),
        Arc::new(TypeConversion),
        Arc::new(CodeRefactoring),
    ]
}

/// Source language, inferred from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Go,
    Python,
    Java,
    JavaScript,
    Rust,
    Other,
}

impl Language {
    pub fn from_path(path: &str) -> Self {
        let ext = path.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("go") => Language::Go,
            Some("py") => Language::Python,
            Some("java") | Some("kt") => Language::Java,
            Some("js") | Some("mjs") | Some("cjs") | Some("jsx") | Some("ts") | Some("tsx") => {
                Language::JavaScript
            }
            Some("rs") => Language::Rust,
            _ => Language::Other,
        }
    }

    fn comment(&self) -> &'static str {
        match self {
            Language::Python => "#",
            _ => "//",
        }
    }
}

/// The failing line an edit is anchored to.
struct Target<'a> {
    file: &'a str,
    line: u32,
    text: &'a str,
    indent: &'a str,
    language: Language,
}

impl<'a> Target<'a> {
    fn of(event: &'a ErrorEvent) -> Option<Self> {
        let snippet = event.snippet.as_ref()?;
        let text = snippet.target_text()?;
        let indent_len = text.len() - text.trim_start().len();
        Some(Self {
            file: &snippet.file,
            line: snippet.target_line,
            text,
            indent: &text[..indent_len],
            language: Language::from_path(&snippet.file),
        })
    }

    /// One indentation step in the target's style.
    fn step(&self) -> &'static str {
        if self.indent.contains('\t') {
            "\t"
        } else if self.language == Language::JavaScript {
            "  "
        } else {
            "    "
        }
    }
}

fn haystack(event: &ErrorEvent) -> String {
    match &event.stack_trace {
        Some(trace) => format!("{}\n{}", event.message, trace),
        None => event.message.clone(),
    }
}

fn expired(deadline: Instant) -> bool {
    Instant::now() >= deadline
}

// ---------------------------------------------------------------------------
// null_check
// ---------------------------------------------------------------------------

static NULL_DEREF: Lazy<Regex> = Lazy::new(|| {
    re(r"(?i)nil pointer|null ?pointer|nonetype|null reference|undefined is not|cannot read propert(y|ies) of (null|undefined)|is not an object")
});
static RECEIVER: Lazy<Regex> = Lazy::new(|| re(r"([A-Za-z_][A-Za-z0-9_]*)\s*(?:\.|->|\[)"));

/// Guard the dereferenced value before the failing line.
pub struct NullCheck;

#[async_trait]
impl FixStrategy for NullCheck {
    fn tag(&self) -> &str {
        "null_check"
    }

    fn priority(&self) -> u32 {
        90
    }

    async fn propose(&self, event: &ErrorEvent, deadline: Instant) -> Option<Proposal> {
        if expired(deadline) || !NULL_DEREF.is_match(&haystack(event)) {
            return None;
        }
        let t = Target::of(event)?;
        let var = RECEIVER
            .captures_iter(t.text)
            .map(|c| c[1].to_string())
            .find(|v| !matches!(v.as_str(), "self" | "this" | "fmt" | "console" | "os"))?;
        let (i, s) = (t.indent, t.step());
        let guard = match t.language {
            Language::Go => format!("{i}if {var} == nil {{\n{i}{s}return\n{i}}}"),
            Language::Python => format!("{i}if {var} is None:\n{i}{s}return None"),
            Language::Java | Language::JavaScript => {
                format!("{i}if ({var} == null) {{\n{i}{s}return;\n{i}}}")
            }
            Language::Rust | Language::Other => return None,
        };
        Some(Proposal {
            changes: vec![CodeChange::add(t.file, t.line, guard)
                .with_description(format!("guard {var} against null"))],
            confidence: 0.6,
            description: format!("add a null check for `{var}` before {}:{}", t.file, t.line),
        })
    }
}

// ---------------------------------------------------------------------------
// resource_cleanup
// ---------------------------------------------------------------------------

static LEAK: Lazy<Regex> = Lazy::new(|| {
    re(r"(?i)too many open files|resource leak|file descriptor|unclosed|not closed|leak")
});
static GO_OPEN: Lazy<Regex> = Lazy::new(|| {
    re(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*,\s*[A-Za-z_][A-Za-z0-9_]*\s*:?=\s*(?:os\.(?:Open|Create|OpenFile)|net\.Dial\w*|sql\.Open)\(")
});

/// Release a Go handle with `defer` right after it is acquired.
pub struct ResourceCleanup;

#[async_trait]
impl FixStrategy for ResourceCleanup {
    fn tag(&self) -> &str {
        "resource_cleanup"
    }

    fn priority(&self) -> u32 {
        80
    }

    async fn propose(&self, event: &ErrorEvent, deadline: Instant) -> Option<Proposal> {
        if expired(deadline) || !LEAK.is_match(&haystack(event)) {
            return None;
        }
        let t = Target::of(event)?;
        if t.language != Language::Go {
            return None;
        }
        let var = GO_OPEN.captures(t.text)?[1].to_string();
        let line = format!("{}defer {var}.Close()", t.indent);
        Some(Proposal {
            changes: vec![CodeChange::add(t.file, t.line + 1, line)
                .with_description(format!("close {var} on return"))],
            confidence: 0.65,
            description: format!("defer {var}.Close() after {}:{}", t.file, t.line),
        })
    }
}

// ---------------------------------------------------------------------------
// exception_handling
// ---------------------------------------------------------------------------

static UNHANDLED: Lazy<Regex> =
    Lazy::new(|| re(r"(?i)unhandled|uncaught|exception|traceback|error:"));

/// Wrap the failing statement in a try/catch that logs.
pub struct ExceptionHandling;

#[async_trait]
impl FixStrategy for ExceptionHandling {
    fn tag(&self) -> &str {
        "exception_handling"
    }

    fn priority(&self) -> u32 {
        70
    }

    async fn propose(&self, event: &ErrorEvent, deadline: Instant) -> Option<Proposal> {
        if expired(deadline) || !UNHANDLED.is_match(&haystack(event)) {
            return None;
        }
        let t = Target::of(event)?;
        let stmt = t.text.trim();
        let (i, s) = (t.indent, t.step());
        let wrapped = match t.language {
            Language::Python if !stmt.ends_with(':') && !stmt.starts_with('@') => format!(
                "{i}try:\n{i}{s}{stmt}\n{i}except Exception:\n{i}{s}logging.exception(\"unhandled error\")"
            ),
            Language::Java if stmt.ends_with(';') => format!(
                "{i}try {{\n{i}{s}{stmt}\n{i}}} catch (Exception e) {{\n{i}{s}e.printStackTrace();\n{i}}}"
            ),
            Language::JavaScript if !stmt.ends_with('{') => format!(
                "{i}try {{\n{i}{s}{stmt}\n{i}}} catch (err) {{\n{i}{s}console.error(err);\n{i}}}"
            ),
            _ => return None,
        };
        Some(Proposal {
            changes: vec![CodeChange::modify(t.file, t.line, t.line, t.text, wrapped)
                .with_description("catch and log")],
            confidence: 0.5,
            description: format!("wrap {}:{} in an exception handler", t.file, t.line),
        })
    }
}

// ---------------------------------------------------------------------------
// condition_inversion
// ---------------------------------------------------------------------------

static OUT_OF_RANGE: Lazy<Regex> = Lazy::new(|| {
    re(r"(?i)index out of range|out of bounds|indexerror|arrayindexoutofbounds|rangeerror|off.by.one")
});
static INCLUSIVE_BOUND: Lazy<Regex> =
    Lazy::new(|| re(r"<=\s*(?:len\(|[\w.\[\]]+\.(?:length|size\(\)|len\(\)|Length|Count))"));

/// Turn an inclusive upper bound against a length into an exclusive one.
pub struct ConditionInversion;

#[async_trait]
impl FixStrategy for ConditionInversion {
    fn tag(&self) -> &str {
        "condition_inversion"
    }

    fn priority(&self) -> u32 {
        60
    }

    async fn propose(&self, event: &ErrorEvent, deadline: Instant) -> Option<Proposal> {
        if expired(deadline) || !OUT_OF_RANGE.is_match(&haystack(event)) {
            return None;
        }
        let t = Target::of(event)?;
        let m = INCLUSIVE_BOUND.find(t.text)?;
        let mut fixed = String::with_capacity(t.text.len());
        fixed.push_str(&t.text[..m.start()]);
        fixed.push('<');
        fixed.push_str(&t.text[m.start() + 2..]);
        Some(Proposal {
            changes: vec![CodeChange::modify(t.file, t.line, t.line, t.text, fixed)
                .with_description("exclusive upper bound")],
            confidence: 0.55,
            description: format!("replace `<=` with `<` at {}:{}", t.file, t.line),
        })
    }
}

// ---------------------------------------------------------------------------
// type_conversion
// ---------------------------------------------------------------------------

static CONVERSION: Lazy<Regex> = Lazy::new(|| {
    re(r"(?i)typeerror|valueerror|numberformatexception|invalid literal|cannot convert|parseinterror|parsefloaterror|strconv\.|classcastexception|invalid digit")
});
static PY_CAST: Lazy<Regex> =
    Lazy::new(|| re(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(int|float)\((.+)\)\s*$"));
static GO_ATOI: Lazy<Regex> = Lazy::new(|| {
    re(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*,\s*_\s*(:?=)\s*(strconv\.\w+\(.*\))\s*$")
});
static JS_PARSE: Lazy<Regex> = Lazy::new(|| {
    re(r"^\s*(const|let|var)\s+([A-Za-z_$][\w$]*)\s*=\s*parse(Int|Float)\((.+?)\);?\s*$")
});
static JAVA_PARSE: Lazy<Regex> = Lazy::new(|| {
    re(r"^\s*(int|long|double)\s+(\w+)\s*=\s*(Integer|Long|Double)\.parse(Int|Long|Double)\((.+)\);\s*$")
});

/// Make a failing string-to-number conversion handle bad input.
pub struct TypeConversion;

impl TypeConversion {
    fn rewrite(t: &Target<'_>) -> Option<String> {
        let (i, s) = (t.indent, t.step());
        match t.language {
            Language::Python => {
                let c = PY_CAST.captures(t.text)?;
                let (var, func, arg) = (&c[1], &c[2], &c[3]);
                let default = if func == "int" { "0" } else { "0.0" };
                Some(format!(
                    "{i}try:\n{i}{s}{var} = {func}({arg})\n{i}except (TypeError, ValueError):\n{i}{s}{var} = {default}"
                ))
            }
            Language::Go => {
                let c = GO_ATOI.captures(t.text)?;
                let (var, op, call) = (&c[1], &c[2], &c[3]);
                Some(format!(
                    "{i}{var}, err {op} {call}\n{i}if err != nil {{\n{i}{s}return err\n{i}}}"
                ))
            }
            Language::JavaScript => {
                let c = JS_PARSE.captures(t.text)?;
                let (kw, var, kind, arg) = (&c[1], &c[2], &c[3], &c[4]);
                let call = if kind == "Int" {
                    format!("Number.parseInt({arg}, 10)")
                } else {
                    format!("Number.parseFloat({arg})")
                };
                Some(format!(
                    "{i}{kw} {var} = {call};\n{i}if (Number.isNaN({var})) {{\n{i}{s}throw new TypeError(`not a number: ${{{arg}}}`);\n{i}}}"
                ))
            }
            Language::Java => {
                let c = JAVA_PARSE.captures(t.text)?;
                let (ty, var, class, kind, arg) = (&c[1], &c[2], &c[3], &c[4], &c[5]);
                Some(format!(
                    "{i}{ty} {var};\n{i}try {{\n{i}{s}{var} = {class}.parse{kind}({arg});\n{i}}} catch (NumberFormatException e) {{\n{i}{s}{var} = 0;\n{i}}}"
                ))
            }
            Language::Rust => {
                if t.text.contains(".parse") && t.text.contains(".unwrap()") {
                    Some(t.text.replacen(".unwrap()", ".unwrap_or_default()", 1))
                } else {
                    None
                }
            }
            Language::Other => None,
        }
    }
}

#[async_trait]
impl FixStrategy for TypeConversion {
    fn tag(&self) -> &str {
        "type_conversion"
    }

    fn priority(&self) -> u32 {
        50
    }

    async fn propose(&self, event: &ErrorEvent, deadline: Instant) -> Option<Proposal> {
        if expired(deadline) || !CONVERSION.is_match(&haystack(event)) {
            return None;
        }
        let t = Target::of(event)?;
        let rewritten = Self::rewrite(&t)?;
        Some(Proposal {
            changes: vec![CodeChange::modify(t.file, t.line, t.line, t.text, rewritten)
                .with_description("handle conversion failure")],
            confidence: 0.5,
            description: format!("handle a failed conversion at {}:{}", t.file, t.line),
        })
    }
}

// ---------------------------------------------------------------------------
// code_refactoring
// ---------------------------------------------------------------------------

/// Fallback: annotate the failing line for a human.
pub struct CodeRefactoring;

#[async_trait]
impl FixStrategy for CodeRefactoring {
    fn tag(&self) -> &str {
        "code_refactoring"
    }

    fn priority(&self) -> u32 {
        10
    }

    async fn propose(&self, event: &ErrorEvent, deadline: Instant) -> Option<Proposal> {
        if expired(deadline) {
            return None;
        }
        let t = Target::of(event)?;
        let note = format!(
            "{}{} FIXME(mender): {}",
            t.indent,
            t.language.comment(),
            normalize_message(&event.message)
        );
        Some(Proposal {
            changes: vec![CodeChange::add(t.file, t.line, note).with_description("annotate")],
            confidence: 0.1,
            description: format!("flag {}:{} for manual review", t.file, t.line),
        })
    }
}
