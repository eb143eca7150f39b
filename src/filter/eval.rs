// Filter evaluator
// Compiles a parsed expression into a predicate over the value model

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;

use crate::errors::Result;

use super::parse::{parse, CmpOp, Expr, Lit};
use super::value::{lookup_field, Project, Value};

/// A free function callable from filter expressions. Receives the value it
/// was resolved against plus the textual arguments from the call site.
pub type Func = Arc<dyn Fn(&Value, &[String]) -> Value + Send + Sync>;

/// Name → function map supplied at compile time.
pub type Functions = HashMap<String, Func>;

/// Recursion guard for the standalone-identifier deep search.
const MAX_SEARCH_DEPTH: usize = 32;

type Prog = Arc<dyn Fn(&Value, &Diags) -> bool + Send + Sync>;

/// A compiled filter expression.
///
/// Compilation happens once; evaluation is a pure function of the record
/// and the function map. The evaluator never fails: type mismatches,
/// unknown names, and bad regexes produce a diagnostic and make the
/// offending subexpression evaluate to false.
pub struct Filter {
    src: String,
    expr: Option<Expr>,
    prog: Prog,
    diags: Arc<Diags>,
}

impl Filter {
    /// Compile `src` with no free functions.
    pub fn new(src: &str) -> Result<Filter> {
        Self::with_functions(src, Functions::new())
    }

    /// Compile `src` against a function map.
    pub fn with_functions(src: &str, funcs: Functions) -> Result<Filter> {
        let expr = parse(src)?;
        let diags = Arc::new(Diags::default());
        let funcs = Arc::new(funcs);
        let prog: Prog = match &expr {
            None => Arc::new(|_, _| true),
            Some(e) => compile(e, &funcs, &diags),
        };
        Ok(Filter {
            src: src.to_string(),
            expr,
            prog,
            diags,
        })
    }

    /// The source text this filter was compiled from.
    pub fn source(&self) -> &str {
        &self.src
    }

    /// The parsed expression, if the filter is non-empty.
    pub fn expr(&self) -> Option<&Expr> {
        self.expr.as_ref()
    }

    /// Evaluate against an already-projected value.
    pub fn matches_value(&self, value: &Value) -> bool {
        (self.prog)(value, &self.diags)
    }

    /// Evaluate against any projectable record.
    pub fn matches<T: Project + ?Sized>(&self, record: &T) -> bool {
        self.matches_value(&record.project())
    }

    /// Diagnostics accumulated so far, deduplicated, in first-seen order.
    pub fn warnings(&self) -> Vec<String> {
        self.diags.list()
    }
}

/// Deduplicated diagnostic sink shared by compile and eval time.
#[derive(Default)]
pub struct Diags {
    msgs: Mutex<Vec<String>>,
}

impl Diags {
    fn add(&self, msg: String) {
        let mut msgs = self.msgs.lock().unwrap();
        if !msgs.contains(&msg) {
            msgs.push(msg);
        }
    }

    fn list(&self) -> Vec<String> {
        self.msgs.lock().unwrap().clone()
    }
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

fn compile(expr: &Expr, funcs: &Arc<Functions>, diags: &Arc<Diags>) -> Prog {
    match expr {
        Expr::And(items) => {
            let progs: Vec<Prog> = items.iter().map(|e| compile(e, funcs, diags)).collect();
            Arc::new(move |v, d| progs.iter().all(|p| p(v, d)))
        }
        Expr::Or(items) => {
            let progs: Vec<Prog> = items.iter().map(|e| compile(e, funcs, diags)).collect();
            Arc::new(move |v, d| progs.iter().any(|p| p(v, d)))
        }
        Expr::Not(inner) => {
            let prog = compile(inner, funcs, diags);
            Arc::new(move |v, d| !prog(v, d))
        }
        Expr::Cmp { lhs, op, rhs } => compile_cmp(lhs, *op, rhs, funcs, diags),
        other => compile_bare(other, funcs, diags),
    }
}

/// A path step: a member name or a function call.
#[derive(Clone)]
enum Step {
    Field(Lit),
    Call { name: Lit, args: Vec<String> },
}

/// Flatten a comparable into path steps, left to right.
fn path_of(expr: &Expr) -> Option<Vec<Step>> {
    match expr {
        Expr::Lit(l) => Some(vec![Step::Field(l.clone())]),
        Expr::Member { base, name } => {
            let mut steps = path_of(base)?;
            steps.push(Step::Field(name.clone()));
            Some(steps)
        }
        Expr::Call { target, args } => {
            let mut steps = path_of(target)?;
            let name = match steps.pop()? {
                Step::Field(l) => l,
                Step::Call { .. } => return None,
            };
            let args = args.iter().map(|a| a.to_string()).collect();
            steps.push(Step::Call { name, args });
            Some(steps)
        }
        _ => None,
    }
}

/// Render a comparable on the right of an operator as its literal dotted
/// text. `a.b.c` on the right is deliberately the string `"a.b.c"`.
fn rhs_literal(expr: &Expr) -> Option<Lit> {
    fn collect(expr: &Expr, out: &mut Vec<String>) -> Option<(bool, bool)> {
        match expr {
            Expr::Lit(l) => {
                out.push(l.text.clone());
                Some((l.quoted, l.composite))
            }
            Expr::Member { base, name } => {
                collect(base, out)?;
                out.push(name.text.clone());
                Some((false, name.composite))
            }
            _ => None,
        }
    }
    let mut parts = Vec::new();
    let (quoted, composite) = collect(expr, &mut parts)?;
    Some(Lit {
        quoted: quoted && parts.len() == 1,
        composite,
        text: parts.join("."),
    })
}

/// A compiled comparison literal.
struct Leaf {
    op: CmpOp,
    text: String,
    composite: bool,
    regex: Option<Regex>,
}

type Matcher = Arc<dyn Fn(&Value, &Diags) -> bool + Send + Sync>;

/// Compile the right-hand side of a comparison into a matcher applied to
/// the resolved left-hand value.
fn compile_rhs(expr: &Expr, op: CmpOp, diags: &Arc<Diags>) -> Matcher {
    match expr {
        Expr::And(items) => {
            let ms: Vec<Matcher> = items.iter().map(|e| compile_rhs(e, op, diags)).collect();
            Arc::new(move |v, d| ms.iter().all(|m| m(v, d)))
        }
        Expr::Or(items) => {
            let ms: Vec<Matcher> = items.iter().map(|e| compile_rhs(e, op, diags)).collect();
            Arc::new(move |v, d| ms.iter().any(|m| m(v, d)))
        }
        Expr::Not(inner) => {
            let m = compile_rhs(inner, op, diags);
            Arc::new(move |v, d| !m(v, d))
        }
        Expr::Cmp { op: inner_op, .. } => {
            // Comparisons may not nest on the right.
            diags.add(format!(
                "comparison ({}) on the right-hand side of {}",
                inner_op.symbol(),
                op.symbol()
            ));
            Arc::new(|_, _| false)
        }
        other => match rhs_literal(other) {
            Some(lit) => {
                let regex = match op {
                    CmpOp::Match | CmpOp::NotMatch => match Regex::new(&lit.text) {
                        Ok(re) => Some(re),
                        Err(err) => {
                            diags.add(format!("bad regex {:?}: {err}", lit.text));
                            return Arc::new(|_, _| false);
                        }
                    },
                    _ => None,
                };
                let leaf = Arc::new(Leaf {
                    op,
                    text: lit.text,
                    composite: lit.composite,
                    regex,
                });
                Arc::new(move |v, d| compare_value(v, &leaf, d, 0))
            }
            None => {
                diags.add(format!(
                    "unsupported operand on the right-hand side of {}",
                    op.symbol()
                ));
                Arc::new(|_, _| false)
            }
        },
    }
}

fn compile_cmp(
    lhs: &Expr,
    op: CmpOp,
    rhs: &Expr,
    funcs: &Arc<Functions>,
    diags: &Arc<Diags>,
) -> Prog {
    let Some(steps) = path_of(lhs) else {
        diags.add("left-hand side of a comparison must be a field path".to_string());
        return Arc::new(|_, _| false);
    };
    let matcher = compile_rhs(rhs, op, diags);
    let funcs = Arc::clone(funcs);
    Arc::new(move |record, d| {
        let resolved = resolve_path(record, &steps, &funcs, d);
        matcher(&resolved, d)
    })
}

fn compile_bare(expr: &Expr, funcs: &Arc<Functions>, diags: &Arc<Diags>) -> Prog {
    let Some(steps) = path_of(expr) else {
        diags.add("unsupported bare term".to_string());
        return Arc::new(|_, _| false);
    };
    let needle = expr.to_string();
    let funcs = Arc::clone(funcs);
    Arc::new(move |record, d| {
        // A path that resolves to a boolean is used directly; anything
        // else hunts the literal text across the whole record.
        if let Some(Value::Bool(b)) = try_resolve_path(record, &steps, &funcs) {
            return b;
        }
        search_value(record, &needle, 0)
    })
}

// ---------------------------------------------------------------------------
// Path resolution
// ---------------------------------------------------------------------------

/// Resolve one step against a value. Lists resolve element-wise, keeping
/// the multi-valued shape for the comparison walk.
fn resolve_step(value: &Value, step: &Step, funcs: &Functions, diags: Option<&Diags>) -> Value {
    match value {
        Value::List(items) => Value::List(
            items
                .iter()
                .map(|item| resolve_step(item, step, funcs, diags))
                .collect(),
        ),
        Value::Record(fields) | Value::Map(fields) => {
            let (name, args): (&Lit, &[String]) = match step {
                Step::Field(l) => (l, &[]),
                Step::Call { name, args } => (name, args),
            };
            if let Some(found) = lookup_field(fields, &name.text) {
                return match step {
                    Step::Field(_) => found.clone(),
                    Step::Call { .. } => found.clone(),
                };
            }
            if let Some(func) = funcs.get(&name.text) {
                return func(value, args);
            }
            if name.quoted {
                return Value::Str(name.text.clone());
            }
            if let Some(d) = diags {
                d.add(format!("unknown name {:?}", name.text));
            }
            Value::Invalid
        }
        // Pseudo-field: the seconds of an elapsed time, as a float.
        Value::Duration(nanos) => match step {
            Step::Field(l) if l.text.eq_ignore_ascii_case("seconds") => {
                Value::Float(*nanos as f64 / 1e9)
            }
            Step::Field(l) => {
                if let Some(d) = diags {
                    d.add(format!("unknown name {:?}", l.text));
                }
                Value::Invalid
            }
            Step::Call { name, args } => funcs
                .get(&name.text)
                .map(|f| f(value, args))
                .unwrap_or(Value::Invalid),
        },
        Value::Invalid => Value::Invalid,
        _ => {
            let name = match step {
                Step::Field(l) | Step::Call { name: l, .. } => l,
            };
            if let Some(func) = funcs.get(&name.text) {
                let args: &[String] = match step {
                    Step::Call { args, .. } => args,
                    Step::Field(_) => &[],
                };
                return func(value, args);
            }
            if name.quoted {
                return Value::Str(name.text.clone());
            }
            if let Some(d) = diags {
                d.add(format!(
                    "cannot select {:?} from a non-record value",
                    name.text
                ));
            }
            Value::Invalid
        }
    }
}

fn resolve_path(record: &Value, steps: &[Step], funcs: &Functions, diags: &Diags) -> Value {
    let mut v = record.clone();
    for step in steps {
        v = resolve_step(&v, step, funcs, Some(diags));
    }
    v
}

/// Like `resolve_path` but silent; used by bare terms where a failed
/// resolution falls back to a literal hunt rather than a warning.
fn try_resolve_path(record: &Value, steps: &[Step], funcs: &Functions) -> Option<Value> {
    let mut v = record.clone();
    for step in steps {
        v = resolve_step(&v, step, funcs, None);
        if matches!(v, Value::Invalid) {
            return None;
        }
    }
    Some(v)
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

/// Apply a compiled leaf comparison to a resolved value, walking
/// multi-valued shapes with any-match semantics.
fn compare_value(value: &Value, leaf: &Leaf, diags: &Diags, depth: usize) -> bool {
    if depth > MAX_SEARCH_DEPTH {
        return false;
    }
    match value {
        Value::Invalid => false,
        Value::List(items) => {
            // Equality with a repeated field redirects to has-any; its
            // negation inverts the redirected result.
            match leaf.op {
                CmpOp::Eq => items.iter().any(|item| {
                    compare_value(item, &leaf.with_op(CmpOp::Has), diags, depth + 1)
                }),
                CmpOp::Ne => !items.iter().any(|item| {
                    compare_value(item, &leaf.with_op(CmpOp::Has), diags, depth + 1)
                }),
                _ => items
                    .iter()
                    .any(|item| compare_value(item, leaf, diags, depth + 1)),
            }
        }
        Value::Map(fields) => fields
            .iter()
            .any(|(_, v)| compare_value(v, leaf, diags, depth + 1)),
        Value::Record(fields) => match leaf.op {
            // has on a struct: any field value matches.
            CmpOp::Has => fields
                .iter()
                .any(|(_, v)| compare_value(v, leaf, diags, depth + 1)),
            _ => {
                diags.add(format!(
                    "cannot compare a record with {:?}",
                    leaf.text
                ));
                false
            }
        },
        scalar => compare_scalar(scalar, leaf, diags),
    }
}

impl Leaf {
    fn with_op(&self, op: CmpOp) -> Leaf {
        Leaf {
            op,
            text: self.text.clone(),
            composite: self.composite,
            regex: self.regex.clone(),
        }
    }
}

fn compare_scalar(value: &Value, leaf: &Leaf, diags: &Diags) -> bool {
    let op = leaf.op;
    match value {
        Value::Str(s) => compare_string(s, leaf, diags),
        Value::Bool(b) => match parse_bool(&leaf.text) {
            Some(rhs) => ordered(op, bool_rank(*b).cmp(&bool_rank(rhs))),
            None => {
                diags.add(format!("cannot compare a boolean with {:?}", leaf.text));
                false
            }
        },
        Value::Int(n) => compare_int(*n, leaf, diags),
        Value::Uint(n) => {
            if let Ok(rhs) = leaf.text.parse::<u64>() {
                return ordered(op, n.cmp(&rhs));
            }
            compare_int(i64::try_from(*n).unwrap_or(i64::MAX), leaf, diags)
        }
        Value::Float(f) => match leaf.text.parse::<f64>() {
            Ok(rhs) => compare_float(op, *f, rhs),
            Err(_) => {
                diags.add(format!("cannot compare a number with {:?}", leaf.text));
                false
            }
        },
        Value::Time(t) => match parse_time_literal(&leaf.text) {
            Some(rhs) => ordered(op, t.cmp(&rhs)),
            None => {
                diags.add(format!("cannot parse {:?} as a time", leaf.text));
                false
            }
        },
        Value::Duration(nanos) => match parse_duration_literal(&leaf.text) {
            Some(rhs) => ordered(op, nanos.cmp(&rhs)),
            None => {
                diags.add(format!("cannot parse {:?} as a duration", leaf.text));
                false
            }
        },
        // Handled by compare_value.
        Value::Invalid | Value::List(_) | Value::Map(_) | Value::Record(_) => false,
    }
}

fn compare_int(n: i64, leaf: &Leaf, diags: &Diags) -> bool {
    let op = leaf.op;
    if let Ok(rhs) = leaf.text.parse::<i64>() {
        return ordered(op, n.cmp(&rhs));
    }
    // An integer field compared against a literal with an s suffix is an
    // elapsed time in nanoseconds.
    if let Some(rhs) = parse_duration_literal(&leaf.text) {
        return ordered(op, n.cmp(&rhs));
    }
    if let Ok(rhs) = leaf.text.parse::<f64>() {
        return compare_float(op, n as f64, rhs);
    }
    diags.add(format!("cannot compare a number with {:?}", leaf.text));
    false
}

fn compare_float(op: CmpOp, lhs: f64, rhs: f64) -> bool {
    if lhs.is_nan() || rhs.is_nan() {
        // NaN equals NaN and compares false with everything else,
        // including via !=.
        return matches!(op, CmpOp::Eq) && lhs.is_nan() && rhs.is_nan();
    }
    match lhs.partial_cmp(&rhs) {
        Some(ord) => ordered(op, ord),
        None => false,
    }
}

fn bool_rank(b: bool) -> u8 {
    // true > false
    b as u8
}

fn parse_bool(s: &str) -> Option<bool> {
    if s.eq_ignore_ascii_case("true") {
        Some(true)
    } else if s.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

fn ordered(op: CmpOp, ord: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match op {
        CmpOp::Lt => ord == Less,
        CmpOp::Le => ord != Greater,
        CmpOp::Gt => ord == Greater,
        CmpOp::Ge => ord != Less,
        CmpOp::Eq | CmpOp::Has => ord == Equal,
        CmpOp::Ne => ord != Equal,
        CmpOp::Match | CmpOp::NotMatch => false,
    }
}

// --- string comparison ---

fn compare_string(s: &str, leaf: &Leaf, diags: &Diags) -> bool {
    match leaf.op {
        CmpOp::Match => match &leaf.regex {
            Some(re) => re.is_match(s),
            None => false,
        },
        CmpOp::NotMatch => match &leaf.regex {
            Some(re) => !re.is_match(s),
            None => false,
        },
        CmpOp::Eq => eq_string(s, &leaf.text, leaf.composite),
        CmpOp::Ne => !eq_string(s, &leaf.text, leaf.composite),
        CmpOp::Has => has_string(s, &leaf.text, leaf.composite),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let _ = diags;
            ordered(leaf.op, fold(s).cmp(&fold(&leaf.text)))
        }
    }
}

fn fold(s: &str) -> String {
    s.to_lowercase()
}

/// Case-insensitive string equality with wildcard affixes. A leading `*`
/// is a suffix match and a trailing `*` a prefix match; both are disabled
/// for composite literals.
fn eq_string(s: &str, lit: &str, composite: bool) -> bool {
    let s = fold(s);
    if !composite {
        if let Some(rest) = lit.strip_prefix('*') {
            return s.ends_with(&fold(rest));
        }
        if let Some(rest) = lit.strip_suffix('*') {
            return s.starts_with(&fold(rest));
        }
    }
    s == fold(lit)
}

/// The has/contains operator on strings: equality, whole-word containment,
/// or equality against any word of the field.
fn has_string(s: &str, lit: &str, composite: bool) -> bool {
    if !composite && (lit.starts_with('*') || lit.ends_with('*')) {
        return eq_string(s, lit, composite);
    }
    let s = fold(s);
    let lit = fold(lit);
    if s == lit {
        return true;
    }
    if lit.is_empty() {
        return true;
    }
    if contains_word(&s, &lit) {
        return true;
    }
    let found = words(&s).any(|w| w == lit);
    found
}

/// True when `needle` occurs in `hay` bounded by non-alphanumerics.
fn contains_word(hay: &str, needle: &str) -> bool {
    let mut start = 0;
    while let Some(found) = hay[start..].find(needle) {
        let at = start + found;
        let end = at + needle.len();
        let before_ok = at == 0
            || hay[..at]
                .chars()
                .next_back()
                .map(|c| !c.is_alphanumeric())
                .unwrap_or(true);
        let after_ok = end == hay.len()
            || hay[end..]
                .chars()
                .next()
                .map(|c| !c.is_alphanumeric())
                .unwrap_or(true);
        if before_ok && after_ok {
            return true;
        }
        start = at + needle.len().max(1);
        if start >= hay.len() {
            break;
        }
    }
    false
}

fn words(s: &str) -> impl Iterator<Item = &str> {
    s.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty())
}

// --- time and duration literals ---

/// Parse a time literal: RFC 3339 first, then a cascade of looser formats.
pub(crate) fn parse_time_literal(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(Utc.from_utc_datetime(&t));
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?));
    }
    if let Ok(d) = NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?));
    }
    if let Ok(year) = s.parse::<i32>() {
        if (1000..=9999).contains(&year) {
            let d = NaiveDate::from_ymd_opt(year, 1, 1)?;
            return Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?));
        }
    }
    for fmt in ["%B %d %Y", "%b %d %Y", "%B %e %Y", "%b %e %Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?));
        }
    }
    for fmt in ["%B %Y %d", "%b %Y %d"] {
        if let Ok(d) = NaiveDate::parse_from_str(&format!("{s} 1"), fmt) {
            return Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?));
        }
    }
    None
}

/// Parse a duration literal (`"5s"`, `"1.5s"`) into nanoseconds.
pub(crate) fn parse_duration_literal(s: &str) -> Option<i64> {
    let body = s.strip_suffix(['s', 'S'])?;
    let secs: f64 = body.parse().ok()?;
    Some((secs * 1e9) as i64)
}

// ---------------------------------------------------------------------------
// Standalone identifier deep search
// ---------------------------------------------------------------------------

/// Hunt for the literal anywhere in the value: any field, element, or
/// computed result equal to or case-insensitively containing it.
fn search_value(value: &Value, needle: &str, depth: usize) -> bool {
    if depth > MAX_SEARCH_DEPTH {
        return false;
    }
    match value {
        Value::Invalid => false,
        Value::Str(s) => {
            let s = fold(s);
            let needle = fold(needle);
            s == needle || s.contains(&needle)
        }
        Value::Bool(b) => needle.eq_ignore_ascii_case(if *b { "true" } else { "false" }),
        Value::Int(n) => n.to_string() == needle,
        Value::Uint(n) => n.to_string() == needle,
        Value::Float(f) => f.to_string() == needle,
        Value::Time(t) => t.to_rfc3339().starts_with(needle),
        Value::Duration(_) => false,
        Value::List(items) => items.iter().any(|v| search_value(v, needle, depth + 1)),
        Value::Map(fields) | Value::Record(fields) => fields
            .iter()
            .any(|(_, v)| search_value(v, needle, depth + 1)),
    }
}
