// Filter expression parser
// Recursive descent over the lexer's tokens, producing the evaluator's AST

use std::fmt;

use crate::errors::{Error, Result};

use super::token::{lex, quote, TokKind, Token};

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    /// `:` — has/contains.
    Has,
    /// `=~` — regex match.
    Match,
    /// `!~` — regex non-match.
    NotMatch,
}

impl CmpOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Has => ":",
            CmpOp::Match => "=~",
            CmpOp::NotMatch => "!~",
        }
    }
}

/// A name or literal leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lit {
    pub text: String,
    /// Written as a double-quoted string.
    pub quoted: bool,
    /// Textually inside a parenthesized sub-expression; wildcard suffix
    /// and prefix interpretation is disabled for composite literals.
    pub composite: bool,
}

impl Lit {
    fn new(text: String, quoted: bool) -> Self {
        Lit {
            text,
            quoted,
            composite: false,
        }
    }
}

/// Filter expression AST.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Conjunction: explicit `AND` and implicit adjacency both land here.
    And(Vec<Expr>),
    Or(Vec<Expr>),
    /// `-` or `NOT`.
    Not(Box<Expr>),
    Cmp {
        lhs: Box<Expr>,
        op: CmpOp,
        rhs: Box<Expr>,
    },
    /// `base.name` member access.
    Member { base: Box<Expr>, name: Lit },
    /// `target(args...)` function application.
    Call { target: Box<Expr>, args: Vec<Expr> },
    Lit(Lit),
}

/// Parse a filter expression. An empty (or all-whitespace/comment) source
/// yields `None`, which matches every record.
pub fn parse(src: &str) -> Result<Option<Expr>> {
    let toks = lex(src)?;
    if toks.is_empty() {
        return Ok(None);
    }
    let mut p = Parser { toks, i: 0 };
    let expr = p.expression()?;
    if p.i != p.toks.len() {
        let tok = &p.toks[p.i];
        return Err(Error::filter(format!(
            "unexpected trailing input at offset {}",
            tok.pos
        )));
    }
    Ok(Some(expr))
}

struct Parser {
    toks: Vec<Token>,
    i: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.toks.get(self.i)
    }

    fn peek2(&self) -> Option<&Token> {
        self.toks.get(self.i + 1)
    }

    fn advance(&mut self) -> &Token {
        let t = &self.toks[self.i];
        self.i += 1;
        t
    }

    /// True when the next token is the given connective used as a keyword.
    /// `AND`/`OR`/`NOT` adjacent to a `.` are ordinary identifiers.
    fn at_keyword(&self, word: &str) -> bool {
        match self.peek() {
            Some(t) if t.is_word(word) => {
                !matches!(self.peek2().map(|t| t.kind), Some(TokKind::Dot))
            }
            _ => false,
        }
    }

    /// True when the next token can begin a term.
    fn at_term_start(&self) -> bool {
        match self.peek() {
            Some(t) => matches!(t.kind, TokKind::Text | TokKind::Minus | TokKind::LParen),
            None => false,
        }
    }

    // expression = sequence { "AND" sequence }
    fn expression(&mut self) -> Result<Expr> {
        let mut items = vec![self.sequence()?];
        while self.at_keyword("AND") {
            self.advance();
            items.push(self.sequence()?);
        }
        Ok(flatten_and(items))
    }

    // sequence = factor { factor } — implicit AND
    fn sequence(&mut self) -> Result<Expr> {
        let mut items = vec![self.factor()?];
        while self.at_term_start() && !self.at_keyword("AND") {
            items.push(self.factor()?);
        }
        Ok(flatten_and(items))
    }

    // factor = term { "OR" term }
    fn factor(&mut self) -> Result<Expr> {
        let mut items = vec![self.term()?];
        while self.at_keyword("OR") {
            self.advance();
            items.push(self.term()?);
        }
        if items.len() == 1 {
            Ok(items.pop().unwrap())
        } else {
            Ok(Expr::Or(items))
        }
    }

    // term = [ "-" | "NOT" ] primitive — unary is right-associative
    fn term(&mut self) -> Result<Expr> {
        if matches!(self.peek().map(|t| t.kind), Some(TokKind::Minus)) {
            self.advance();
            return Ok(Expr::Not(Box::new(self.term()?)));
        }
        if self.at_keyword("NOT") {
            self.advance();
            return Ok(Expr::Not(Box::new(self.term()?)));
        }
        self.primitive()
    }

    // primitive = "(" expression ")" | comparable [ op argument ]
    fn primitive(&mut self) -> Result<Expr> {
        if matches!(self.peek().map(|t| t.kind), Some(TokKind::LParen)) {
            let pos = self.advance().pos;
            let mut inner = self.expression()?;
            match self.peek().map(|t| t.kind) {
                Some(TokKind::RParen) => {
                    self.advance();
                }
                _ => {
                    return Err(Error::filter(format!(
                        "missing ')' for group opened at offset {pos}"
                    )));
                }
            }
            mark_composite(&mut inner);
            return Ok(inner);
        }

        let lhs = self.comparable()?;
        let op = match self.peek().map(|t| t.kind) {
            Some(TokKind::Lt) => Some(CmpOp::Lt),
            Some(TokKind::Le) => Some(CmpOp::Le),
            Some(TokKind::Gt) => Some(CmpOp::Gt),
            Some(TokKind::Ge) => Some(CmpOp::Ge),
            Some(TokKind::Eq) => Some(CmpOp::Eq),
            Some(TokKind::Ne) => Some(CmpOp::Ne),
            Some(TokKind::Has) => Some(CmpOp::Has),
            Some(TokKind::Match) => Some(CmpOp::Match),
            Some(TokKind::NotMatch) => Some(CmpOp::NotMatch),
            _ => None,
        };
        let Some(op) = op else {
            return Ok(lhs);
        };
        let pos = self.advance().pos;
        if !self.at_term_start() {
            return Err(Error::filter(format!(
                "missing operand after operator at offset {pos}"
            )));
        }
        let rhs = self.term()?;
        if matches!(op, CmpOp::Match | CmpOp::NotMatch) {
            check_regex_operand(&rhs)?;
        }
        Ok(Expr::Cmp {
            lhs: Box::new(lhs),
            op,
            rhs: Box::new(rhs),
        })
    }

    // comparable = identifier { "." identifier } [ "(" args ")" ]
    fn comparable(&mut self) -> Result<Expr> {
        let tok = match self.peek() {
            Some(t) if t.kind == TokKind::Text => self.advance().clone(),
            Some(t) => {
                return Err(Error::filter(format!(
                    "expected a value at offset {}",
                    t.pos
                )));
            }
            None => return Err(Error::filter("unexpected end of filter")),
        };
        let mut expr = Expr::Lit(Lit::new(tok.text, tok.quoted));

        while matches!(self.peek().map(|t| t.kind), Some(TokKind::Dot)) {
            let pos = self.advance().pos;
            match self.peek() {
                Some(t) if t.kind == TokKind::Text => {
                    let name = self.advance();
                    expr = Expr::Member {
                        base: Box::new(expr),
                        name: Lit::new(name.text.clone(), name.quoted),
                    };
                }
                _ => {
                    return Err(Error::filter(format!(
                        "expected a member name after '.' at offset {pos}"
                    )));
                }
            }
        }

        if matches!(self.peek().map(|t| t.kind), Some(TokKind::LParen)) {
            self.advance();
            let mut args = Vec::new();
            if !matches!(self.peek().map(|t| t.kind), Some(TokKind::RParen)) {
                loop {
                    args.push(self.term()?);
                    if matches!(self.peek().map(|t| t.kind), Some(TokKind::Comma)) {
                        self.advance();
                        continue;
                    }
                    break;
                }
            }
            match self.peek().map(|t| t.kind) {
                Some(TokKind::RParen) => {
                    self.advance();
                }
                _ => return Err(Error::filter("missing ')' after function arguments")),
            }
            expr = Expr::Call {
                target: Box::new(expr),
                args,
            };
        }

        Ok(expr)
    }
}

fn flatten_and(mut items: Vec<Expr>) -> Expr {
    if items.len() == 1 {
        return items.pop().unwrap();
    }
    let mut flat = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Expr::And(inner) => flat.extend(inner),
            other => flat.push(other),
        }
    }
    Expr::And(flat)
}

/// Mark every literal under `expr` as composite. Applied to parenthesized
/// sub-trees after parsing.
fn mark_composite(expr: &mut Expr) {
    match expr {
        Expr::And(items) | Expr::Or(items) => items.iter_mut().for_each(mark_composite),
        Expr::Not(inner) => mark_composite(inner),
        Expr::Cmp { lhs, rhs, .. } => {
            mark_composite(lhs);
            mark_composite(rhs);
        }
        Expr::Member { base, name } => {
            mark_composite(base);
            name.composite = true;
        }
        Expr::Call { target, args } => {
            mark_composite(target);
            args.iter_mut().for_each(mark_composite);
        }
        Expr::Lit(lit) => lit.composite = true,
    }
}

/// Regex operands must be quoted strings, possibly combined with
/// AND/OR/NOT. Anything else is a parse error.
fn check_regex_operand(expr: &Expr) -> Result<()> {
    match expr {
        Expr::And(items) | Expr::Or(items) => items.iter().try_for_each(check_regex_operand),
        Expr::Not(inner) => check_regex_operand(inner),
        Expr::Lit(lit) if lit.quoted => Ok(()),
        _ => Err(Error::filter(
            "regex operand must be a double-quoted string",
        )),
    }
}

// ---------------------------------------------------------------------------
// Printer
// ---------------------------------------------------------------------------

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_expr(f, true)
    }
}

impl Expr {
    /// True when any literal in the subtree is marked composite, i.e. the
    /// subtree was written inside parentheses.
    fn is_composite(&self) -> bool {
        match self {
            Expr::And(items) | Expr::Or(items) => items.iter().any(Expr::is_composite),
            Expr::Not(inner) => inner.is_composite(),
            Expr::Cmp { lhs, rhs, .. } => lhs.is_composite() || rhs.is_composite(),
            Expr::Member { base, name } => name.composite || base.is_composite(),
            Expr::Call { target, args } => {
                target.is_composite() || args.iter().any(Expr::is_composite)
            }
            Expr::Lit(lit) => lit.composite,
        }
    }

    /// Print the expression. When `wrap` is set, a composite comparison or
    /// leaf is re-wrapped in parentheses so that reparsing restores the
    /// composite marking (which governs wildcard interpretation).
    fn fmt_expr(&self, f: &mut fmt::Formatter<'_>, wrap: bool) -> fmt::Result {
        if wrap
            && self.is_composite()
            && matches!(
                self,
                Expr::Cmp { .. } | Expr::Lit(_) | Expr::Member { .. } | Expr::Call { .. }
            )
        {
            write!(f, "(")?;
            self.fmt_expr(f, false)?;
            return write!(f, ")");
        }
        match self {
            Expr::And(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " AND ")?;
                    }
                    item.fmt_expr(f, true)?;
                }
                Ok(())
            }
            Expr::Or(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " OR ")?;
                    }
                    // An AND under an OR can only have come from an
                    // explicit group; re-printing the parentheses is
                    // faithful because its literals are composite.
                    match item {
                        Expr::And(_) => {
                            write!(f, "(")?;
                            item.fmt_expr(f, false)?;
                            write!(f, ")")?;
                        }
                        _ => item.fmt_expr(f, true)?,
                    }
                }
                Ok(())
            }
            Expr::Not(inner) => match inner.as_ref() {
                Expr::And(_) | Expr::Or(_) => {
                    write!(f, "-(")?;
                    inner.fmt_expr(f, false)?;
                    write!(f, ")")
                }
                _ => {
                    write!(f, "-")?;
                    inner.fmt_expr(f, true)
                }
            },
            Expr::Cmp { lhs, op, rhs } => {
                lhs.fmt_expr(f, false)?;
                write!(f, "{}", op.symbol())?;
                match rhs.as_ref() {
                    Expr::And(_) | Expr::Or(_) => {
                        write!(f, "(")?;
                        rhs.fmt_expr(f, false)?;
                        write!(f, ")")
                    }
                    _ => rhs.fmt_expr(f, false),
                }
            }
            Expr::Member { base, name } => {
                base.fmt_expr(f, false)?;
                write!(f, ".")?;
                write_lit(f, name)
            }
            Expr::Call { target, args } => {
                target.fmt_expr(f, false)?;
                write!(f, "(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    arg.fmt_expr(f, false)?;
                }
                write!(f, ")")
            }
            Expr::Lit(lit) => write_lit(f, lit),
        }
    }
}

fn write_lit(f: &mut fmt::Formatter<'_>, lit: &Lit) -> fmt::Result {
    if lit.quoted {
        write!(f, "{}", quote(&lit.text))
    } else {
        write!(f, "{}", lit.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(src: &str) -> Expr {
        parse(src).unwrap().unwrap()
    }

    fn lit(text: &str) -> Expr {
        Expr::Lit(Lit::new(text.to_string(), false))
    }

    fn qlit(text: &str) -> Expr {
        Expr::Lit(Lit::new(text.to_string(), true))
    }

    #[test]
    fn empty_filter_is_none() {
        assert_eq!(parse("").unwrap(), None);
        assert_eq!(parse("   -- only a comment").unwrap(), None);
    }

    #[test]
    fn conjunction_of_comparisons() {
        // The canonical conjunction: a > 3 AND b:"x"
        let e = p(r#"a > 3 AND b:"x""#);
        match e {
            Expr::And(items) => {
                assert_eq!(items.len(), 2);
                assert_eq!(
                    items[0],
                    Expr::Cmp {
                        lhs: Box::new(lit("a")),
                        op: CmpOp::Gt,
                        rhs: Box::new(lit("3")),
                    }
                );
                assert_eq!(
                    items[1],
                    Expr::Cmp {
                        lhs: Box::new(lit("b")),
                        op: CmpOp::Has,
                        rhs: Box::new(qlit("x")),
                    }
                );
            }
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn implicit_and_flattens_with_explicit() {
        let e = p("a b AND c");
        match e {
            Expr::And(items) => assert_eq!(items.len(), 3),
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn or_binds_tighter_than_and() {
        let e = p("a AND b OR c");
        match e {
            Expr::And(items) => {
                assert_eq!(items[0], lit("a"));
                assert!(matches!(items[1], Expr::Or(_)));
            }
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn member_chain_nests_left() {
        let e = p("a.b.c");
        match e {
            Expr::Member { base, name } => {
                assert_eq!(name.text, "c");
                assert!(matches!(*base, Expr::Member { .. }));
            }
            other => panic!("expected Member, got {other:?}"),
        }
    }

    #[test]
    fn unary_forms() {
        assert!(matches!(p("-a"), Expr::Not(_)));
        assert!(matches!(p("NOT a"), Expr::Not(_)));
        // Right-associative stacking.
        match p("NOT -a") {
            Expr::Not(inner) => assert!(matches!(*inner, Expr::Not(_))),
            other => panic!("expected Not, got {other:?}"),
        }
    }

    #[test]
    fn keywords_adjacent_to_dot_are_identifiers() {
        let e = p("x.AND");
        match e {
            Expr::Member { name, .. } => assert_eq!(name.text, "AND"),
            other => panic!("expected Member, got {other:?}"),
        }
        // AND.y is a comparable starting with the identifier AND.
        let e = p("a AND.y");
        match e {
            Expr::And(items) => {
                assert!(matches!(&items[1], Expr::Member { name, .. } if name.text == "y"));
            }
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn parenthesized_literals_become_composite() {
        let e = p(r#"(a = "foo*")"#);
        match e {
            Expr::Cmp { lhs, rhs, .. } => {
                match (*lhs, *rhs) {
                    (Expr::Lit(l), Expr::Lit(r)) => {
                        assert!(l.composite);
                        assert!(r.composite);
                    }
                    other => panic!("expected literals, got {other:?}"),
                }
            }
            other => panic!("expected Cmp, got {other:?}"),
        }
        // Outside parens, literals stay plain.
        match p(r#"a = "foo*""#) {
            Expr::Cmp { rhs, .. } => match *rhs {
                Expr::Lit(r) => assert!(!r.composite),
                other => panic!("expected literal, got {other:?}"),
            },
            other => panic!("expected Cmp, got {other:?}"),
        }
    }

    #[test]
    fn regex_operand_must_be_quoted() {
        assert!(parse(r#"s =~ "^foo""#).is_ok());
        assert!(parse(r#"s =~ ("a" OR "b")"#).is_ok());
        assert!(parse("s =~ foo").is_err());
        assert!(parse(r#"s !~ bar"#).is_err());
    }

    #[test]
    fn function_call_args() {
        let e = p("older_than(5)");
        match e {
            Expr::Call { target, args } => {
                assert_eq!(*target, lit("older_than"));
                assert_eq!(args.len(), 1);
            }
            other => panic!("expected Call, got {other:?}"),
        }
    }

    #[test]
    fn comparison_rhs_may_be_group() {
        let e = p(r#"tags:("a" OR "b")"#);
        match e {
            Expr::Cmp { op, rhs, .. } => {
                assert_eq!(op, CmpOp::Has);
                assert!(matches!(*rhs, Expr::Or(_)));
            }
            other => panic!("expected Cmp, got {other:?}"),
        }
    }

    #[test]
    fn errors() {
        assert!(parse("(a").is_err());
        assert!(parse("a >").is_err());
        assert!(parse("a.").is_err());
        assert!(parse(") a").is_err());
    }

    #[test]
    fn print_parse_roundtrip_structure() {
        for src in [
            r#"a > 3 AND b:"x""#,
            "a b c",
            "a AND b OR c",
            "-a.b.c",
            r#"s =~ "^foo[0-9]+$""#,
            r#"(status = open) AND -archived"#,
            r#"tags:("a" OR "b")"#,
            r#"(a = "foo*")"#,
            "f(x,y) = 3",
        ] {
            let once = p(src);
            let printed = once.to_string();
            let twice = parse(&printed)
                .unwrap_or_else(|e| panic!("reparse of {printed:?}: {e}"))
                .unwrap();
            assert_eq!(
                printed,
                twice.to_string(),
                "printer not a fixed point for {src:?}"
            );
        }
    }

    #[test]
    fn composite_marking_survives_roundtrip() {
        // Wildcard interpretation is keyed off the composite flag, so the
        // printer must re-wrap composite comparisons in parentheses.
        let once = p(r#"(a = "foo*")"#);
        let twice = parse(&once.to_string()).unwrap().unwrap();
        match twice {
            Expr::Cmp { rhs, .. } => match *rhs {
                Expr::Lit(l) => assert!(l.composite),
                other => panic!("expected literal, got {other:?}"),
            },
            other => panic!("expected Cmp, got {other:?}"),
        }
    }
}
