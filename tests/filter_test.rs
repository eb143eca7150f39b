// Filter language tests at the public surface
// Raw JSON records project straight into the value model

use reviewscope::filter::eval::Filter;
use reviewscope::filter::parse::parse;

fn record() -> serde_json::Value {
    serde_json::json!({
        "number": 4321,
        "subject": "runtime: reduce lock contention",
        "state": "open",
        "labels": ["performance", "runtime"],
        "owner": {"login": "gopher", "followers": 120},
        "draft": false,
    })
}

#[test]
fn json_records_are_filterable() {
    let rec = record();
    for (expr, want) in [
        ("number > 4000", true),
        ("number > 5000", false),
        (r#"subject:"lock""#, true),
        (r#"labels = "runtime""#, true),
        (r#"labels = "frontend""#, false),
        ("owner.followers >= 120", true),
        (r#"owner.login = "GOPHER""#, true),
        ("draft", false),
        ("-draft", true),
        (r#"state = open AND number < 9999"#, true),
    ] {
        let f = Filter::new(expr).unwrap();
        assert_eq!(f.matches(&rec), want, "{expr}");
    }
}

#[test]
fn evaluation_is_deterministic() {
    let rec = record();
    let f = Filter::new(r#"labels:("runtime" OR "gc") AND owner.followers > 100"#).unwrap();
    let first = f.matches(&rec);
    for _ in 0..50 {
        assert_eq!(f.matches(&rec), first);
    }
}

#[test]
fn print_parse_agrees_under_evaluation() {
    let rec = record();
    for expr in [
        "number > 4000",
        r#"subject:"lock" AND -draft"#,
        r#"labels = "runtime" OR owner.followers < 10"#,
        r#"(subject = "runtime*")"#,
        r#"subject = "runtime*""#,
        "NOT (draft OR number < 100)",
    ] {
        let once = Filter::new(expr).unwrap();
        let printed = parse(expr).unwrap().unwrap().to_string();
        let twice = Filter::new(&printed).unwrap();
        assert_eq!(
            once.matches(&rec),
            twice.matches(&rec),
            "{expr:?} vs reprinted {printed:?}"
        );
    }
}

#[test]
fn unknown_fields_warn_and_never_match() {
    let f = Filter::new("no_such_thing = 1").unwrap();
    assert!(!f.matches(&record()));
    assert_eq!(f.warnings().len(), 1);
}

#[test]
fn empty_filter_matches_with_no_warnings() {
    let f = Filter::new("   ").unwrap();
    assert!(f.matches(&record()));
    assert!(f.warnings().is_empty());
}
