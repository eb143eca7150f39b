// Dashboard query surface
// Category definitions and filter application over scored changes

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::filter::eval::{Filter, Functions};
use crate::filter::value::Value;
use crate::preds::ChangePreds;
use crate::review::change::{project_change, Change};

/// Name of the implicit bucket collecting unmatched changes.
pub const REMAINDER: &str = "Remainder";

/// One dashboard category: a name, a doc line, and the filter expression
/// selecting its changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Category {
    pub name: String,
    #[serde(default)]
    pub doc: String,
    pub filter: String,
}

/// Parse the JSON category list: `[{name, doc, filter}, ...]`.
pub fn parse_categories(json: &str) -> Result<Vec<Category>> {
    serde_json::from_str(json)
        .map_err(|err| Error::filter(format!("bad category definitions: {err}")))
}

/// A category's slice of the dashboard.
pub struct CategoryRows {
    pub name: String,
    pub doc: String,
    pub rows: Vec<ChangePreds>,
}

/// Project a scored change for filtering: the change projection plus the
/// applied predicate names and the total score.
pub fn project_row(row: &ChangePreds) -> Value {
    let mut fields = match project_change(row.change.as_ref()) {
        Value::Record(fields) => fields,
        other => return other,
    };
    fields.push((
        "preds".to_string(),
        Value::list(row.preds.iter().map(Value::str)),
    ));
    fields.push(("score".to_string(), Value::Int(row.score as i64)));
    Value::Record(fields)
}

/// Apply one filter expression to ranked rows, preserving their order.
/// Parse errors surface to the caller (the HTTP layer maps them to 400).
pub fn query(filter: &str, rows: Vec<ChangePreds>) -> Result<Vec<ChangePreds>> {
    query_with_functions(filter, Functions::new(), rows)
}

pub fn query_with_functions(
    filter: &str,
    funcs: Functions,
    rows: Vec<ChangePreds>,
) -> Result<Vec<ChangePreds>> {
    let compiled = Filter::with_functions(filter, funcs)?;
    Ok(rows
        .into_iter()
        .filter(|row| compiled.matches_value(&project_row(row)))
        .collect())
}

/// Split ranked rows into categories, applied in order with first match
/// winning; unmatched rows land in the implicit Remainder bucket.
pub fn categorize(categories: &[Category], rows: Vec<ChangePreds>) -> Result<Vec<CategoryRows>> {
    let mut compiled = Vec::with_capacity(categories.len());
    for category in categories {
        let filter = Filter::new(&category.filter).map_err(|err| {
            Error::filter(format!("category {:?}: {err}", category.name))
        })?;
        compiled.push(filter);
    }

    let mut out: Vec<CategoryRows> = categories
        .iter()
        .map(|c| CategoryRows {
            name: c.name.clone(),
            doc: c.doc.clone(),
            rows: Vec::new(),
        })
        .collect();
    let mut remainder = CategoryRows {
        name: REMAINDER.to_string(),
        doc: "changes no category claimed".to_string(),
        rows: Vec::new(),
    };

    for row in rows {
        let value = project_row(&row);
        match compiled.iter().position(|f| f.matches_value(&value)) {
            Some(at) => out[at].rows.push(row),
            None => remainder.rows.push(row),
        }
    }
    out.push(remainder);
    Ok(out)
}

/// Plain-text rendering of a categorized dashboard, one ranked line per
/// change.
pub fn render_text(categories: &[CategoryRows]) -> String {
    let mut out = String::new();
    for category in categories {
        if category.rows.is_empty() {
            continue;
        }
        let _ = writeln!(out, "== {} ==", category.name);
        if !category.doc.is_empty() {
            let _ = writeln!(out, "   {}", category.doc);
        }
        for row in &category.rows {
            let _ = writeln!(
                out,
                "{:>6}  {:<12} {}  [{}]",
                row.score,
                row.change.id(),
                row.change.subject(),
                row.preds.join(", "),
            );
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::change::{Authority, Status};
    use crate::testing::change::TestChange;
    use std::sync::Arc;

    fn row(id: &str, score: i32, preds: &[&str], authority: Authority) -> ChangePreds {
        ChangePreds {
            change: Arc::new(TestChange {
                id: id.to_string(),
                authority,
                ..Default::default()
            }),
            preds: preds.iter().map(|s| s.to_string()).collect(),
            score,
        }
    }

    #[test]
    fn parse_category_json() {
        let cats = parse_categories(
            r#"[{"name": "Maintainers", "doc": "by maintainers", "filter": "author.authority = maintainer"},
                {"name": "Everything", "filter": ""}]"#,
        )
        .unwrap();
        assert_eq!(cats.len(), 2);
        assert_eq!(cats[0].name, "Maintainers");
        assert!(cats[1].doc.is_empty());
    }

    #[test]
    fn bad_category_json_is_an_error() {
        assert!(parse_categories("{not json").is_err());
    }

    #[test]
    fn first_match_wins_and_remainder_collects() {
        let cats = vec![
            Category {
                name: "High".to_string(),
                doc: String::new(),
                filter: "score >= 10".to_string(),
            },
            Category {
                name: "ByMaintainer".to_string(),
                doc: String::new(),
                filter: "author.authority = maintainer".to_string(),
            },
        ];
        let rows = vec![
            row("1", 12, &["authorMaintainer"], Authority::Maintainer),
            row("2", 3, &[], Authority::Maintainer),
            row("3", 0, &[], Authority::Unknown),
        ];
        let split = categorize(&cats, rows).unwrap();
        assert_eq!(split.len(), 3);
        // Row 1 scores >= 10 so the first category claims it even though
        // the second also matches.
        assert_eq!(split[0].rows.len(), 1);
        assert_eq!(split[0].rows[0].change.id(), "1");
        assert_eq!(split[1].rows.len(), 1);
        assert_eq!(split[1].rows[0].change.id(), "2");
        assert_eq!(split[2].name, REMAINDER);
        assert_eq!(split[2].rows.len(), 1);
    }

    #[test]
    fn bad_category_filter_is_an_error() {
        let cats = vec![Category {
            name: "Broken".to_string(),
            doc: String::new(),
            filter: "(a".to_string(),
        }];
        assert!(categorize(&cats, Vec::new()).is_err());
    }

    #[test]
    fn query_filters_rows() {
        let rows = vec![
            row("1", 11, &["authorMaintainer"], Authority::Maintainer),
            row("2", 0, &[], Authority::Unknown),
        ];
        let kept = query(r#"preds:"authorMaintainer""#, rows).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].change.id(), "1");
    }

    #[test]
    fn query_rejects_bad_filters() {
        assert!(query("a >", Vec::new()).is_err());
    }

    #[test]
    fn status_and_score_are_filterable() {
        let mut r = row("1", 5, &[], Authority::Unknown);
        r = ChangePreds {
            change: Arc::new(TestChange {
                id: "1".to_string(),
                status: Status::Ready,
                ..Default::default()
            }),
            ..r
        };
        let kept = query("status = ready AND score = 5", vec![r]).unwrap();
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn render_skips_empty_categories() {
        let split = vec![
            CategoryRows {
                name: "Empty".to_string(),
                doc: String::new(),
                rows: Vec::new(),
            },
            CategoryRows {
                name: "Busy".to_string(),
                doc: "has rows".to_string(),
                rows: vec![row("9", 2, &["fine"], Authority::Unknown)],
            },
        ];
        let text = render_text(&split);
        assert!(!text.contains("Empty"));
        assert!(text.contains("== Busy =="));
        assert!(text.contains("change 9"));
    }
}
