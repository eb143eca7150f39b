// Textual fixtures
// The line-oriented archive format driving the in-process doubles:
//
//     -- change 101 --
//     { "..." : "..." }
//     -- comments 101 --
//     { }
//
// A `-- name --` marker opens a section; everything until the next marker
// is its body. Text before the first marker is ignored (a comment area).

/// One named section of a fixture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub body: String,
}

impl Section {
    /// The whitespace-separated words of the section name.
    pub fn words(&self) -> Vec<&str> {
        self.name.split_whitespace().collect()
    }

    /// The body parsed as JSON.
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(self.body.trim()).ok()
    }
}

/// Parse a fixture into its sections, in file order.
pub fn parse(text: &str) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();
    for line in text.lines() {
        if let Some(name) = marker(line) {
            sections.push(Section {
                name: name.to_string(),
                body: String::new(),
            });
            continue;
        }
        if let Some(open) = sections.last_mut() {
            open.body.push_str(line);
            open.body.push('\n');
        }
    }
    sections
}

fn marker(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    let inner = trimmed.strip_prefix("--")?.strip_suffix("--")?;
    if inner.is_empty() {
        return None;
    }
    Some(inner.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_sections() {
        let text = "leading comment\n-- a 1 --\nbody a\n-- b --\nbody b\nline two\n";
        let sections = parse(text);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].name, "a 1");
        assert_eq!(sections[0].body, "body a\n");
        assert_eq!(sections[0].words(), vec!["a", "1"]);
        assert_eq!(sections[1].body, "body b\nline two\n");
    }

    #[test]
    fn json_bodies_parse() {
        let text = "-- change 7 --\n{\"x\": 1}\n";
        let sections = parse(text);
        assert_eq!(sections[0].json().unwrap()["x"], 1);
    }

    #[test]
    fn bare_dashes_are_not_markers() {
        let text = "-- s --\n--\n----\nbody\n";
        let sections = parse(text);
        assert_eq!(sections.len(), 1);
        // "--" alone and "----" (empty name) stay in the body.
        assert_eq!(sections[0].body, "--\n----\nbody\n");
    }
}
