use disexec_core::{Error, Result, Row};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

/// Column holding the scenario-name template.
pub const SCENARIO_COLUMN: &str = "Scenario.name";

/// Text a match-any token shows as in scenario labels.
const ANY_LABEL: &str = ".*";

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"%%(.*?)%%").expect("static placeholder pattern"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    /// An ignored placeholder: matches any text.
    Any,
}

/// One fully substituted scenario name. Concrete unless an ignored
/// placeholder left a match-any token in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expansion {
    segments: Vec<Segment>,
}

impl Expansion {
    fn push_literal(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(Segment::Literal(last)) = self.segments.last_mut() {
            last.push_str(text);
        } else {
            self.segments.push(Segment::Literal(text.to_string()));
        }
    }

    fn push_any(&mut self) {
        if self.segments.last() != Some(&Segment::Any) {
            self.segments.push(Segment::Any);
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_concrete(&self) -> bool {
        !self.segments.contains(&Segment::Any)
    }

    /// The identifier itself, when there is nothing left to match.
    pub fn as_concrete(&self) -> Option<String> {
        if !self.is_concrete() {
            return None;
        }
        Some(self.label())
    }

    /// Human-readable form; match-any tokens print as `.*`.
    pub fn label(&self) -> String {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Literal(text) => text.as_str(),
                Segment::Any => ANY_LABEL,
            })
            .collect()
    }

    /// Unanchored regex source: literals escaped, match-any as `.*`.
    pub fn regex_source(&self) -> String {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Literal(text) => regex::escape(text),
                Segment::Any => ".*".to_string(),
            })
            .collect()
    }
}

/// Values a placeholder may take: `[a;b;c]` lists every alternative, any
/// other value is used as-is.
pub fn alternatives(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    match trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
    {
        Some(inner) => inner.split(';').map(|v| v.trim().to_string()).collect(),
        None => vec![value.to_string()],
    }
}

enum Part<'t> {
    Text(&'t str),
    Placeholder(&'t str),
}

fn split_template(template: &str) -> Vec<Part<'_>> {
    let mut parts = Vec::new();
    let mut last = 0;
    for caps in placeholder().captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        parts.push(Part::Text(&template[last..whole.start()]));
        parts.push(Part::Placeholder(name.as_str()));
        last = whole.end();
    }
    parts.push(Part::Text(&template[last..]));
    parts
}

/// Expands a scenario-name template against one matrix row.
///
/// Every distinct placeholder binds once, so a column named twice takes the
/// same value in both places. Multi-valued placeholders branch into the
/// Cartesian product, the first one discovered varying slowest. Placeholders
/// named in `ignore` become match-any tokens and never branch.
pub fn expand(template: &str, row: &Row<'_>, ignore: &BTreeSet<String>) -> Result<Vec<Expansion>> {
    let parts = split_template(template);

    let mut names: Vec<&str> = Vec::new();
    for part in &parts {
        if let Part::Placeholder(name) = part {
            if !ignore.contains(*name) && !names.contains(name) {
                names.push(name);
            }
        }
    }

    let mut choices: Vec<(&str, Vec<String>)> = Vec::with_capacity(names.len());
    for name in names {
        let value = row.get(name).ok_or_else(|| {
            Error::Configuration(format!(
                "row {}: template '{}' references unknown column '{}'",
                row.index() + 1,
                template,
                name
            ))
        })?;
        choices.push((name, alternatives(value)));
    }

    let mut bindings: Vec<BTreeMap<&str, &str>> = vec![BTreeMap::new()];
    for (name, values) in &choices {
        let mut next = Vec::with_capacity(bindings.len() * values.len());
        for binding in &bindings {
            for value in values {
                let mut b = binding.clone();
                b.insert(*name, value.as_str());
                next.push(b);
            }
        }
        bindings = next;
    }

    Ok(bindings
        .iter()
        .map(|binding| {
            let mut expansion = Expansion {
                segments: Vec::new(),
            };
            for part in &parts {
                match part {
                    Part::Text(text) => expansion.push_literal(text),
                    Part::Placeholder(name) => match binding.get(name) {
                        Some(value) => expansion.push_literal(value),
                        None => expansion.push_any(),
                    },
                }
            }
            expansion
        })
        .collect())
}

/// One anchored pattern matching any of `expansions` exactly.
pub fn compile(expansions: &[Expansion]) -> Result<Regex> {
    let alternatives: Vec<String> = expansions.iter().map(Expansion::regex_source).collect();
    Ok(Regex::new(&format!("^(?:{})$", alternatives.join("|")))?)
}

/// Label for a whole row: its expansions joined by `|`.
pub fn row_label(expansions: &[Expansion]) -> String {
    expansions
        .iter()
        .map(Expansion::label)
        .collect::<Vec<_>>()
        .join("|")
}
