use crate::{key::Key, request::Request};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("unknown keyword '{0}' in request")]
    UnknownKeyword(String),
    #[error("request is missing mandatory keyword '{0}'")]
    MissingKeyword(String),
    #[error("no rule matches database key {0}")]
    NoMatchingRule(Key),
    #[error("schema has no rules at the {0} level")]
    EmptyLevel(&'static str),
    #[error("failed to read schema: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse schema: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// One keyword slot in a rule: optionally value-constrained, optionally
/// defaulted, mandatory unless marked otherwise.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct KeywordSpec {
    pub name: String,
    #[serde(default)]
    pub values: Option<BTreeSet<String>>,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

impl KeywordSpec {
    fn allows(&self, value: &str) -> bool {
        match &self.values {
            Some(allowed) => allowed.contains(value),
            None => true,
        }
    }
}

/// An ordered keyword list; keys built from a rule carry its order.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Rule {
    pub keywords: Vec<KeywordSpec>,
}

impl Rule {
    /// The Cartesian product of candidate values for every keyword.
    ///
    /// `missing` decides what an unconstrained keyword contributes: a
    /// placeholder (first-level matching) or a hard error (full expansion).
    fn expand(&self, request: &Request, missing: &MissingValue) -> Result<Vec<Key>, SchemaError> {
        let mut keys = vec![Key::new()];
        for spec in &self.keywords {
            let candidates: Vec<String> = match request.values(&spec.name) {
                Some(values) if !values.is_empty() => values
                    .iter()
                    .filter(|v| spec.allows(v))
                    .cloned()
                    .collect(),
                // Explicit wildcard: every allowed value, if we know them.
                Some(_) => match &spec.values {
                    Some(allowed) => allowed.iter().cloned().collect(),
                    None => missing.substitute(spec)?,
                },
                None => match &spec.default {
                    Some(default) => vec![default.clone()],
                    None if !spec.required => continue,
                    None => missing.substitute(spec)?,
                },
            };
            if candidates.is_empty() {
                // The request constrains this keyword to values the rule
                // does not admit, so the rule yields nothing.
                return Ok(Vec::new());
            }
            let mut next = Vec::with_capacity(keys.len() * candidates.len());
            for key in &keys {
                for value in &candidates {
                    let mut expanded = key.clone();
                    expanded.insert(spec.name.clone(), value.clone());
                    next.push(expanded);
                }
            }
            keys = next;
        }
        Ok(keys)
    }

    /// True iff `key` carries exactly this rule's keywords with admissible
    /// values.
    fn matches_key(&self, key: &Key) -> bool {
        for spec in &self.keywords {
            match key.get(&spec.name) {
                Some(value) => {
                    if !spec.allows(value) {
                        return false;
                    }
                }
                None if !spec.required => continue,
                None => return false,
            }
        }
        // No extra names beyond the rule's keywords.
        key.names()
            .all(|name| self.keywords.iter().any(|s| s.name == name))
    }

    fn knows(&self, name: &str) -> bool {
        self.keywords.iter().any(|s| s.name == name)
    }
}

enum MissingValue<'a> {
    Placeholder(&'a str),
    Fail,
}

impl MissingValue<'_> {
    /// Candidate values for a keyword the request leaves open-ended.
    fn substitute(&self, spec: &KeywordSpec) -> Result<Vec<String>, SchemaError> {
        match self {
            MissingValue::Placeholder(placeholder) => Ok(vec![(*placeholder).to_string()]),
            MissingValue::Fail => Err(SchemaError::MissingKeyword(spec.name.clone())),
        }
    }
}

/// A fully expanded `(db, index, datum)` key triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedKey {
    pub db: Key,
    pub index: Key,
    pub datum: Key,
}

/// The three-level rule set that partitions a full key into the database,
/// index and datum levels. Matching is deterministic: rules are consulted in
/// declaration order and the first match wins.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Schema {
    pub db: Vec<Rule>,
    pub index: Vec<Rule>,
    pub datum: Vec<Rule>,
    #[serde(skip)]
    digest: u32,
    #[serde(skip)]
    source: String,
}

impl Schema {
    pub fn from_yaml(text: &str) -> Result<Self, SchemaError> {
        let mut schema: Schema = serde_yaml::from_str(text)?;
        schema.digest = crc32fast::hash(text.as_bytes());
        schema.source = text.to_string();
        if schema.db.is_empty() {
            return Err(SchemaError::EmptyLevel("db"));
        }
        if schema.index.is_empty() {
            return Err(SchemaError::EmptyLevel("index"));
        }
        if schema.datum.is_empty() {
            return Err(SchemaError::EmptyLevel("datum"));
        }
        Ok(schema)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// CRC of the schema source, recorded in each database's init record so
    /// readers can detect a schema swap underneath existing data.
    pub fn digest(&self) -> u32 {
        self.digest
    }

    /// The YAML text this schema was parsed from. Writers copy it into each
    /// new database so readers resolve keys against the schema the data was
    /// written with.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Candidate database keys for a request. Names the request does not
    /// constrain take `placeholder`, so callers can enumerate and then test
    /// existence.
    pub fn match_first_level(
        &self,
        request: &Request,
        placeholder: &str,
    ) -> Result<Vec<Key>, SchemaError> {
        let mut out: Vec<Key> = Vec::new();
        for rule in &self.db {
            for key in rule.expand(request, &MissingValue::Placeholder(placeholder))? {
                if !out.contains(&key) {
                    out.push(key);
                }
            }
        }
        Ok(out)
    }

    /// The DB-level rule governing `db_key`.
    pub fn matching_rule(&self, db_key: &Key) -> Result<&Rule, SchemaError> {
        self.db
            .iter()
            .find(|rule| rule.matches_key(db_key))
            .ok_or_else(|| SchemaError::NoMatchingRule(db_key.clone()))
    }

    /// Full Cartesian expansion of a request into key triples. In strict
    /// mode, request names unknown to every level are an error.
    pub fn expand(&self, request: &Request, strict: bool) -> Result<Vec<ExpandedKey>, SchemaError> {
        if strict {
            for name in request.names() {
                let known = self
                    .db
                    .iter()
                    .chain(&self.index)
                    .chain(&self.datum)
                    .any(|rule| rule.knows(name));
                if !known {
                    return Err(SchemaError::UnknownKeyword(name.to_string()));
                }
            }
        }

        let mut out = Vec::new();
        for db_rule in &self.db {
            for db_key in db_rule.expand(request, &MissingValue::Fail)? {
                for index_rule in &self.index {
                    for index_key in index_rule.expand(request, &MissingValue::Fail)? {
                        for datum_rule in &self.datum {
                            for datum_key in datum_rule.expand(request, &MissingValue::Fail)? {
                                out.push(ExpandedKey {
                                    db: db_key.clone(),
                                    index: index_key.clone(),
                                    datum: datum_key.clone(),
                                });
                            }
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Splits a fully specified key into its `(db, index, datum)` levels.
    pub fn partition(&self, key: &Key) -> Result<ExpandedKey, SchemaError> {
        let request = key.as_request("archive");
        let mut expanded = self.expand(&request, false)?;
        match expanded.len() {
            0 => Err(SchemaError::NoMatchingRule(key.clone())),
            _ => Ok(expanded.swap_remove(0)),
        }
    }
}

/// Canned schemas for tests across the workspace.
#[doc(hidden)]
pub mod test_support {
    use super::Schema;

    /// A small weather-flavoured schema shared by tests across crates.
    pub const EXAMPLE_SCHEMA: &str = r#"
db:
  - keywords:
      - name: class
        values: [od, rd]
      - name: stream
        default: oper
      - name: date
index:
  - keywords:
      - name: type
      - name: levtype
        default: sfc
datum:
  - keywords:
      - name: step
      - name: param
        default: "130"
"#;

    pub fn example_schema() -> Schema {
        Schema::from_yaml(EXAMPLE_SCHEMA).expect("example schema parses")
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::example_schema;
    use super::*;

    #[test]
    fn first_level_match_substitutes_placeholder() {
        let schema = example_schema();
        let mut request = Request::new("list");
        request.set("class", ["od"]);

        let keys = schema.match_first_level(&request, "%").expect("match");
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].get("class"), Some("od"));
        assert_eq!(keys[0].get("stream"), Some("oper"));
        assert_eq!(keys[0].get("date"), Some("%"));
    }

    #[test]
    fn first_level_wildcard_expands_known_values() {
        let schema = example_schema();
        let mut request = Request::new("list");
        request.set("class", Vec::<String>::new());
        request.set("date", ["20260801"]);

        let keys = schema.match_first_level(&request, "%").expect("match");
        let classes: Vec<_> = keys.iter().filter_map(|k| k.get("class")).collect();
        assert_eq!(classes, vec!["od", "rd"]);
    }

    #[test]
    fn expansion_is_cartesian() {
        let schema = example_schema();
        let mut request = Request::new("archive");
        request.set("class", ["od"]);
        request.set("date", ["20260801"]);
        request.set("type", ["fc"]);
        request.set("step", ["0", "6"]);
        request.set("param", ["130", "131"]);

        let expanded = schema.expand(&request, true).expect("expand");
        assert_eq!(expanded.len(), 4);
        assert!(expanded
            .iter()
            .all(|t| t.db.get("stream") == Some("oper") && t.index.get("levtype") == Some("sfc")));
    }

    #[test]
    fn strict_expansion_rejects_unknown_keywords() {
        let schema = example_schema();
        let mut request = Request::new("archive");
        request.set("nonsense", ["1"]);
        match schema.expand(&request, true) {
            Err(SchemaError::UnknownKeyword(name)) => assert_eq!(name, "nonsense"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn expansion_requires_mandatory_keywords() {
        let schema = example_schema();
        let request = Request::new("archive");
        assert!(matches!(
            schema.expand(&request, true),
            Err(SchemaError::MissingKeyword(_))
        ));
    }

    #[test]
    fn matching_rule_checks_allowed_values() {
        let schema = example_schema();
        let good = Key::from_pairs([("class", "od"), ("stream", "oper"), ("date", "20260801")]);
        assert!(schema.matching_rule(&good).is_ok());

        let bad = Key::from_pairs([("class", "xx"), ("stream", "oper"), ("date", "20260801")]);
        assert!(schema.matching_rule(&bad).is_err());
    }

    #[test]
    fn partition_splits_a_full_key() {
        let schema = example_schema();
        let key = Key::from_pairs([
            ("class", "od"),
            ("stream", "oper"),
            ("date", "20260801"),
            ("type", "fc"),
            ("levtype", "sfc"),
            ("step", "0"),
            ("param", "130"),
        ]);
        let triple = schema.partition(&key).expect("partition");
        assert_eq!(triple.db.values_to_string(), "od,oper,20260801");
        assert_eq!(triple.index.values_to_string(), "fc,sfc");
        assert_eq!(triple.datum.values_to_string(), "0,130");
    }
}
