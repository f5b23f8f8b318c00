//! Compilation of the payload filter grammar into parameterized SQL.
//!
//! The produced fragments reference the objects table through the `o` alias
//! and bind every user-supplied value; only whitelisted system column names
//! are ever interpolated. Semantics mirror `PayloadFilter::matches`.

use quiver_core::error::{QuiverError, Result};
use quiver_core::filter::{
    BoolFilter, FieldCondition, PayloadFilter, RangeCondition, SYSTEM_FIELDS, ValueCondition,
    ValuesCondition, WildcardCondition,
};
use serde_json::Value;

/// One bound parameter of a compiled statement.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Text(String),
    TextArray(Vec<String>),
    Json(Value),
    Float(f64),
    Int(i64),
}

/// A compiled WHERE fragment plus its parameters.
#[derive(Debug, Clone)]
pub struct SqlFilter {
    pub sql: String,
    pub binds: Vec<BindValue>,
}

/// Compile a filter. Placeholders start at `$first_placeholder`.
pub fn compile(filter: &PayloadFilter, first_placeholder: usize) -> Result<SqlFilter> {
    filter.validate()?;
    let mut compiler = Compiler {
        binds: Vec::new(),
        next: first_placeholder,
    };
    let sql = compiler.compile(filter)?;
    Ok(SqlFilter {
        sql,
        binds: compiler.binds,
    })
}

struct Compiler {
    binds: Vec<BindValue>,
    next: usize,
}

impl Compiler {
    fn push(&mut self, value: BindValue) -> String {
        let placeholder = format!("${}", self.next);
        self.next += 1;
        self.binds.push(value);
        placeholder
    }

    fn compile(&mut self, filter: &PayloadFilter) -> Result<String> {
        match filter {
            PayloadFilter::Bool(b) => self.compile_bool(b),
            PayloadFilter::Term(c) => self.compile_term(c),
            PayloadFilter::Match(c) => self.compile_match(c, true),
            PayloadFilter::MatchPhrase(c) => self.compile_match(c, false),
            PayloadFilter::Terms(c) => self.compile_terms(c),
            PayloadFilter::All(c) => self.compile_array(c, "jsonb_exists_all"),
            PayloadFilter::Any(c) => self.compile_array(c, "jsonb_exists_any"),
            PayloadFilter::Exists(c) => self.compile_exists(c),
            PayloadFilter::Wildcard(c) => self.compile_wildcard(c),
            PayloadFilter::Range(c) => self.compile_range(c),
        }
    }

    fn compile_bool(&mut self, filter: &BoolFilter) -> Result<String> {
        let mut clauses = Vec::new();
        for f in filter.must.iter().chain(&filter.filter) {
            clauses.push(self.compile(f)?);
        }
        for f in &filter.must_not {
            clauses.push(format!("NOT ({})", self.compile(f)?));
        }
        if !filter.should.is_empty() {
            let shoulds: Result<Vec<_>> = filter.should.iter().map(|f| self.compile(f)).collect();
            clauses.push(format!("({})", shoulds?.join(" OR ")));
        }
        if clauses.is_empty() {
            return Ok("TRUE".to_owned());
        }
        Ok(format!("({})", clauses.join(" AND ")))
    }

    fn compile_term(&mut self, c: &ValueCondition) -> Result<String> {
        if c.force_not_payload {
            let column = system_column(&c.field)?;
            let value = self.push(BindValue::Text(text_of(&c.value)));
            return Ok(format!("o.{column} = {value}"));
        }
        let field = self.push(BindValue::Text(c.field.clone()));
        let value = self.push(BindValue::Json(c.value.clone()));
        Ok(format!("o.payload -> {field} = {value}"))
    }

    fn compile_match(&mut self, c: &ValueCondition, tokenize: bool) -> Result<String> {
        let text = text_of(&c.value);
        let patterns: Vec<String> = if tokenize {
            text.split_whitespace()
                .map(|token| format!("%{}%", escape_like(token)))
                .collect()
        } else {
            vec![format!("%{}%", escape_like(&text))]
        };
        if patterns.is_empty() {
            return Ok("TRUE".to_owned());
        }

        let target = if c.force_not_payload {
            format!("o.{}", system_column(&c.field)?)
        } else {
            let field = self.push(BindValue::Text(c.field.clone()));
            format!("o.payload ->> {field}")
        };

        let clauses: Vec<String> = patterns
            .into_iter()
            .map(|p| {
                let bound = self.push(BindValue::Text(p));
                format!("{target} ILIKE {bound}")
            })
            .collect();
        Ok(format!("({})", clauses.join(" AND ")))
    }

    fn compile_terms(&mut self, c: &ValuesCondition) -> Result<String> {
        if c.force_not_payload {
            let column = system_column(&c.field)?;
            let values = self.push(BindValue::TextArray(
                c.values.iter().map(text_of).collect(),
            ));
            return Ok(format!("o.{column} = ANY({values})"));
        }
        let field = self.push(BindValue::Text(c.field.clone()));
        let values = self.push(BindValue::Json(Value::Array(c.values.clone())));
        Ok(format!(
            "{values} @> jsonb_build_array(o.payload -> {field})"
        ))
    }

    fn compile_array(&mut self, c: &ValuesCondition, function: &str) -> Result<String> {
        if c.force_not_payload {
            return Err(QuiverError::validation(format!(
                "array filter is not supported on system field {:?}",
                c.field
            )));
        }
        let field = self.push(BindValue::Text(c.field.clone()));
        let values = self.push(BindValue::TextArray(
            c.values.iter().map(text_of).collect(),
        ));
        Ok(format!("{function}(o.payload -> {field}, {values})"))
    }

    fn compile_exists(&mut self, c: &FieldCondition) -> Result<String> {
        if c.force_not_payload {
            let column = system_column(&c.field)?;
            return Ok(format!("o.{column} IS NOT NULL"));
        }
        let field = self.push(BindValue::Text(c.field.clone()));
        Ok(format!(
            "(jsonb_exists(o.payload, {field}) AND o.payload -> {field} <> 'null'::jsonb)"
        ))
    }

    fn compile_wildcard(&mut self, c: &WildcardCondition) -> Result<String> {
        let pattern = escape_like(&c.pattern).replace('*', "%").replace('?', "_");
        let target = if c.force_not_payload {
            format!("o.{}", system_column(&c.field)?)
        } else {
            let field = self.push(BindValue::Text(c.field.clone()));
            format!("o.payload ->> {field}")
        };
        let bound = self.push(BindValue::Text(pattern));
        Ok(format!("{target} ILIKE {bound}"))
    }

    fn compile_range(&mut self, c: &RangeCondition) -> Result<String> {
        if c.force_not_payload {
            return Err(QuiverError::validation(format!(
                "range filter is not supported on system field {:?}",
                c.field
            )));
        }
        let field = self.push(BindValue::Text(c.field.clone()));
        let mut clauses = Vec::new();
        for (bound, op) in [(c.gt, ">"), (c.gte, ">="), (c.lt, "<"), (c.lte, "<=")] {
            if let Some(value) = bound {
                let bound = self.push(BindValue::Float(value));
                clauses.push(format!(
                    "o.payload -> {field} {op} to_jsonb({bound}::double precision)"
                ));
            }
        }
        Ok(format!("({})", clauses.join(" AND ")))
    }
}

fn system_column(field: &str) -> Result<&'static str> {
    SYSTEM_FIELDS
        .iter()
        .find(|&&column| column == field)
        .copied()
        .ok_or_else(|| {
            QuiverError::validation(format!("unknown system field in payload filter: {field:?}"))
        })
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Escape LIKE metacharacters in user input.
fn escape_like(text: &str) -> String {
    text.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn term_compiles_with_binds() {
        let compiled = compile(&PayloadFilter::term("category", "y"), 1).unwrap();
        assert_eq!(compiled.sql, "o.payload -> $1 = $2");
        assert_eq!(
            compiled.binds,
            vec![
                BindValue::Text("category".into()),
                BindValue::Json(json!("y")),
            ]
        );
    }

    #[test]
    fn placeholders_continue_from_offset() {
        let compiled = compile(&PayloadFilter::term("category", "y"), 4).unwrap();
        assert_eq!(compiled.sql, "o.payload -> $4 = $5");
    }

    #[test]
    fn bool_combines_clauses() {
        let filter: PayloadFilter = serde_json::from_value(json!({
            "bool": {
                "must": [{"term": {"field": "a", "value": 1}}],
                "must_not": [{"exists": {"field": "b"}}],
                "should": [
                    {"term": {"field": "c", "value": 2}},
                    {"term": {"field": "c", "value": 3}}
                ]
            }
        }))
        .unwrap();
        let compiled = compile(&filter, 1).unwrap();
        assert!(compiled.sql.contains(" AND "));
        assert!(compiled.sql.contains("NOT ("));
        assert!(compiled.sql.contains(" OR "));
        assert_eq!(compiled.binds.len(), 7);
    }

    #[test]
    fn system_field_interpolates_whitelisted_column() {
        let filter: PayloadFilter = serde_json::from_value(json!({
            "term": {"field": "user_id", "value": "u1", "force_not_payload": true}
        }))
        .unwrap();
        let compiled = compile(&filter, 1).unwrap();
        assert_eq!(compiled.sql, "o.user_id = $1");
    }

    #[test]
    fn wildcard_translates_globs() {
        let filter: PayloadFilter = serde_json::from_value(json!({
            "wildcard": {"field": "name", "pattern": "ab*c?"}
        }))
        .unwrap();
        let compiled = compile(&filter, 1).unwrap();
        assert_eq!(
            compiled.binds[1],
            BindValue::Text("ab%c_".into())
        );
    }

    #[test]
    fn like_input_is_escaped() {
        let filter: PayloadFilter = serde_json::from_value(json!({
            "match_phrase": {"field": "title", "value": "50%_off"}
        }))
        .unwrap();
        let compiled = compile(&filter, 1).unwrap();
        assert_eq!(
            compiled.binds[1],
            BindValue::Text("%50\\%\\_off%".into())
        );
    }

    #[test]
    fn range_requires_payload_field() {
        let filter: PayloadFilter = serde_json::from_value(json!({
            "range": {"field": "user_id", "gte": 1.0, "force_not_payload": true}
        }))
        .unwrap();
        assert!(compile(&filter, 1).is_err());
    }

    #[test]
    fn invalid_filter_is_rejected() {
        let filter: PayloadFilter = serde_json::from_value(json!({
            "range": {"field": "price"}
        }))
        .unwrap();
        assert!(compile(&filter, 1).is_err());
    }
}
