use std::fmt::Write as _;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArffError {
    #[error("relation {relation}: row {row} has {got} values, {expected} attributes declared")]
    RowArity {
        relation: String,
        row: usize,
        expected: usize,
        got: usize,
    },
    #[error("relation {relation}: row {row} value '{value}' not in nominal domain of {attribute}")]
    NominalDomain {
        relation: String,
        row: usize,
        attribute: String,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeType {
    Numeric,
    Text,
    Nominal(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    pub ty: AttributeType,
}

impl Attribute {
    pub fn numeric(name: impl Into<String>) -> Self {
        Attribute {
            name: name.into(),
            ty: AttributeType::Numeric,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Attribute {
            name: name.into(),
            ty: AttributeType::Text,
        }
    }

    pub fn nominal<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Attribute {
            name: name.into(),
            ty: AttributeType::Nominal(values.into_iter().map(Into::into).collect()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Int(u64),
    Num(f64),
    Str(String),
}

impl From<u64> for Cell {
    fn from(v: u64) -> Self {
        Cell::Int(v)
    }
}

impl From<f64> for Cell {
    fn from(v: f64) -> Self {
        Cell::Num(v)
    }
}

impl From<&str> for Cell {
    fn from(v: &str) -> Self {
        Cell::Str(v.to_string())
    }
}

impl From<String> for Cell {
    fn from(v: String) -> Self {
        Cell::Str(v)
    }
}

/// One ARFF relation: `@RELATION` header, typed `@ATTRIBUTE` declarations
/// and a `@DATA` block. Rows are validated against the declared attributes
/// at render time.
#[derive(Debug, Clone)]
pub struct Relation {
    pub name: String,
    pub attributes: Vec<Attribute>,
    pub rows: Vec<Vec<Cell>>,
}

impl Relation {
    pub fn new(name: impl Into<String>, attributes: Vec<Attribute>) -> Self {
        Relation {
            name: name.into(),
            attributes,
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<Cell>) {
        self.rows.push(row);
    }

    pub fn render(&self) -> Result<String, ArffError> {
        let mut out = String::new();
        let _ = writeln!(out, "@RELATION {}", quote(&self.name));
        out.push('\n');
        for attr in &self.attributes {
            match &attr.ty {
                AttributeType::Numeric => {
                    let _ = writeln!(out, "@ATTRIBUTE {} NUMERIC", quote(&attr.name));
                }
                AttributeType::Text => {
                    let _ = writeln!(out, "@ATTRIBUTE {} STRING", quote(&attr.name));
                }
                AttributeType::Nominal(values) => {
                    let domain: Vec<String> = values.iter().map(|v| quote(v)).collect();
                    let _ = writeln!(
                        out,
                        "@ATTRIBUTE {} {{{}}}",
                        quote(&attr.name),
                        domain.join(",")
                    );
                }
            }
        }
        out.push('\n');
        out.push_str("@DATA\n");
        for (idx, row) in self.rows.iter().enumerate() {
            if row.len() != self.attributes.len() {
                return Err(ArffError::RowArity {
                    relation: self.name.clone(),
                    row: idx,
                    expected: self.attributes.len(),
                    got: row.len(),
                });
            }
            let mut fields = Vec::with_capacity(row.len());
            for (cell, attr) in row.iter().zip(&self.attributes) {
                fields.push(self.render_cell(idx, cell, attr)?);
            }
            let _ = writeln!(out, "{}", fields.join(","));
        }
        Ok(out)
    }

    fn render_cell(&self, row: usize, cell: &Cell, attr: &Attribute) -> Result<String, ArffError> {
        if let AttributeType::Nominal(domain) = &attr.ty {
            let value = match cell {
                Cell::Str(s) => s.clone(),
                Cell::Int(v) => v.to_string(),
                Cell::Num(v) => v.to_string(),
            };
            if !domain.iter().any(|d| d == &value) {
                return Err(ArffError::NominalDomain {
                    relation: self.name.clone(),
                    row,
                    attribute: attr.name.clone(),
                    value,
                });
            }
            return Ok(quote(&value));
        }
        Ok(match cell {
            Cell::Int(v) => v.to_string(),
            // ARFF has no literal for non-finite numbers; emit the missing
            // marker instead.
            Cell::Num(v) if !v.is_finite() => "?".to_string(),
            Cell::Num(v) => v.to_string(),
            Cell::Str(s) => quote(s),
        })
    }
}

fn needs_quoting(value: &str) -> bool {
    value.is_empty()
        || value.chars().any(|c| {
            matches!(
                c,
                ' ' | '\t' | ',' | '"' | '\'' | '{' | '}' | '%' | '\\'
            )
        })
}

fn quote(value: &str) -> String {
    if !needs_quoting(value) {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_attr() -> Attribute {
        Attribute::nominal("runstatus", ["ok", "timeout", "other"])
    }

    #[test]
    fn renders_header_attributes_and_rows() {
        let mut rel = Relation::new(
            "ALGORITHM_RUNS",
            vec![
                Attribute::text("instance_id"),
                Attribute::numeric("repetition"),
                Attribute::numeric("predictive_accuracy"),
                status_attr(),
            ],
        );
        rel.push_row(vec![Cell::Int(1701), Cell::Int(1), Cell::Num(0.934), "ok".into()]);
        let text = rel.render().expect("render");
        assert!(text.starts_with("@RELATION ALGORITHM_RUNS\n"));
        assert!(text.contains("@ATTRIBUTE instance_id STRING\n"));
        assert!(text.contains("@ATTRIBUTE repetition NUMERIC\n"));
        assert!(text.contains("@ATTRIBUTE runstatus {ok,timeout,other}\n"));
        assert!(text.contains("\n@DATA\n"));
        assert!(text.ends_with("1701,1,0.934,ok\n"));
    }

    #[test]
    fn quotes_values_with_separators() {
        let mut rel = Relation::new("T", vec![Attribute::text("name")]);
        rel.push_row(vec!["sklearn.svm.SVC, rbf".into()]);
        let text = rel.render().expect("render");
        assert!(text.contains("'sklearn.svm.SVC, rbf'"), "got: {}", text);
    }

    #[test]
    fn escapes_embedded_quotes() {
        let mut rel = Relation::new("T", vec![Attribute::text("name")]);
        rel.push_row(vec!["it's".into()]);
        let text = rel.render().expect("render");
        assert!(text.contains("'it\\'s'"), "got: {}", text);
    }

    #[test]
    fn rejects_value_outside_nominal_domain() {
        let mut rel = Relation::new("T", vec![status_attr()]);
        rel.push_row(vec!["crashed".into()]);
        let err = rel.render().expect_err("domain violation");
        assert!(matches!(err, ArffError::NominalDomain { .. }), "{}", err);
        assert!(err.to_string().contains("crashed"));
    }

    #[test]
    fn rejects_row_with_wrong_arity() {
        let mut rel = Relation::new("T", vec![Attribute::numeric("a"), Attribute::numeric("b")]);
        rel.push_row(vec![Cell::Int(1)]);
        let err = rel.render().expect_err("arity violation");
        assert!(matches!(
            err,
            ArffError::RowArity {
                expected: 2,
                got: 1,
                ..
            }
        ));
    }

    #[test]
    fn non_finite_numerics_render_as_missing() {
        let mut rel = Relation::new("T", vec![Attribute::numeric("q")]);
        rel.push_row(vec![Cell::Num(f64::NAN)]);
        let text = rel.render().expect("render");
        assert!(text.ends_with("?\n"), "got: {}", text);
    }
}
