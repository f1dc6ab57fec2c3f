//! `?fmt=table` rendering (spec §4.9: "every response can be formatted as
//! JSON or a fixed-width text table").

use axum::extract::Query;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fmt {
    #[default]
    Json,
    Table,
}

#[derive(Deserialize)]
pub struct FmtQuery {
    fmt: Option<String>,
}

impl From<Query<FmtQuery>> for Fmt {
    fn from(Query(q): Query<FmtQuery>) -> Self {
        match q.fmt.as_deref() {
            Some("table") => Fmt::Table,
            _ => Fmt::Json,
        }
    }
}

/// Wraps any serializable body, rendering it per the caller's requested
/// [`Fmt`] when returned from a handler.
pub struct Rendered {
    fmt: Fmt,
    value: Value,
}

impl Rendered {
    pub fn new<T: Serialize>(fmt: Fmt, value: &T) -> Self {
        Rendered {
            fmt,
            value: serde_json::to_value(value).unwrap_or(Value::Null),
        }
    }
}

impl IntoResponse for Rendered {
    fn into_response(self) -> Response {
        match self.fmt {
            Fmt::Json => (StatusCode::OK, axum::Json(self.value)).into_response(),
            Fmt::Table => {
                let body = render_table(&self.value);
                (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                    body,
                )
                    .into_response()
            }
        }
    }
}

/// Renders a JSON value as a fixed-width text table. An array of objects
/// becomes a column table keyed by the first row's field set; anything
/// else becomes a two-column `key / value` dump.
fn render_table(value: &Value) -> String {
    match value {
        Value::Array(rows) => render_rows(rows),
        Value::Object(map) => render_rows(&[Value::Object(map.clone())]),
        other => other.to_string(),
    }
}

fn render_rows(rows: &[Value]) -> String {
    let first = match rows.first() {
        Some(Value::Object(map)) => map,
        _ => return rows.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("\n"),
    };
    let columns: Vec<String> = first.keys().cloned().collect();
    let mut widths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
    let cell = |row: &Value, col: &str| -> String {
        row.get(col).map(scalar_to_string).unwrap_or_default()
    };

    let mut rendered_rows = Vec::with_capacity(rows.len());
    for row in rows {
        let cells: Vec<String> = columns.iter().map(|c| cell(row, c)).collect();
        for (w, c) in widths.iter_mut().zip(&cells) {
            *w = (*w).max(c.len());
        }
        rendered_rows.push(cells);
    }

    let mut out = String::new();
    push_row(&mut out, &columns, &widths);
    push_row(
        &mut out,
        &widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>(),
        &widths,
    );
    for row in &rendered_rows {
        push_row(&mut out, row, &widths);
    }
    out
}

fn push_row(out: &mut String, cells: &[String], widths: &[usize]) {
    for (cell, width) in cells.iter().zip(widths) {
        out.push_str(&format!("{cell:<width$}  "));
    }
    out.push('\n');
}

fn scalar_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fmt_query_defaults_to_json() {
        let q = FmtQuery { fmt: None };
        assert_eq!(Fmt::from(Query(q)), Fmt::Json);
    }

    #[test]
    fn fmt_query_table_is_case_sensitive_exact_match() {
        let q = FmtQuery { fmt: Some("table".to_string()) };
        assert_eq!(Fmt::from(Query(q)), Fmt::Table);
        let q = FmtQuery { fmt: Some("Table".to_string()) };
        assert_eq!(Fmt::from(Query(q)), Fmt::Json);
    }

    #[test]
    fn render_rows_aligns_columns_by_widest_cell() {
        let rows = vec![
            json!({ "domain": "a.mesh", "rx": 1 }),
            json!({ "domain": "much-longer.mesh", "rx": 2 }),
        ];
        let table = render_rows(&rows);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 4); // header, separator, 2 rows
        assert!(lines[0].starts_with("domain"));
    }

    #[test]
    fn render_rows_on_empty_array_does_not_panic() {
        assert_eq!(render_rows(&[]), "");
    }
}
