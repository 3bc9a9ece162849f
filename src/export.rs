use axum::{
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
};
use serde_json::Value;

use crate::store::get_path;

/// One CSV column: header text and the dotted document path it reads.
#[derive(Debug, Clone, Copy)]
pub struct CsvColumn {
    pub header: &'static str,
    pub path: &'static str,
}

const fn col(header: &'static str, path: &'static str) -> CsvColumn {
    CsvColumn { header, path }
}

pub const LEAD_COLUMNS: [CsvColumn; 13] = [
    col("Id", "_id"),
    col("Name", "name"),
    col("Email", "email"),
    col("Mobile", "mobile"),
    col("State", "state_code"),
    col("City", "city"),
    col("Course", "course_name"),
    col("Lead Source", "lead_source"),
    col("Lead Stage", "lead_stage"),
    col("Counselor Id", "counselor_id"),
    col("12th Score", "twelve_score"),
    col("Payment Status", "payment_status"),
    col("Created At", "created_at"),
];

pub fn escape_csv(s: &str) -> String {
    // quotes doubled, line breaks and other control chars flattened to spaces
    s.chars()
        .flat_map(|c| match c {
            '"' => vec!['"', '"'],
            c if c.is_control() => vec![' '],
            c => vec![c],
        })
        .collect()
}

fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => {
            items.iter().map(|v| cell_text(Some(v))).collect::<Vec<_>>().join("; ")
        }
        Some(other) => other.to_string(),
    }
}

/// Header row, then one row per document. Every field is quoted.
pub fn to_csv(columns: &[CsvColumn], docs: &[Value]) -> String {
    let mut out = String::new();
    let header: Vec<String> = columns.iter().map(|c| format!("\"{}\"", escape_csv(c.header))).collect();
    out.push_str(&header.join(","));
    out.push('\n');
    for doc in docs {
        let row: Vec<String> = columns
            .iter()
            .map(|c| format!("\"{}\"", escape_csv(&cell_text(get_path(doc, c.path)))))
            .collect();
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

/// Wraps CSV text in a download response.
pub fn csv_response(body: String, filename: &str) -> Response {
    let mut response = body.into_response();
    response.headers_mut().insert(header::CONTENT_TYPE, HeaderValue::from_static("text/csv; charset=utf-8"));
    let disposition = format!("attachment; filename=\"{}\"", filename);
    if let Ok(header_val) = HeaderValue::from_str(&disposition) {
        response.headers_mut().insert(header::CONTENT_DISPOSITION, header_val);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn escapes_quotes_and_controls() {
        assert_eq!(escape_csv("say \"hi\""), "say \"\"hi\"\"");
        assert_eq!(escape_csv("a\nb\r\tc"), "a b  c");
    }

    #[test]
    fn rows_follow_columns() {
        let columns = [col("Name", "name"), col("City", "address.city"), col("Tags", "tags"), col("Score", "score")];
        let docs = vec![
            json!({"name": "Asha \"A\"", "address": {"city": "Pune"}, "tags": ["x", "y"], "score": 88}),
            json!({"name": "Ravi"}),
        ];
        let csv = to_csv(&columns, &docs);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "\"Name\",\"City\",\"Tags\",\"Score\"");
        assert_eq!(lines[1], "\"Asha \"\"A\"\"\",\"Pune\",\"x; y\",\"88\"");
        assert_eq!(lines[2], "\"Ravi\",\"\",\"\",\"\"");
        assert_eq!(lines.len(), 3);
    }
}
