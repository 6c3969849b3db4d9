// SPDX-License-Identifier: MIT OR Apache-2.0
//! Aggregate and pivot queries over record sets.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Aggregate measure: record count or a numeric field sum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Measure {
    /// Count matching records.
    Count,
    /// Sum a numeric field.
    Sum(String),
}

impl Measure {
    /// Parse `count` or `sum:<field>`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        if raw == "count" {
            return Some(Self::Count);
        }
        raw.strip_prefix("sum:")
            .filter(|field| !field.is_empty())
            .map(|field| Self::Sum(field.to_string()))
    }

    fn apply(&self, records: &[&Value]) -> f64 {
        match self {
            Measure::Count => records.len() as f64,
            Measure::Sum(field) => records
                .iter()
                .filter_map(|record| record.get(field).and_then(Value::as_f64))
                .sum(),
        }
    }
}

/// One aggregate bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    /// Group key (stringified field value; `""` for missing).
    pub group: String,
    /// Measure value.
    pub value: f64,
}

/// One pivot cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotCell {
    /// Row group key.
    pub row: String,
    /// Column group key.
    pub col: String,
    /// Measure value.
    pub value: f64,
}

fn group_key(record: &Value, field: &str) -> String {
    match record.get(field) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Group records by a field and compute a measure per group. Groups are
/// ordered by key.
#[must_use]
pub fn aggregate(records: &[Value], group_by: &str, measure: &Measure) -> Vec<AggregateRow> {
    let mut groups: BTreeMap<String, Vec<&Value>> = BTreeMap::new();
    for record in records {
        groups.entry(group_key(record, group_by)).or_default().push(record);
    }
    groups
        .into_iter()
        .map(|(group, members)| AggregateRow {
            group,
            value: measure.apply(&members),
        })
        .collect()
}

/// Two-dimensional grouping with a measure per cell. Cells are ordered by
/// `(row, col)`.
#[must_use]
pub fn pivot(
    records: &[Value],
    row_group_by: &str,
    col_group_by: &str,
    measure: &Measure,
) -> Vec<PivotCell> {
    let mut cells: BTreeMap<(String, String), Vec<&Value>> = BTreeMap::new();
    for record in records {
        let key = (group_key(record, row_group_by), group_key(record, col_group_by));
        cells.entry(key).or_default().push(record);
    }
    cells
        .into_iter()
        .map(|((row, col), members)| PivotCell {
            row,
            col,
            value: measure.apply(&members),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records() -> Vec<Value> {
        vec![
            json!({"job.status": "draft", "job.hours": 2}),
            json!({"job.status": "draft", "job.hours": 3}),
            json!({"job.status": "done", "job.hours": 5}),
        ]
    }

    #[test]
    fn count_by_group() {
        let rows = aggregate(&records(), "job.status", &Measure::Count);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].group, "draft");
        assert_eq!(rows[1].value, 2.0);
    }

    #[test]
    fn sum_by_group() {
        let measure = Measure::parse("sum:job.hours").unwrap();
        let rows = aggregate(&records(), "job.status", &measure);
        let draft = rows.iter().find(|r| r.group == "draft").unwrap();
        assert_eq!(draft.value, 5.0);
    }

    #[test]
    fn pivot_cells() {
        let records = vec![
            json!({"a": "x", "b": "1"}),
            json!({"a": "x", "b": "2"}),
            json!({"a": "y", "b": "1"}),
        ];
        let cells = pivot(&records, "a", "b", &Measure::Count);
        assert_eq!(cells.len(), 3);
        assert_eq!(cells[0], PivotCell { row: "x".into(), col: "1".into(), value: 1.0 });
    }

    #[test]
    fn unknown_measure_rejected() {
        assert_eq!(Measure::parse("avg:x"), None);
        assert_eq!(Measure::parse("sum:"), None);
    }
}
