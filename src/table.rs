//! Plain-text tables for CLI summaries.

use std::{borrow::Cow, fmt::Write as _};

use crate::{
    cohort::Cohort,
    compare::ComparisonResult,
    infer::ColumnProfile,
    remap::RemapPlan,
    schema::MasterDataset,
};

#[derive(Debug, Clone, Default)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new<S: Into<String>>(headers: impl IntoIterator<Item = S>) -> Self {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push_row<S: Into<String>>(&mut self, cells: impl IntoIterator<Item = S>) {
        self.rows.push(cells.into_iter().map(Into::into).collect());
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn render(&self) -> String {
        let mut widths = self
            .headers
            .iter()
            .map(|h| display_width(h).max(3))
            .collect::<Vec<_>>();
        for row in &self.rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(display_width(&sanitize_cell(cell)));
            }
        }

        let mut output = String::new();
        let _ = writeln!(output, "{}", format_row(&self.headers, &widths));
        let rule = widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>();
        let _ = writeln!(output, "{}", format_row(&rule, &widths));
        for row in &self.rows {
            let _ = writeln!(output, "{}", format_row(row, &widths));
        }
        output
    }

    pub fn print(&self) {
        print!("{}", self.render());
    }
}

fn format_row(values: &[String], widths: &[usize]) -> String {
    let line = values
        .iter()
        .zip(widths)
        .map(|(value, width)| {
            let cell = sanitize_cell(value);
            let padding = width.saturating_sub(display_width(&cell));
            format!("{cell}{}", " ".repeat(padding))
        })
        .collect::<Vec<_>>()
        .join("  ");
    line.trim_end().to_string()
}

/// Character count ignoring ANSI colour sequences.
fn display_width(value: &str) -> usize {
    let mut width = 0usize;
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch == '\u{1b}' {
            for next in chars.by_ref() {
                if next == 'm' {
                    break;
                }
            }
        } else {
            width += 1;
        }
    }
    width
}

fn sanitize_cell(value: &str) -> Cow<'_, str> {
    if value.contains(['\n', '\r', '\t']) {
        Cow::Owned(value.replace(['\n', '\r', '\t'], " "))
    } else {
        Cow::Borrowed(value)
    }
}

fn percent(value: f64) -> String {
    format!("{value:.1}%")
}

/// Inferred column types, shown before any filter references them.
pub fn schema_table(dataset: &MasterDataset, profiles: &[ColumnProfile]) -> Table {
    let mut table = Table::new(["column", "type", "sampled", "distinct", "example"]);
    for column in &dataset.columns {
        let profile = profiles.iter().find(|p| p.name == column.name);
        table.push_row([
            column.name.clone(),
            column.column_type.tag().to_string(),
            profile.map_or_else(String::new, |p| p.sampled.to_string()),
            profile.map_or_else(String::new, |p| p.distinct.to_string()),
            profile
                .and_then(|p| p.example.clone())
                .unwrap_or_default(),
        ]);
    }
    table
}

pub fn cohort_table(cohorts: &[Cohort]) -> Table {
    let mut table = Table::new(["id", "name", "dataset", "patients", "rules", "updated"]);
    for cohort in cohorts {
        table.push_row([
            cohort.id.clone(),
            cohort.name.clone(),
            cohort.master_dataset_id.clone(),
            cohort.patient_count.to_string(),
            cohort.filter.rule_count().to_string(),
            cohort.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }
    table
}

pub fn remap_table(plan: &RemapPlan) -> Table {
    let mut table = Table::new(["field", "target", "confidence", "status", "rejected"]);
    for mapping in plan.mappings() {
        let rejected = mapping
            .rejected
            .iter()
            .map(|r| r.target_field.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        table.push_row([
            mapping.source_field.clone(),
            mapping.target_field.clone().unwrap_or_else(|| "-".to_string()),
            mapping
                .confidence
                .map_or_else(|| "-".to_string(), |c| format!("{c:.2}")),
            format!("{:?}", mapping.status),
            rejected,
        ]);
    }
    table
}

/// Per-cohort statistics followed by pairwise overlaps.
pub fn comparison_tables(result: &ComparisonResult) -> (Table, Table) {
    let mut stats = Table::new(["cohort", "name", "patients", "master", "match rate", "rules"]);
    for stat in &result.per_cohort {
        stats.push_row([
            stat.cohort_id.clone(),
            stat.name.clone(),
            stat.patient_count.to_string(),
            stat.master_patient_count.to_string(),
            percent(stat.match_rate),
            stat.filter_rule_count.to_string(),
        ]);
    }
    let mut pairs = Table::new(["a", "b", "overlap", "only a", "only b", "overlap %"]);
    for pair in &result.pairwise {
        pairs.push_row([
            pair.cohort_a.clone(),
            pair.cohort_b.clone(),
            pair.overlap.to_string(),
            pair.unique_a.to_string(),
            pair.unique_b.to_string(),
            percent(pair.overlap_percent),
        ]);
    }
    (stats, pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_align_to_the_widest_cell() {
        let mut table = Table::new(["id", "patients"]);
        table.push_row(["cohort-a", "12"]);
        table.push_row(["b", "3"]);
        let rendered = table.render();
        let lines = rendered.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], "id        patients");
        assert_eq!(lines[1], "--------  --------");
        assert_eq!(lines[2], "cohort-a  12");
        assert_eq!(lines[3], "b         3");
    }

    #[test]
    fn control_characters_and_ansi_codes_do_not_break_layout() {
        let mut table = Table::new(["note"]);
        table.push_row(["line\nbreak"]);
        table.push_row(["\u{1b}[31mred\u{1b}[0m"]);
        let rendered = table.render();
        assert!(rendered.contains("line break"));
        assert_eq!(display_width("\u{1b}[31mred\u{1b}[0m"), 3);
    }
}
