//! Plain-text rendering of interactive elements
//!
//! Used for previews and for clients that cannot draw the structured
//! widgets. Every variant is matched explicitly.

use super::elements::{
    ButtonsElement, ColumnMappingElement, ConfirmationElement, FileAnalysisElement,
    ImportResultElement, InteractiveElement, PreviewTableElement,
};
use std::fmt::Write;

/// Rows of a preview table included in the text rendering
const PREVIEW_TEXT_ROWS: usize = 5;

/// Render one element; `None` for elements that have no visible form
pub fn render_element(element: &InteractiveElement) -> Option<String> {
    match element {
        InteractiveElement::Buttons(b) => Some(render_buttons(b)),
        InteractiveElement::Confirmation(c) => Some(render_confirmation(c)),
        InteractiveElement::FileAnalysis(f) => Some(render_file_analysis(f)),
        InteractiveElement::ColumnMapping(m) => Some(render_column_mapping(m)),
        InteractiveElement::PreviewTable(p) => Some(render_preview_table(p)),
        InteractiveElement::ImportResult(r) => Some(render_import_result(r)),
        InteractiveElement::Unknown => None,
    }
}

/// Render a list of elements, separated by blank lines
pub fn render_elements(elements: &[InteractiveElement]) -> String {
    elements
        .iter()
        .filter_map(render_element)
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Brazilian currency formatting, e.g. `R$ 1.520,50`
pub fn format_brl(amount: f64) -> String {
    let negative = amount < 0.0;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let cents = (amount.abs() * 100.0).round() as u64;
    let reais = (cents / 100).to_string();

    let mut grouped = String::new();
    for (i, ch) in reais.chars().enumerate() {
        if i > 0 && (reais.len() - i).is_multiple_of(3) {
            grouped.push('.');
        }
        grouped.push(ch);
    }

    let sign = if negative { "-" } else { "" };
    format!("{sign}R$ {grouped},{:02}", cents % 100)
}

fn render_buttons(b: &ButtonsElement) -> String {
    let mut out = b.question.clone();
    for option in &b.options {
        let marker = if b.selected.as_deref() == Some(option.value.as_str()) {
            "[x]"
        } else {
            "[ ]"
        };
        let _ = write!(out, "\n{marker} {}", option.label);
    }
    out
}

fn render_confirmation(c: &ConfirmationElement) -> String {
    let mut out = c.title.clone();
    if !c.description.is_empty() {
        let _ = write!(out, "\n{}", c.description);
    }
    for row in &c.details {
        let _ = write!(out, "\n- {}: {}", row.label, row.value);
    }
    let confirm = c.confirm_label.as_deref().unwrap_or("Confirmar");
    let cancel = c.cancel_label.as_deref().unwrap_or("Cancelar");
    let _ = write!(out, "\n[{confirm}] [{cancel}]");
    out
}

fn render_file_analysis(f: &FileAnalysisElement) -> String {
    let mut out = format!(
        "Arquivo {}: {} linhas, {} colunas",
        f.filename, f.row_count, f.column_count
    );
    for column in &f.columns {
        let _ = write!(
            out,
            "\n- {} ({}, {:.0}%)",
            column.name,
            column.detected_type,
            column.confidence * 100.0
        );
    }
    if let Some(category) = &f.suggested_category {
        let _ = write!(out, "\nCategoria sugerida: {category}");
    }
    out
}

fn render_column_mapping(m: &ColumnMappingElement) -> String {
    let mut out = String::from("Mapeamento de colunas");
    for mapping in &m.mappings {
        let target = mapping.suggested_field.as_deref().unwrap_or("(ignorar)");
        let _ = write!(out, "\n- {} -> {}", mapping.source_column, target);
    }
    if !m.is_complete() {
        let _ = write!(
            out,
            "\nCampos obrigatórios sem coluna: {}",
            m.missing_required.join(", ")
        );
    }
    out
}

fn render_preview_table(p: &PreviewTableElement) -> String {
    let mut out = format!(
        "Prévia: {} registros ({} válidos, {} com erro), total {}",
        p.total_rows,
        p.valid_rows,
        p.invalid_rows,
        format_brl(p.total_amount)
    );
    for row in p.rows.iter().take(PREVIEW_TEXT_ROWS) {
        let fields = row
            .data
            .iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => format!("{k}={s}"),
                other => format!("{k}={other}"),
            })
            .collect::<Vec<_>>()
            .join(", ");
        let status = if row.valid { "ok" } else { "erro" };
        let _ = write!(out, "\n[{status}] {fields}");
        for error in &row.errors {
            let _ = write!(out, " ({error})");
        }
    }
    let hidden = p.hidden_rows() + (p.rows.len().saturating_sub(PREVIEW_TEXT_ROWS)) as u64;
    if hidden > 0 {
        let _ = write!(out, "\n... mais {hidden} registros");
    }
    out
}

fn render_import_result(r: &ImportResultElement) -> String {
    let mut out = format!(
        "Importação concluída: {} importados, {} com falha, {} ignorados. Total {}",
        r.imported,
        r.failed,
        r.skipped,
        format_brl(r.total_value)
    );
    for error in &r.errors {
        match error.row {
            Some(row) => {
                let _ = write!(out, "\n- linha {row}: {}", error.message);
            }
            None => {
                let _ = write!(out, "\n- {}", error.message);
            }
        }
    }
    out
}
