use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use rust_xlsxwriter::{Color, Format, FormatBorder, Workbook};
use tracing::info;

use crate::error::ExportError;
use crate::extract::{project_for_display, title_case};
use crate::models::{Record, RATING_FIELDS, RECOMMENDATION_FIELD};
use crate::units::Unit;

pub const NO_RECORDS_NOTICE: &str = "No records to export.";

/// Bookkeeping fields never exported.
const META_FIELDS: [&str; 3] = ["id", "createdBy", "updatedAt"];

/// Excel rejects longer cell strings.
pub const MAX_CELL_CHARS: usize = 32_767;
pub const TRUNCATION_MARK: &str = " [truncated]";

const MIN_COLUMN_WIDTH: usize = 10;
const MAX_COLUMN_WIDTH: usize = 50;

/// Header words shortened so a print table fits an A4 landscape page.
const PRINT_ABBREVIATIONS: [(&str, &str); 18] = [
    ("Date Of ", "Date "),
    ("Registration", "Reg."),
    ("Number", "No."),
    ("Municipality", "Mun."),
    ("Province", "Prov."),
    ("Establishment", "Estab."),
    ("Certificate", "Cert."),
    ("Accreditation", "Accred."),
    ("Classification", "Class."),
    ("Application", "Appl."),
    ("Inspection", "Insp."),
    ("Surveillance", "Surv."),
    ("Vaccination", "Vacc."),
    ("Collection", "Coll."),
    ("Collected", "Coll."),
    ("Quantity", "Qty"),
    ("Slaughtered", "Slaught."),
    ("Requested", "Req."),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Spreadsheet,
    Word,
    Print,
}

impl ExportKind {
    pub fn file_name(self, collection: &str, at: DateTime<Local>) -> String {
        let stamp = at.format("%Y%m%d_%H%M");
        match self {
            ExportKind::Spreadsheet => format!("Records_{collection}_{stamp}.xlsx"),
            ExportKind::Word => format!("Records_{collection}_{stamp}.doc"),
            ExportKind::Print => format!("Print_{collection}_{stamp}.html"),
        }
    }

    fn keeps_ratings(self) -> bool {
        matches!(self, ExportKind::Word)
    }
}

fn is_excluded(key: &str, kind: ExportKind) -> bool {
    META_FIELDS.contains(&key)
        || (!kind.keeps_ratings() && (RATING_FIELDS.contains(&key) || key == RECOMMENDATION_FIELD))
}

/// Column keys: the unit's configured order, then any other observed keys.
pub fn select_columns(
    unit: &Unit,
    rows: &[BTreeMap<String, String>],
    kind: ExportKind,
) -> Vec<String> {
    let mut columns: Vec<String> = unit
        .configured_columns()
        .into_iter()
        .filter(|key| !is_excluded(key, kind))
        .map(str::to_string)
        .collect();

    let observed: BTreeSet<&String> = rows.iter().flat_map(|row| row.keys()).collect();
    for key in observed {
        if !is_excluded(key, kind) && !columns.contains(key) {
            columns.push(key.clone());
        }
    }

    columns
}

/// Rows projected and aligned to `columns`; missing cells are empty.
fn aligned_rows(columns: &[String], rows: &[BTreeMap<String, String>]) -> Vec<Vec<String>> {
    rows.iter()
        .map(|row| {
            columns
                .iter()
                .map(|key| row.get(key).cloned().unwrap_or_default())
                .collect()
        })
        .collect()
}

fn fit_cell(cell: String) -> String {
    if cell.chars().count() <= MAX_CELL_CHARS {
        return cell;
    }
    let keep = MAX_CELL_CHARS - TRUNCATION_MARK.chars().count();
    let mut fitted: String = cell.chars().take(keep).collect();
    fitted.push_str(TRUNCATION_MARK);
    fitted
}

#[derive(Debug, Clone, PartialEq)]
pub struct SheetLayout {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub widths: Vec<f64>,
}

fn column_width(header: &str, cells: impl Iterator<Item = usize>) -> f64 {
    let longest = cells.fold(header.chars().count(), usize::max);
    (longest + 2).clamp(MIN_COLUMN_WIDTH, MAX_COLUMN_WIDTH) as f64
}

pub fn spreadsheet_layout(unit: &Unit, records: &[&Record]) -> SheetLayout {
    if records.is_empty() {
        return SheetLayout {
            headers: Vec::new(),
            rows: vec![vec![NO_RECORDS_NOTICE.to_string()]],
            widths: vec![column_width(NO_RECORDS_NOTICE, std::iter::empty())],
        };
    }

    let projected: Vec<_> = records.iter().map(|record| project_for_display(record)).collect();
    let columns = select_columns(unit, &projected, ExportKind::Spreadsheet);
    let rows: Vec<Vec<String>> = aligned_rows(&columns, &projected)
        .into_iter()
        .map(|row| row.into_iter().map(fit_cell).collect())
        .collect();
    let headers: Vec<String> = columns.iter().map(|key| title_case(key)).collect();
    let widths = headers
        .iter()
        .enumerate()
        .map(|(index, header)| {
            column_width(header, rows.iter().map(|row| row[index].chars().count()))
        })
        .collect();

    SheetLayout {
        headers,
        rows,
        widths,
    }
}

pub fn render_spreadsheet(layout: &SheetLayout) -> Result<Vec<u8>, ExportError> {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name("Records")?;

    let header_format = Format::new()
        .set_bold()
        .set_font_color(Color::White)
        .set_background_color(Color::RGB(0x1F4E78))
        .set_border(FormatBorder::Thin);

    let mut first_row = 0u32;
    if !layout.headers.is_empty() {
        for (col, header) in layout.headers.iter().enumerate() {
            worksheet.write_string_with_format(0, col as u16, header, &header_format)?;
        }
        worksheet.set_freeze_panes(1, 0)?;
        first_row = 1;
    }

    for (offset, row) in layout.rows.iter().enumerate() {
        for (col, cell) in row.iter().enumerate() {
            worksheet.write_string(first_row + offset as u32, col as u16, cell)?;
        }
    }

    for (col, width) in layout.widths.iter().enumerate() {
        worksheet.set_column_width(col as u16, *width)?;
    }

    Ok(workbook.save_to_buffer()?)
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

fn html_table(headers: &[String], rows: &[Vec<String>]) -> String {
    let mut table = String::from("<table>\n<thead><tr>");
    for header in headers {
        let _ = write!(table, "<th>{}</th>", escape_html(header));
    }
    table.push_str("</tr></thead>\n<tbody>\n");
    for row in rows {
        table.push_str("<tr>");
        for cell in row {
            let _ = write!(table, "<td>{}</td>", escape_html(cell));
        }
        table.push_str("</tr>\n");
    }
    table.push_str("</tbody>\n</table>");
    table
}

fn table_parts(unit: &Unit, records: &[&Record], kind: ExportKind) -> (Vec<String>, Vec<Vec<String>>) {
    let projected: Vec<_> = records.iter().map(|record| project_for_display(record)).collect();
    let columns = select_columns(unit, &projected, kind);
    let rows = aligned_rows(&columns, &projected);
    (columns, rows)
}

/// HTML document that word processors open as a `.doc` file.
pub fn build_word_document(unit: &Unit, records: &[&Record], at: DateTime<Local>) -> String {
    let mut output = String::new();
    let title = escape_html(unit.label);

    let _ = writeln!(
        output,
        "<html xmlns:o=\"urn:schemas-microsoft-com:office:office\" \
         xmlns:w=\"urn:schemas-microsoft-com:office:word\" \
         xmlns=\"http://www.w3.org/TR/REC-html40\">"
    );
    let _ = writeln!(output, "<head><meta charset=\"utf-8\"><title>{title} Records</title>");
    let _ = writeln!(
        output,
        "<style>body {{ font-family: Calibri, Arial, sans-serif; font-size: 10pt; }} \
         table {{ border-collapse: collapse; width: 100%; }} \
         th, td {{ border: 1px solid #444; padding: 4px; vertical-align: top; }} \
         th {{ background: #1F4E78; color: #FFFFFF; }}</style></head>"
    );
    let _ = writeln!(output, "<body>");
    let _ = writeln!(output, "<h2>{title} Records</h2>");
    let _ = writeln!(
        output,
        "<p>Generated {} &middot; {} record(s)</p>",
        at.format("%Y-%m-%d %H:%M"),
        records.len()
    );

    if records.is_empty() {
        let _ = writeln!(output, "<p>{NO_RECORDS_NOTICE}</p>");
    } else {
        let (columns, rows) = table_parts(unit, records, ExportKind::Word);
        let headers: Vec<String> = columns.iter().map(|key| title_case(key)).collect();
        let _ = writeln!(output, "{}", html_table(&headers, &rows));
    }

    let _ = writeln!(output, "</body>\n</html>");
    output
}

pub fn abbreviate_header(label: &str) -> String {
    PRINT_ABBREVIATIONS
        .iter()
        .fold(label.to_string(), |label, (long, short)| label.replace(long, short))
}

/// A4-landscape printable table that opens the print dialog when loaded.
pub fn build_print_document(unit: &Unit, records: &[&Record], at: DateTime<Local>) -> String {
    let mut output = String::new();
    let title = escape_html(unit.label);

    let _ = writeln!(output, "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\">");
    let _ = writeln!(output, "<title>{title} Records</title>");
    let _ = writeln!(
        output,
        "<style>@page {{ size: A4 landscape; margin: 10mm; }} \
         body {{ font-family: Arial, sans-serif; font-size: 8pt; }} \
         table {{ border-collapse: collapse; width: 100%; table-layout: fixed; }} \
         th, td {{ border: 1px solid #000; padding: 2px; word-wrap: break-word; }} \
         th {{ background: #DDDDDD; }}</style>"
    );
    let _ = writeln!(
        output,
        "<script>window.onload = function () {{ window.print(); }};</script>\n</head>\n<body>"
    );
    let _ = writeln!(
        output,
        "<h3>{title} &middot; printed {}</h3>",
        at.format("%Y-%m-%d %H:%M")
    );

    if records.is_empty() {
        let _ = writeln!(output, "<p>{NO_RECORDS_NOTICE}</p>");
    } else {
        let (columns, rows) = table_parts(unit, records, ExportKind::Print);
        let headers: Vec<String> = columns
            .iter()
            .map(|key| abbreviate_header(&title_case(key)))
            .collect();
        let _ = writeln!(output, "{}", html_table(&headers, &rows));
    }

    let _ = writeln!(output, "</body>\n</html>");
    output
}

pub fn export(
    kind: ExportKind,
    unit: &Unit,
    records: &[&Record],
    dir: &Path,
    at: DateTime<Local>,
) -> Result<PathBuf, ExportError> {
    let path = dir.join(kind.file_name(unit.id, at));

    match kind {
        ExportKind::Spreadsheet => {
            let bytes = render_spreadsheet(&spreadsheet_layout(unit, records))?;
            std::fs::write(&path, bytes)?;
        }
        ExportKind::Word => std::fs::write(&path, build_word_document(unit, records, at))?,
        ExportKind::Print => std::fs::write(&path, build_print_document(unit, records, at))?,
    }

    info!(unit = unit.id, records = records.len(), path = %path.display(), "export written");
    Ok(path)
}

pub fn open_preview(path: &Path) -> Result<(), ExportError> {
    #[cfg(target_os = "macos")]
    let mut command = std::process::Command::new("open");
    #[cfg(target_os = "windows")]
    let mut command = {
        let mut command = std::process::Command::new("cmd");
        command.args(["/C", "start", ""]);
        command
    };
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let mut command = std::process::Command::new("xdg-open");

    let status = command
        .arg(path)
        .status()
        .map_err(|e| ExportError::Preview(e.to_string()))?;

    if !status.success() {
        return Err(ExportError::Preview(format!("opener exited with {status}")));
    }
    Ok(())
}
