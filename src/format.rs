//! Output formatting for report cells and header metadata.

use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::{json, Map, Value as Json};

use crate::value::{from_epoch_days, Value};

const DATE_FORMAT: &str = "%m/%d/%Y";

/// How formatted cells are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Human-facing, with digit grouping.
    #[default]
    Display,
    /// Spreadsheet export, without digit grouping.
    Csv,
    /// The unformatted value as JSON.
    Raw,
}

impl std::str::FromStr for OutputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "display" | "html" => Ok(Self::Display),
            "csv" => Ok(Self::Csv),
            "raw" => Ok(Self::Raw),
            other => Err(format!("unknown output mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FormatKind {
    Plain,
    Hidden,
    String { truncate: Option<usize>, title: bool },
    Integer { grouping: bool },
    Float { precision: u32, grouping: bool },
    Bling,
    Percent { precision: u32 },
    Boolean { yes: String, no: String, none: String },
    Epoch,
    Date,
    Json,
}

/// Presentation of a column: label, alignment, and cell formatting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    kind: FormatKind,
    label: Option<String>,
    align: Alignment,
}

impl Format {
    fn of(kind: FormatKind, align: Alignment) -> Self {
        Self {
            kind,
            label: None,
            align,
        }
    }

    /// Displays the value as-is.
    pub fn plain() -> Self {
        Self::of(FormatKind::Plain, Alignment::Left)
    }

    /// Not shown to the user. The default for columns with no format.
    pub fn hidden() -> Self {
        Self::of(FormatKind::Hidden, Alignment::Left)
    }

    pub fn string() -> Self {
        Self::of(
            FormatKind::String {
                truncate: None,
                title: false,
            },
            Alignment::Left,
        )
    }

    pub fn integer() -> Self {
        Self::of(FormatKind::Integer { grouping: true }, Alignment::Right)
    }

    pub fn float(precision: u32) -> Self {
        Self::of(
            FormatKind::Float {
                precision,
                grouping: true,
            },
            Alignment::Right,
        )
    }

    /// Currency: dollars and cents.
    pub fn bling() -> Self {
        Self::of(FormatKind::Bling, Alignment::Right)
    }

    /// A value already expressed in percent, one decimal place by default.
    pub fn percent() -> Self {
        Self::of(FormatKind::Percent { precision: 1 }, Alignment::Right)
    }

    pub fn boolean() -> Self {
        Self::of(
            FormatKind::Boolean {
                yes: "Yes".into(),
                no: "No".into(),
                none: String::new(),
            },
            Alignment::Left,
        )
    }

    /// Whole days since the Unix epoch, shown as a date.
    pub fn epoch() -> Self {
        Self::of(FormatKind::Epoch, Alignment::Left)
    }

    pub fn date() -> Self {
        Self::of(FormatKind::Date, Alignment::Left)
    }

    pub fn json() -> Self {
        Self::of(FormatKind::Json, Alignment::Left)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_align(mut self, align: Alignment) -> Self {
        self.align = align;
        self
    }

    /// Disables thousands separators for integer and float formats.
    pub fn without_grouping(mut self) -> Self {
        match &mut self.kind {
            FormatKind::Integer { grouping } | FormatKind::Float { grouping, .. } => {
                *grouping = false
            }
            _ => {}
        }
        self
    }

    pub fn with_precision(mut self, digits: u32) -> Self {
        match &mut self.kind {
            FormatKind::Percent { precision } | FormatKind::Float { precision, .. } => {
                *precision = digits
            }
            _ => {}
        }
        self
    }

    /// Truncates long strings, ending with an ellipsis when room allows.
    pub fn with_truncate(mut self, length: usize) -> Self {
        if let FormatKind::String { truncate, .. } = &mut self.kind {
            *truncate = Some(length);
        }
        self
    }

    pub fn with_title_case(mut self) -> Self {
        if let FormatKind::String { title, .. } = &mut self.kind {
            *title = true;
        }
        self
    }

    /// Terms for true, false, and missing boolean cells.
    pub fn with_terms(mut self, yes: &str, no: &str, none: &str) -> Self {
        if let FormatKind::Boolean {
            yes: y,
            no: n,
            none: e,
        } = &mut self.kind
        {
            *y = yes.to_string();
            *n = no.to_string();
            *e = none.to_string();
        }
        self
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub(crate) fn set_default_label(&mut self, label: String) {
        if self.label.is_none() {
            self.label = Some(label);
        }
    }

    pub fn is_hidden(&self) -> bool {
        self.kind == FormatKind::Hidden
    }

    /// Whether sorting compares cells as text rather than numbers.
    pub fn sort_alpha(&self) -> bool {
        matches!(
            self.kind,
            FormatKind::Plain
                | FormatKind::String { .. }
                | FormatKind::Boolean { .. }
                | FormatKind::Json
        )
    }

    fn data_type(&self) -> &'static str {
        match self.kind {
            FormatKind::Plain => "format",
            FormatKind::Hidden => "hidden",
            FormatKind::String { .. } => "string",
            FormatKind::Integer { .. } => "integer",
            FormatKind::Float { .. } => "float",
            FormatKind::Bling => "bling",
            FormatKind::Percent { .. } => "percent",
            FormatKind::Boolean { .. } => "boolean",
            FormatKind::Epoch => "epoch",
            FormatKind::Date => "date",
            FormatKind::Json => "json",
        }
    }

    /// Column metadata for table headers.
    pub fn header_info(&self) -> Map<String, Json> {
        let mut info = Map::new();
        info.insert("label".into(), json!(self.label));
        info.insert("sortable".into(), json!(true));
        info.insert("data_type".into(), json!(self.data_type()));
        if self.align == Alignment::Right {
            info.insert("className".into(), json!("num"));
        }
        if self.is_hidden() {
            info.insert("hidden".into(), json!(true));
        }
        info
    }

    /// Formats one cell.
    ///
    /// Display and CSV modes always produce a string; numeric formats show
    /// a missing cell as zero. Raw mode passes the value through.
    pub fn format(&self, cell: Option<&Value>, mode: OutputMode) -> Json {
        if mode == OutputMode::Raw {
            return cell.map_or(Json::Null, Value::to_json);
        }
        let grouped = mode == OutputMode::Display;
        Json::String(self.format_text(cell, grouped))
    }

    fn format_text(&self, cell: Option<&Value>, grouped: bool) -> String {
        match &self.kind {
            FormatKind::Plain | FormatKind::Hidden | FormatKind::Json => {
                cell.map(ToString::to_string).unwrap_or_default()
            }
            FormatKind::String { truncate, title } => {
                let text = cell.map(ToString::to_string).unwrap_or_default();
                let text = if *title { title_case(&text) } else { text };
                match truncate {
                    Some(length) => truncate_text(&text, *length),
                    None => text,
                }
            }
            FormatKind::Integer { grouping } => {
                let value = decimal_of(cell).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
                fixed(value, 0, grouped && *grouping)
            }
            FormatKind::Float {
                precision,
                grouping,
            } => fixed(decimal_of(cell), *precision, grouped && *grouping),
            FormatKind::Bling => {
                let value = decimal_of(cell);
                let text = fixed(value.abs(), 2, grouped);
                if value.is_sign_negative() && !value.is_zero() {
                    format!("-${text}")
                } else {
                    format!("${text}")
                }
            }
            FormatKind::Percent { precision } => {
                format!("{}%", fixed(decimal_of(cell), *precision, false))
            }
            FormatKind::Boolean { yes, no, none } => match cell {
                Some(value) if value.is_truthy() => yes.clone(),
                Some(_) => no.clone(),
                None => none.clone(),
            },
            FormatKind::Epoch => cell
                .and_then(Value::as_i64)
                .and_then(from_epoch_days)
                .map(format_date)
                .unwrap_or_default(),
            FormatKind::Date => match cell {
                Some(Value::Date(date)) => format_date(*date),
                Some(other) => other
                    .as_i64()
                    .and_then(from_epoch_days)
                    .map(format_date)
                    .unwrap_or_else(|| other.to_string()),
                None => String::new(),
            },
        }
    }
}

impl Default for Format {
    fn default() -> Self {
        Self::hidden()
    }
}

fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn decimal_of(cell: Option<&Value>) -> Decimal {
    cell.and_then(Value::as_decimal).unwrap_or_default()
}

/// Fixed-point rendering with optional thousands separators.
fn fixed(value: Decimal, precision: u32, grouping: bool) -> String {
    let rounded = value.round_dp_with_strategy(precision, RoundingStrategy::MidpointAwayFromZero);
    let text = format!("{:.*}", precision as usize, rounded);
    if !grouping {
        return text;
    }
    let (sign, digits) = match text.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", text.as_str()),
    };
    let (whole, fraction) = match digits.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (digits, None),
    };
    let mut grouped = String::with_capacity(text.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    match fraction {
        Some(fraction) => format!("{sign}{grouped}.{fraction}"),
        None => format!("{sign}{grouped}"),
    }
}

fn truncate_text(text: &str, length: usize) -> String {
    if text.chars().count() <= length {
        return text.to_string();
    }
    if length > 3 {
        let kept: String = text.chars().take(length - 3).collect();
        format!("{kept}...")
    } else {
        text.chars().take(length).collect()
    }
}

fn title_case(text: &str) -> String {
    text.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
