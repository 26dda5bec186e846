//! User input widgets.
//!
//! A widget turns one raw form value into a cleaned [`Value`] or a
//! [`ValidationError`]. Rendering is left to the frontend; [`Widget::describe`]
//! exposes what it needs as JSON.

use chrono::{Days, NaiveDate, Utc};
use serde_json::{json, Value as Json};

use crate::error::ValidationError;
use crate::value::{month_start, Value};

pub const DEFAULT_DATE_FORMAT: &str = "%m/%d/%Y";

/// A select option: the cleaned value (`None` for a blank choice) and the
/// label shown to the user.
pub type Choice = (Option<Value>, String);

#[derive(Debug, Clone, PartialEq)]
pub enum WidgetKind {
    Text,
    Checkbox,
    DatePicker { date_format: String },
    Select { choices: Vec<Choice> },
    Multiselect { choices: Vec<Choice> },
    /// Space-separated integer ids.
    Autocomplete { multiple: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Widget {
    pub kind: WidgetKind,
    pub label: String,
    /// Initial value shown to the user. Select widgets take a choice index,
    /// negative indexes counting from the end. Date pickers also accept
    /// `"today"`, `"yesterday"` and `"first_of_month"`.
    pub default: Option<Json>,
    pub required: bool,
    pub extra_class: Vec<String>,
}

impl Widget {
    fn new(kind: WidgetKind) -> Self {
        Self {
            kind,
            label: "Filter".to_string(),
            default: None,
            required: false,
            extra_class: Vec::new(),
        }
    }

    pub fn text() -> Self {
        Self::new(WidgetKind::Text)
    }

    pub fn checkbox() -> Self {
        Self::new(WidgetKind::Checkbox)
    }

    pub fn date_picker() -> Self {
        Self::new(WidgetKind::DatePicker {
            date_format: DEFAULT_DATE_FORMAT.to_string(),
        })
    }

    pub fn select(choices: Vec<Choice>) -> Self {
        Self::new(WidgetKind::Select { choices })
    }

    pub fn multiselect(choices: Vec<Choice>) -> Self {
        Self::new(WidgetKind::Multiselect { choices })
    }

    pub fn autocomplete(multiple: bool) -> Self {
        Self::new(WidgetKind::Autocomplete { multiple })
    }

    /// A select of timezones labelled "Timezone".
    pub fn timezone_select(choices: Vec<Choice>) -> Self {
        Self::select(choices)
            .with_label("Timezone")
            .with_class("bl_timezone")
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_default(mut self, default: impl Into<Json>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.extra_class.push(class.into());
        self
    }

    pub fn with_date_format(mut self, format: impl Into<String>) -> Self {
        if let WidgetKind::DatePicker { date_format } = &mut self.kind {
            *date_format = format.into();
        }
        self
    }

    pub fn choices(&self) -> Option<&[Choice]> {
        match &self.kind {
            WidgetKind::Select { choices } | WidgetKind::Multiselect { choices } => Some(choices),
            _ => None,
        }
    }

    fn blank(&self, input: Option<&str>) -> Result<Option<()>, ValidationError> {
        match input {
            None | Some("") if self.required => Err(ValidationError::new(format!(
                "{} is required.",
                self.label
            ))),
            None | Some("") => Ok(None),
            Some(_) => Ok(Some(())),
        }
    }

    /// Cleans one raw form value.
    ///
    /// Blank input is `None` unless the widget is required. Checkboxes clean
    /// to a bool either way; multiselects never enforce `required`.
    pub fn clean(&self, input: Option<&str>) -> Result<Option<Value>, ValidationError> {
        let raw = input.unwrap_or("");
        match &self.kind {
            WidgetKind::Text => Ok(self.blank(input)?.map(|()| Value::from(raw))),
            WidgetKind::Checkbox => Ok(Some(Value::Bool(self.blank(input)?.is_some()))),
            WidgetKind::DatePicker { date_format } => {
                if self.blank(input)?.is_none() {
                    return Ok(None);
                }
                NaiveDate::parse_from_str(raw.trim(), date_format)
                    .map(|date| Some(Value::Date(date)))
                    .map_err(|_| ValidationError::new("Date is not in the correct format."))
            }
            WidgetKind::Select { choices } => {
                self.blank(input)?;
                let index: i64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| ValidationError::new("Please choose a valid option."))?;
                choice_at(choices, index)
                    .map(|(value, _)| value.clone().filter(|v| v != &Value::from("")))
                    .ok_or_else(|| ValidationError::new("Please choose a valid option."))
            }
            WidgetKind::Multiselect { choices } => {
                if raw.is_empty() {
                    return Ok(None);
                }
                let indexes = parse_ids(raw)?;
                let values = indexes
                    .into_iter()
                    .map(|i| {
                        choice_at(choices, i)
                            .ok_or_else(|| ValidationError::new("Please choose a valid option."))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Some(Value::List(
                    values.into_iter().filter_map(|(value, _)| value.clone()).collect(),
                )))
            }
            WidgetKind::Autocomplete { multiple } => {
                if self.blank(input)?.is_none() {
                    return Ok(None);
                }
                let ids = parse_ids(raw)?;
                if ids.len() > 1 && !multiple {
                    return Err(ValidationError::new("Multiple selections not allowed."));
                }
                Ok(Some(Value::List(ids.into_iter().map(Value::Int).collect())))
            }
        }
    }

    fn type_name(&self) -> &'static str {
        match self.kind {
            WidgetKind::Text => "text",
            WidgetKind::Checkbox => "checkbox",
            WidgetKind::DatePicker { .. } => "datepicker",
            WidgetKind::Select { .. } => "select",
            WidgetKind::Multiselect { .. } => "multiselect",
            WidgetKind::Autocomplete { .. } => "autocomplete",
        }
    }

    /// Frontend description of the widget under its form name.
    pub fn describe(&self, form_name: &str) -> Json {
        let mut classes = vec![format!("bl_{}", self.type_name())];
        if matches!(self.kind, WidgetKind::Autocomplete { multiple: true }) {
            classes.push("bl_multiple".to_string());
        }
        classes.extend(self.extra_class.iter().cloned());

        let mut description = json!({
            "name": form_name,
            "type": self.type_name(),
            "label": self.label,
            "required": self.required,
            "classes": classes,
            "default": self.resolved_default(),
        });
        if let Some(choices) = self.choices() {
            let options: Vec<Json> = choices
                .iter()
                .enumerate()
                .map(|(i, (_, label))| json!([i, label]))
                .collect();
            description["choices"] = Json::Array(options);
        }
        if matches!(self.kind, WidgetKind::Multiselect { .. }) {
            description["multiple"] = json!(true);
        }
        description
    }

    fn resolved_default(&self) -> Json {
        let Some(default) = &self.default else {
            return Json::Null;
        };
        match (&self.kind, default) {
            (WidgetKind::DatePicker { date_format }, Json::String(spec)) => {
                let today = Utc::now().date_naive();
                let date = match spec.as_str() {
                    "today" => Some(today),
                    "yesterday" => today.checked_sub_days(Days::new(1)),
                    "first_of_month" => Some(month_start(today)),
                    other => NaiveDate::parse_from_str(other, date_format).ok(),
                };
                date.map_or(Json::Null, |d| json!(d.format(date_format).to_string()))
            }
            (WidgetKind::Select { choices }, Json::Number(n)) => n
                .as_i64()
                .and_then(|i| normalize_index(choices.len(), i))
                .map_or(Json::Null, |i| json!(i)),
            _ => default.clone(),
        }
    }
}

fn normalize_index(len: usize, index: i64) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let index = if index < 0 { len + index } else { index };
    if (0..len).contains(&index) {
        usize::try_from(index).ok()
    } else {
        None
    }
}

fn choice_at(choices: &[Choice], index: i64) -> Option<&Choice> {
    normalize_index(choices.len(), index).map(|i| &choices[i])
}

fn parse_ids(raw: &str) -> Result<Vec<i64>, ValidationError> {
    raw.split(' ')
        .filter(|id| !id.is_empty())
        .map(|id| id.trim().parse::<i64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ValidationError::new("Could not convert input to list of IDs."))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn choices() -> Vec<Choice> {
        vec![
            (None, "All".to_string()),
            (Some(Value::Int(1)), "One".to_string()),
            (Some(Value::Int(2)), "Two".to_string()),
        ]
    }

    #[test]
    fn test_required_blank_input() {
        let widget = Widget::text().with_label("Name").required();
        assert_eq!(
            widget.clean(Some("")),
            Err(ValidationError::new("Name is required."))
        );
        assert_eq!(Widget::text().clean(None), Ok(None));
        assert_eq!(Widget::text().clean(Some("x")), Ok(Some(Value::from("x"))));
    }

    #[test]
    fn test_checkbox_is_always_bool() {
        assert_eq!(Widget::checkbox().clean(Some("on")), Ok(Some(Value::Bool(true))));
        assert_eq!(Widget::checkbox().clean(None), Ok(Some(Value::Bool(false))));
    }

    #[test]
    fn test_date_picker() {
        let widget = Widget::date_picker();
        assert_eq!(
            widget.clean(Some("01/31/2010")),
            Ok(Some(Value::Date(NaiveDate::from_ymd_opt(2010, 1, 31).unwrap())))
        );
        assert_eq!(
            widget.clean(Some("2010-01-31")),
            Err(ValidationError::new("Date is not in the correct format."))
        );
        let widget = Widget::date_picker().with_date_format("%Y-%m-%d");
        assert!(widget.clean(Some("2010-01-31")).unwrap().is_some());
    }

    #[test]
    fn test_select_indexes() {
        let widget = Widget::select(choices());
        assert_eq!(widget.clean(Some("1")), Ok(Some(Value::Int(1))));
        assert_eq!(widget.clean(Some("-1")), Ok(Some(Value::Int(2))));
        assert_eq!(widget.clean(Some("0")), Ok(None));
        assert_eq!(
            widget.clean(Some("abc")),
            Err(ValidationError::new("Please choose a valid option."))
        );
        assert_eq!(
            widget.clean(Some("7")),
            Err(ValidationError::new("Please choose a valid option."))
        );
    }

    #[test]
    fn test_multiselect() {
        let widget = Widget::multiselect(choices());
        assert_eq!(
            widget.clean(Some("1 2")),
            Ok(Some(Value::List(vec![Value::Int(1), Value::Int(2)])))
        );
        assert_eq!(widget.clean(Some("")), Ok(None));
        assert_eq!(
            widget.clean(Some("1 x")),
            Err(ValidationError::new("Could not convert input to list of IDs."))
        );
    }

    #[test]
    fn test_autocomplete() {
        let single = Widget::autocomplete(false);
        assert_eq!(
            single.clean(Some("12")),
            Ok(Some(Value::List(vec![Value::Int(12)])))
        );
        assert_eq!(
            single.clean(Some("12 13")),
            Err(ValidationError::new("Multiple selections not allowed."))
        );
        let multiple = Widget::autocomplete(true);
        assert_eq!(
            multiple.clean(Some("12  13")),
            Ok(Some(Value::List(vec![Value::Int(12), Value::Int(13)])))
        );
    }

    #[test]
    fn test_describe() {
        let widget = Widget::select(choices()).with_label("Pick").with_default(-1);
        let description = widget.describe("report_pick");
        assert_eq!(description["name"], json!("report_pick"));
        assert_eq!(description["default"], json!(2));
        assert_eq!(description["choices"][1], json!([1, "One"]));
        assert_eq!(description["classes"], json!(["bl_select"]));

        let tz = Widget::timezone_select(vec![]).describe("tz");
        assert_eq!(tz["label"], json!("Timezone"));
        assert_eq!(tz["classes"], json!(["bl_select", "bl_timezone"]));
    }
}
