//! Headless widget bindings
//!
//! These are the toolkit-independent halves of live widgets: they keep the
//! text or state a real control would display and push user input back into
//! a [`Variable`]. A GUI layer only has to render [`LiveText::text`] and
//! forward edits to [`LiveInput::submit`].
//!
//! - [`LiveText`] - read-only label bound to a variable or one column of a row
//! - [`LiveInput`] - editable text field that writes through the variable
//! - [`LiveChoice`] - selection mapped to a list of values
//! - [`LiveToggle`] - checkbox bound to a boolean
//! - [`LiveRadio`] - radio button writing one fixed value

use crate::error::{LiveError, Result};
use crate::getter::HistoryGetter;
use crate::listener::{DeliveryError, Listener, NotificationReceiver};
use crate::types::{Notification, Value};
use crate::util::{read, write};
use crate::variable::Variable;
use std::sync::{Arc, RwLock, Weak};

/// Parsed display template: `prefix {} suffix` or `prefix {:.N} suffix`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextFormat {
    prefix: String,
    precision: Option<usize>,
    suffix: String,
}

impl TextFormat {
    /// Parse a template containing exactly one placeholder
    pub fn parse(template: &str) -> Result<Self> {
        let open = template.find('{').ok_or_else(|| {
            LiveError::Configuration(format!("format {:?} has no placeholder", template))
        })?;
        let close = template[open..]
            .find('}')
            .map(|i| open + i)
            .ok_or_else(|| {
                LiveError::Configuration(format!("format {:?} has an unclosed placeholder", template))
            })?;

        let spec = &template[open + 1..close];
        let precision = match spec {
            "" => None,
            _ => {
                let digits = spec.strip_prefix(":.").ok_or_else(|| {
                    LiveError::Configuration(format!("unsupported placeholder {{{}}}", spec))
                })?;
                Some(digits.parse::<usize>().map_err(|_| {
                    LiveError::Configuration(format!("bad precision in {{{}}}", spec))
                })?)
            }
        };

        let suffix = &template[close + 1..];
        if suffix.contains('{') {
            return Err(LiveError::Configuration(format!(
                "format {:?} has more than one placeholder",
                template
            )));
        }

        Ok(Self {
            prefix: template[..open].to_string(),
            precision,
            suffix: suffix.to_string(),
        })
    }

    /// Render a value
    pub fn render(&self, value: &Value) -> String {
        let body = match (self.precision, value.as_f64()) {
            (Some(precision), Some(x)) if !matches!(value, Value::Text(_)) => {
                format!("{:.*}", precision, x)
            }
            _ => value.to_string(),
        };
        format!("{}{}{}", self.prefix, body, self.suffix)
    }
}

impl Default for TextFormat {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            precision: None,
            suffix: String::new(),
        }
    }
}

/// Pick the displayed part of a notification value
fn select(value: &Value, column: Option<usize>) -> std::result::Result<Value, DeliveryError> {
    match column {
        None => Ok(value.clone()),
        Some(column) => value.column(column).map(Value::Float).ok_or_else(|| {
            DeliveryError::Rejected(format!("value {} has no column {}", value, column))
        }),
    }
}

/// Read-only formatted label
#[derive(Debug)]
pub struct LiveText {
    format: TextFormat,
    column: Option<usize>,
    text: RwLock<String>,
}

impl LiveText {
    /// `template` uses `{}` or `{:.N}` for the value
    pub fn new(template: &str, column: Option<usize>) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            format: TextFormat::parse(template)?,
            column,
            text: RwLock::new(String::new()),
        }))
    }

    /// Label bound to `variable`, showing its current value right away
    pub fn bind(template: &str, variable: &Variable) -> Result<Arc<Self>> {
        let label = Self::new(template, None)?;
        variable.add_listener(&Listener::receiver(&label))?;
        Ok(label)
    }

    /// Label bound to one column of a history getter
    ///
    /// Shows the getter's default row until the first sample arrives.
    pub fn bind_column(template: &str, getter: &HistoryGetter, column: usize) -> Result<Arc<Self>> {
        let label = Self::new(template, Some(column))?;
        getter.add_listener(&Listener::receiver(&label))?;
        Ok(label)
    }

    /// Text as a label would display it
    pub fn text(&self) -> String {
        read(&self.text).clone()
    }

    /// Show `value` without a notification (placeholder, default row)
    pub fn show(&self, value: &Value) -> Result<()> {
        let selected = select(value, self.column)
            .map_err(|e| LiveError::Configuration(e.to_string()))?;
        *write(&self.text) = self.format.render(&selected);
        Ok(())
    }
}

impl NotificationReceiver for LiveText {
    fn on_notification(&self, notification: &Notification) -> std::result::Result<(), DeliveryError> {
        let selected = select(&notification.value, self.column)?;
        *write(&self.text) = self.format.render(&selected);
        Ok(())
    }
}

/// Editable text field
///
/// Shows updates from the variable like a label. [`submit`](Self::submit)
/// writes the edited text through the variable's setter; the field itself
/// is skipped when the write is broadcast, so it keeps what the user typed.
pub struct LiveInput {
    me: Weak<LiveInput>,
    variable: Arc<Variable>,
    format: TextFormat,
    text: RwLock<String>,
}

impl LiveInput {
    pub fn bind(template: &str, variable: Arc<Variable>) -> Result<Arc<Self>> {
        let format = TextFormat::parse(template)?;
        let input = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            variable,
            format,
            text: RwLock::new(String::new()),
        });
        input.variable.add_listener(&Listener::receiver(&input))?;
        Ok(input)
    }

    pub fn text(&self) -> String {
        read(&self.text).clone()
    }

    /// User edited the field
    pub fn edit(&self, text: impl Into<String>) {
        *write(&self.text) = text.into();
    }

    /// User confirmed the edit (enter pressed)
    pub fn submit(&self) -> Result<Value> {
        let text = self.text();
        match self.listener() {
            Some(me) => self.variable.set_value_from(text, &me),
            None => self.variable.set_value(text),
        }
    }

    /// Handle under which this field is registered
    pub fn listener(&self) -> Option<Listener> {
        self.me
            .upgrade()
            .map(|me| Listener::Receiver(me as Arc<dyn NotificationReceiver>))
    }

    pub fn detach(&self) -> Result<()> {
        match self.listener() {
            Some(me) => self.variable.remove_listener(&me),
            None => Ok(()),
        }
    }
}

impl NotificationReceiver for LiveInput {
    fn on_notification(&self, notification: &Notification) -> std::result::Result<(), DeliveryError> {
        *write(&self.text) = self.format.render(&notification.value);
        Ok(())
    }
}

impl std::fmt::Debug for LiveInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveInput")
            .field("variable", &self.variable.name())
            .field("text", &self.text())
            .finish()
    }
}

/// Selection mapped to values
#[derive(Debug)]
pub struct LiveChoice {
    variable: Arc<Variable>,
    mapping: Vec<Value>,
    selection: RwLock<Option<usize>>,
}

impl LiveChoice {
    /// `mapping[i]` is written when entry `i` is selected
    pub fn bind(variable: Arc<Variable>, mapping: Vec<Value>) -> Result<Arc<Self>> {
        if mapping.is_empty() {
            return Err(LiveError::Configuration(
                "choice needs at least one entry".to_string(),
            ));
        }
        let choice = Arc::new(Self {
            variable,
            mapping,
            selection: RwLock::new(None),
        });
        choice.variable.add_listener(&Listener::receiver(&choice))?;
        Ok(choice)
    }

    pub fn selection(&self) -> Option<usize> {
        *read(&self.selection)
    }

    /// User picked entry `index`
    pub fn select(&self, index: usize) -> Result<Value> {
        let value = self.mapping.get(index).cloned().ok_or_else(|| {
            LiveError::Configuration(format!(
                "choice index {} out of range (0..{})",
                index,
                self.mapping.len()
            ))
        })?;
        self.variable.set_value(value)
    }
}

impl NotificationReceiver for LiveChoice {
    fn on_notification(&self, notification: &Notification) -> std::result::Result<(), DeliveryError> {
        let kind = self.variable.kind();
        let index = self.mapping.iter().position(|entry| {
            kind.coerce(entry.clone())
                .map(|coerced| coerced == notification.value)
                .unwrap_or(false)
        });
        *write(&self.selection) = index;
        Ok(())
    }
}

/// Checkbox bound to a boolean
#[derive(Debug)]
pub struct LiveToggle {
    variable: Arc<Variable>,
    checked: RwLock<bool>,
}

impl LiveToggle {
    pub fn bind(variable: Arc<Variable>) -> Result<Arc<Self>> {
        let toggle = Arc::new(Self {
            variable,
            checked: RwLock::new(false),
        });
        toggle.variable.add_listener(&Listener::receiver(&toggle))?;
        Ok(toggle)
    }

    pub fn is_checked(&self) -> bool {
        *read(&self.checked)
    }

    /// User clicked the box
    pub fn set_checked(&self, checked: bool) -> Result<Value> {
        self.variable.set_value(checked)
    }
}

impl NotificationReceiver for LiveToggle {
    fn on_notification(&self, notification: &Notification) -> std::result::Result<(), DeliveryError> {
        let checked = match &notification.value {
            Value::Bool(b) => *b,
            other => other.as_f64().is_some_and(|x| x != 0.0),
        };
        *write(&self.checked) = checked;
        Ok(())
    }
}

/// Radio button that writes one fixed value when selected
///
/// Buttons bound to the same variable form a group: the one whose value
/// matches the variable is shown selected.
#[derive(Debug)]
pub struct LiveRadio {
    variable: Arc<Variable>,
    value: Value,
    selected: RwLock<bool>,
}

impl LiveRadio {
    /// Fails if `value` cannot be stored in the variable
    pub fn bind(variable: Arc<Variable>, value: impl Into<Value>) -> Result<Arc<Self>> {
        let value = variable.kind().coerce(value.into())?;
        let radio = Arc::new(Self {
            variable,
            value,
            selected: RwLock::new(false),
        });
        radio.variable.add_listener(&Listener::receiver(&radio))?;
        Ok(radio)
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn is_selected(&self) -> bool {
        *read(&self.selected)
    }

    /// User picked this button
    pub fn select(&self) -> Result<Value> {
        self.variable.set_value(self.value.clone())
    }
}

impl NotificationReceiver for LiveRadio {
    fn on_notification(&self, notification: &Notification) -> std::result::Result<(), DeliveryError> {
        *write(&self.selected) = notification.value == self.value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueKind;

    #[test]
    fn test_format_parse() {
        let f = TextFormat::parse("T = {:.2} C").unwrap();
        assert_eq!(f.render(&Value::Float(21.456)), "T = 21.46 C");
        assert_eq!(TextFormat::parse("{}").unwrap().render(&Value::Int(3)), "3");
        assert!(TextFormat::parse("no placeholder").is_err());
        assert!(TextFormat::parse("{:x}").is_err());
        assert!(TextFormat::parse("{} and {}").is_err());
    }

    #[test]
    fn test_precision_leaves_text_alone() {
        let f = TextFormat::parse("{:.1}").unwrap();
        assert_eq!(f.render(&Value::from("1.2345")), "1.2345");
    }

    #[test]
    fn test_label_follows_variable() {
        let var = Variable::builder().value(1.0).build().unwrap();
        let label = LiveText::bind("v={:.1}", &var).unwrap();
        assert_eq!(label.text(), "v=1.0");

        var.set_value(2.26).unwrap();
        assert_eq!(label.text(), "v=2.3");
    }

    #[test]
    fn test_label_column_out_of_range_detaches() {
        let var = Variable::builder()
            .kind(ValueKind::Row)
            .value(vec![1.0, 2.0])
            .build()
            .unwrap();
        let label = LiveText::new("{}", Some(1)).unwrap();
        var.add_listener(&Listener::receiver(&label)).unwrap();
        assert_eq!(label.text(), "2");

        var.set_value(vec![1.0]).unwrap();
        assert_eq!(var.listener_count(), 0);
        assert_eq!(label.text(), "2");
    }

    #[test]
    fn test_input_submit_skips_itself() {
        let var = Arc::new(Variable::builder().kind(ValueKind::Int).value(1).build().unwrap());
        let input = LiveInput::bind("{}", var.clone()).unwrap();
        let label = LiveText::bind("{}", &var).unwrap();
        assert_eq!(input.text(), "1");

        input.edit(" 42 ");
        assert_eq!(input.submit().unwrap(), Value::Int(42));
        assert_eq!(input.text(), " 42 ");
        assert_eq!(label.text(), "42");

        var.set_value(7).unwrap();
        assert_eq!(input.text(), "7");
    }

    #[test]
    fn test_input_bad_text_is_rejected() {
        let var = Arc::new(Variable::builder().kind(ValueKind::Int).value(1).build().unwrap());
        let input = LiveInput::bind("{}", var.clone()).unwrap();
        input.edit("abc");
        assert!(input.submit().is_err());
        assert_eq!(var.value(), Some(Value::Int(1)));

        input.detach().unwrap();
        assert_eq!(var.listener_count(), 0);
    }

    #[test]
    fn test_choice_and_toggle() {
        let mode = Arc::new(Variable::builder().kind(ValueKind::Int).value(0).build().unwrap());
        let choice = LiveChoice::bind(mode.clone(), vec![Value::Int(0), Value::Int(5)]).unwrap();
        assert_eq!(choice.selection(), Some(0));
        choice.select(1).unwrap();
        assert_eq!(mode.value(), Some(Value::Int(5)));
        assert_eq!(choice.selection(), Some(1));
        assert!(choice.select(2).is_err());

        let enabled = Arc::new(Variable::builder().kind(ValueKind::Bool).value(false).build().unwrap());
        let toggle = LiveToggle::bind(enabled.clone()).unwrap();
        assert!(!toggle.is_checked());
        toggle.set_checked(true).unwrap();
        assert!(toggle.is_checked());
        assert_eq!(enabled.value(), Some(Value::Bool(true)));
    }

    #[test]
    fn test_radio_group() {
        let mode = Arc::new(Variable::builder().kind(ValueKind::Int).value(1).build().unwrap());
        let slow = LiveRadio::bind(mode.clone(), 1).unwrap();
        let fast = LiveRadio::bind(mode.clone(), 2.0).unwrap();
        assert_eq!(fast.value(), &Value::Int(2));
        assert!(slow.is_selected());
        assert!(!fast.is_selected());

        assert_eq!(fast.select().unwrap(), Value::Int(2));
        assert!(fast.is_selected());
        assert!(!slow.is_selected());

        mode.set_value(1).unwrap();
        assert!(slow.is_selected());
        assert!(LiveRadio::bind(mode.clone(), "fast").is_err());
    }
}
