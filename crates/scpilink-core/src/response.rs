//! Typed reply parsing and value formatting
//!
//! A reply is a single ASCII line: bare token, numeric literal, `ON`/`OFF`,
//! an `OFF` sentinel standing in for an absent numeric value, or a
//! comma-separated list of any of those.

use crate::error::ScpiError;

/// A reply shape, declared by the caller at the ask call site.
///
/// The shape is chosen per query rather than guessed from the reply text:
/// a numeric-looking string is not always meant to be a number, and an
/// unexpected textual reply to a numeric query must be a hard parse error,
/// not a silent best-effort guess.
pub trait ScpiResponse: Sized {
    /// Shape name used in parse-error messages
    const SHAPE: &'static str;

    /// Parse a trimmed reply line into the declared shape.
    fn parse(raw: &str) -> Result<Self, ScpiError>;
}

fn shape_error<T: ScpiResponse>(raw: &str) -> ScpiError {
    ScpiError::Parse {
        expected: T::SHAPE,
        text: raw.to_string(),
    }
}

impl ScpiResponse for String {
    const SHAPE: &'static str = "string";

    fn parse(raw: &str) -> Result<Self, ScpiError> {
        Ok(raw.trim().to_string())
    }
}

impl ScpiResponse for i64 {
    const SHAPE: &'static str = "integer";

    fn parse(raw: &str) -> Result<Self, ScpiError> {
        raw.trim().parse().map_err(|_| shape_error::<Self>(raw))
    }
}

impl ScpiResponse for f64 {
    const SHAPE: &'static str = "float";

    fn parse(raw: &str) -> Result<Self, ScpiError> {
        raw.trim().parse().map_err(|_| shape_error::<Self>(raw))
    }
}

impl ScpiResponse for bool {
    const SHAPE: &'static str = "boolean";

    /// `ON`/`1` and `OFF`/`0` are the only accepted tokens.
    fn parse(raw: &str) -> Result<Self, ScpiError> {
        match raw.trim() {
            "ON" | "1" => Ok(true),
            "OFF" | "0" => Ok(false),
            _ => Err(shape_error::<Self>(raw)),
        }
    }
}

/// Float reply where the instrument answers `OFF` for "no value".
impl ScpiResponse for Option<f64> {
    const SHAPE: &'static str = "float-or-OFF";

    fn parse(raw: &str) -> Result<Self, ScpiError> {
        let raw = raw.trim();
        if raw == "OFF" {
            return Ok(None);
        }
        raw.parse().map(Some).map_err(|_| shape_error::<Self>(raw))
    }
}

/// Comma-separated list of any scalar shape; an empty reply is an empty
/// list, not an error.
impl<T: ScpiResponse> ScpiResponse for Vec<T> {
    const SHAPE: &'static str = "list";

    fn parse(raw: &str) -> Result<Self, ScpiError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        raw.split(',').map(|field| T::parse(field.trim())).collect()
    }
}

/// Formatting helpers for outgoing command arguments.
///
/// Command tables build directive text from these so that values round-trip
/// through the shapes above.
pub mod format {
    /// Render a boolean as the `ON`/`OFF` literal
    pub fn on_off(value: bool) -> &'static str {
        if value {
            "ON"
        } else {
            "OFF"
        }
    }

    /// Render an optional float, `OFF` for an absent value
    pub fn float_or_off(value: Option<f64>) -> String {
        match value {
            Some(v) => format!("{:.2}", v),
            None => "OFF".to_string(),
        }
    }

    /// Render a float list with two decimals, comma separated
    pub fn float_list(values: &[f64]) -> String {
        values
            .iter()
            .map(|v| format!("{:.2}", v))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Render an integer list, comma separated
    pub fn int_list(values: &[i64]) -> String {
        values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Render a string list, comma separated
    pub fn str_list(values: &[&str]) -> String {
        values.join(",")
    }
}
