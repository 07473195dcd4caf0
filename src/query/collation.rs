//! String comparison collation specs attached to expressions.

use serde_json::json;

/// Collation rules applied to a comparison via [`Expression::collate`].
///
/// [`Expression::collate`]: crate::query::Expression::collate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Collation {
    unicode: bool,
    locale: Option<String>,
    ignore_case: bool,
    ignore_accents: bool,
}

impl Collation {
    /// ASCII collation, case-sensitive by default.
    pub fn ascii() -> Self {
        Self {
            unicode: false,
            locale: None,
            ignore_case: false,
            ignore_accents: false,
        }
    }

    /// Unicode-aware collation, case- and accent-sensitive by default.
    pub fn unicode() -> Self {
        Self {
            unicode: true,
            locale: None,
            ignore_case: false,
            ignore_accents: false,
        }
    }

    /// Sets whether letter case is ignored.
    pub fn ignore_case(mut self, ignore: bool) -> Self {
        self.ignore_case = ignore;
        self
    }

    /// Sets whether accents and diacritics are ignored. Unicode only.
    pub fn ignore_accents(mut self, ignore: bool) -> Self {
        self.ignore_accents = ignore;
        self
    }

    /// Sets the locale used for Unicode comparison rules.
    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    pub(crate) fn to_json(&self) -> serde_json::Value {
        json!({
            "UNICODE": self.unicode,
            "LOCALE": self.locale,
            "CASE": !self.ignore_case,
            "DIAC": !self.ignore_accents,
        })
    }
}
