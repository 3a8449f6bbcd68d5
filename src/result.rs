//! Parser-side results: tokens with TAP semantics applied.

use serde::Serialize;

use crate::token::{BailOut, Comment, Directive, Plan, Test, Unknown, Version, YamlBlock};

/// A test line as the parser saw it: renumbered and with directive semantics
/// resolved.
///
/// `ok` keeps the literal result as written; [`TestResult::is_ok`] applies
/// the TODO reversal (an expected failure still counts as ok).
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TestResult {
    /// Literal `ok` / `not ok` as written.
    pub ok: bool,
    /// The number assigned by the parser. Always the expected sequence
    /// number, even when the producer wrote a different one.
    pub number: u32,
    pub description: Option<String>,
    pub directive: Option<Directive>,
    pub raw: String,
}

impl TestResult {
    pub(crate) fn from_token(test: Test, number: u32) -> Self {
        Self {
            ok: test.ok,
            number,
            description: test.description,
            directive: test.directive,
            raw: test.raw,
        }
    }

    /// The literal result as written on the line.
    pub fn is_actual_ok(&self) -> bool {
        self.ok
    }

    /// The effective result: a TODO test never fails the run.
    pub fn is_ok(&self) -> bool {
        self.has_todo() || self.ok
    }

    pub fn has_todo(&self) -> bool {
        self.directive.as_ref().is_some_and(Directive::is_todo)
    }

    pub fn has_skip(&self) -> bool {
        self.directive.as_ref().is_some_and(Directive::is_skip)
    }

    /// A TODO test that unexpectedly passed.
    pub fn todo_passed(&self) -> bool {
        self.has_todo() && self.ok
    }
}

/// One event out of the parser, carrying the token plus derived attributes.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum ParseResult {
    #[serde(rename = "version")]
    Version(Version),
    #[serde(rename = "plan")]
    Plan(Plan),
    #[serde(rename = "test")]
    Test(TestResult),
    #[serde(rename = "comment")]
    Comment(Comment),
    #[serde(rename = "bail_out")]
    Bailout(BailOut),
    #[serde(rename = "yaml")]
    Yaml(YamlBlock),
    #[serde(rename = "unknown")]
    Unknown(Unknown),
}

impl ParseResult {
    /// The raw source text behind this result.
    pub fn raw(&self) -> &str {
        match self {
            ParseResult::Version(r) => &r.raw,
            ParseResult::Plan(r) => &r.raw,
            ParseResult::Test(r) => &r.raw,
            ParseResult::Comment(r) => &r.raw,
            ParseResult::Bailout(r) => &r.raw,
            ParseResult::Yaml(r) => &r.raw,
            ParseResult::Unknown(r) => &r.raw,
        }
    }

    pub fn is_test(&self) -> bool {
        matches!(self, ParseResult::Test(_))
    }

    pub fn is_plan(&self) -> bool {
        matches!(self, ParseResult::Plan(_))
    }

    pub fn is_bailout(&self) -> bool {
        matches!(self, ParseResult::Bailout(_))
    }

    pub fn is_comment(&self) -> bool {
        matches!(self, ParseResult::Comment(_))
    }

    pub fn is_yaml(&self) -> bool {
        matches!(self, ParseResult::Yaml(_))
    }

    pub fn is_version(&self) -> bool {
        matches!(self, ParseResult::Version(_))
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, ParseResult::Unknown(_))
    }

    pub fn as_test(&self) -> Option<&TestResult> {
        match self {
            ParseResult::Test(t) => Some(t),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::Key;

    fn test_result(ok: bool, directive: Option<Directive>) -> TestResult {
        TestResult {
            ok,
            number: 1,
            description: None,
            directive,
            raw: String::new(),
        }
    }

    #[test]
    fn todo_reverses_failure() {
        let todo_fail = test_result(
            false,
            Some(Directive {
                key: Key::Todo,
                explanation: None,
            }),
        );
        assert!(!todo_fail.is_actual_ok());
        assert!(todo_fail.is_ok());
        assert!(!todo_fail.todo_passed());

        let todo_pass = test_result(
            true,
            Some(Directive {
                key: Key::Todo,
                explanation: None,
            }),
        );
        assert!(todo_pass.is_ok());
        assert!(todo_pass.todo_passed());
    }

    #[test]
    fn skip_does_not_reverse() {
        let skip_fail = test_result(
            false,
            Some(Directive {
                key: Key::Skip,
                explanation: None,
            }),
        );
        assert!(skip_fail.has_skip());
        assert!(!skip_fail.is_ok());
    }
}
