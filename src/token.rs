//! Typed tokens produced by the [`crate::grammar::Grammar`].
//!
//! Every token keeps the raw source line(s) it was built from, so a consumer
//! can reconstruct the input stream verbatim for diagnostics or spooling.

use serde::Serialize;

/// Directive keys supported by [`Directive`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum Key {
    /// Test was skipped.
    Skip,
    /// Test is a known, expected failure.
    Todo,
}

/// A [`Directive`] annotates a test (or a plan) with meta information about
/// its execution.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Directive {
    /// A directive key, declaring the nature of this [`Directive`].
    pub key: Key,
    /// Why this test was [`Key::Skip`]ped or why it is a [`Key::Todo`].
    pub explanation: Option<String>,
}

impl Directive {
    pub fn is_skip(&self) -> bool {
        self.key == Key::Skip
    }

    pub fn is_todo(&self) -> bool {
        self.key == Key::Todo
    }

    /// The explanation text, or `""` when none was given.
    pub fn explanation(&self) -> &str {
        self.explanation.as_deref().unwrap_or("")
    }
}

/// A `TAP version N` declaration. Valid only as the very first line of a
/// stream; the declared number must be at least 13 (12 is implicit).
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Version {
    /// Declared TAP syntax version.
    pub version: u32,
    pub raw: String,
}

/// The `1..N` plan telling how many tests will run, or how many have run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Plan {
    /// Number of planned tests. `0` together with a SKIP directive means the
    /// whole file opted out.
    pub planned: u32,
    /// An optional `# SKIP` directive with its explanation.
    pub directive: Option<Directive>,
    pub raw: String,
}

impl Plan {
    pub fn has_skip(&self) -> bool {
        self.directive.as_ref().is_some_and(Directive::is_skip)
    }

    /// True for a `1..0 # SKIP ...` plan, the skip-everything signal.
    pub fn is_skip_all(&self) -> bool {
        self.planned == 0 && self.has_skip()
    }
}

/// A single `ok` / `not ok` test line.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Test {
    /// Literal result of the test as written.
    pub ok: bool,
    /// Test number, if the producer wrote one.
    pub number: Option<u32>,
    /// Description of the test, without the leading `- ` separator.
    pub description: Option<String>,
    /// Trailing `# SKIP` / `# TODO` directive, if any.
    pub directive: Option<Directive>,
    pub raw: String,
}

/// A `#`-prefixed comment line.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Comment {
    /// Comment text after the `#`, untrimmed.
    pub text: String,
    pub raw: String,
}

/// Marks an emergency exit of the test procedure.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct BailOut {
    /// Optional reason for bailing out.
    pub reason: Option<String>,
    pub raw: String,
}

/// An indented `---` ... `...` block of structured diagnostics attached to
/// the preceding test.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct YamlBlock {
    /// The parsed value tree, or `None` when the document was malformed.
    pub payload: Option<serde_yaml::Value>,
    /// All consumed source lines, joined with `\n`.
    pub raw: String,
}

/// Any line no grammar rule claimed.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Unknown {
    pub raw: String,
}

/// An enumeration of everything the grammar can produce for a line (or, for
/// [`Token::Yaml`], a block of lines).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Token {
    #[serde(rename = "version")]
    Version(Version),
    #[serde(rename = "plan")]
    Plan(Plan),
    #[serde(rename = "test")]
    Test(Test),
    #[serde(rename = "comment")]
    Comment(Comment),
    #[serde(rename = "bail_out")]
    Bailout(BailOut),
    #[serde(rename = "yaml")]
    Yaml(YamlBlock),
    #[serde(rename = "unknown")]
    Unknown(Unknown),
}

impl Token {
    /// The raw source text this token was built from.
    pub fn raw(&self) -> &str {
        match self {
            Token::Version(t) => &t.raw,
            Token::Plan(t) => &t.raw,
            Token::Test(t) => &t.raw,
            Token::Comment(t) => &t.raw,
            Token::Bailout(t) => &t.raw,
            Token::Yaml(t) => &t.raw,
            Token::Unknown(t) => &t.raw,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Token::Unknown(_))
    }
}
