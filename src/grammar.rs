//! Versioned line tokenizer.
//!
//! One pest rule per token kind; [`Grammar::next_token`] pulls a line from
//! the backing [`Source`], tries each rule of the active TAP version's table
//! and accepts the first rule whose match spans the whole line. Anything
//! unclaimed becomes [`Token::Unknown`].

use pest::iterators::Pairs;
use pest::Parser as _;
use pest_derive::Parser;

use crate::error::{Error, Result};
use crate::source::Source;
use crate::token::{BailOut, Comment, Directive, Key, Plan, Test, Token, Unknown, Version, YamlBlock};

#[derive(Parser)]
#[grammar = "tap.pest"]
pub struct TAPParser;

/// Token kinds recognised before a `TAP version 13` declaration.
const V12_RULES: &[Rule] = &[
    Rule::version,
    Rule::plan,
    Rule::test,
    Rule::bail_out,
    Rule::comment,
];

/// The v13 table adds structured-diagnostic blocks.
const V13_RULES: &[Rule] = &[
    Rule::version,
    Rule::plan,
    Rule::test,
    Rule::bail_out,
    Rule::comment,
    Rule::yaml_begin,
];

/// Tokenizer over a line [`Source`], holding the active syntax version and a
/// one-line lookahead used when a diagnostic block ends on a foreign line.
///
/// # Examples
///
/// ```
/// use tapharness::{ArraySource, Grammar, Token};
///
/// let source = ArraySource::new(vec!["1..2".to_owned(), "ok 1".to_owned()]);
/// let mut grammar = Grammar::new(Box::new(source));
/// assert!(matches!(grammar.next_token(), Some(Token::Plan(_))));
/// assert!(matches!(grammar.next_token(), Some(Token::Test(_))));
/// assert!(grammar.next_token().is_none());
/// ```
pub struct Grammar {
    source: Box<dyn Source + Send>,
    version: u32,
    peeked: Option<String>,
    seen_body: bool,
}

impl Grammar {
    pub fn new(source: Box<dyn Source + Send>) -> Self {
        Self {
            source,
            version: 12,
            peeked: None,
            seen_body: false,
        }
    }

    /// The active TAP syntax version. Defaults to 12 until a version token
    /// switches the table.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Select the rule table for `version`. Versions below 12 have no table.
    pub fn set_version(&mut self, version: u32) -> Result<()> {
        if version < 12 {
            return Err(Error::UnsupportedVersion(version));
        }
        self.version = version;
        Ok(())
    }

    /// Pull the next token, or `None` at end of stream.
    pub fn next_token(&mut self) -> Option<Token> {
        let line = self.next_line()?;
        let token = self.tokenize(line);
        if !token.is_unknown() {
            self.seen_body = true;
        }
        Some(token)
    }

    /// Exit code of the backing process, once the stream has ended.
    pub fn exit(&self) -> Option<i32> {
        self.source.exit()
    }

    /// Raw wait status of the backing process, once the stream has ended.
    pub fn wait(&self) -> Option<i32> {
        self.source.wait()
    }

    pub(crate) fn select_recv(&self) -> Option<&crossbeam_channel::Receiver<String>> {
        self.source.select_recv()
    }

    /// True when a lookahead line is buffered and the next token needs no
    /// read from the underlying source.
    pub(crate) fn has_buffered(&self) -> bool {
        self.peeked.is_some()
    }

    fn next_line(&mut self) -> Option<String> {
        self.peeked.take().or_else(|| self.source.next_line())
    }

    fn rules(&self) -> &'static [Rule] {
        if self.version >= 13 {
            V13_RULES
        } else {
            V12_RULES
        }
    }

    fn tokenize(&mut self, line: String) -> Token {
        for rule in self.rules() {
            match classify(*rule, &line, self.seen_body) {
                None => continue,
                Some(Classified::Token(token)) => return token,
                Some(Classified::YamlBegin { indent, marker }) => {
                    return self.read_block(indent, marker, line)
                }
            }
        }
        Token::Unknown(Unknown { raw: line })
    }

    /// Consume the body of a structured-diagnostic block. Lines carrying the
    /// opener's indent are stripped of it and collected; `...` closes the
    /// block; the first line without the indent is pushed back untouched.
    fn read_block(&mut self, indent: String, marker: String, first: String) -> Token {
        let mut raw_lines = vec![first];
        let mut doc = vec![marker];
        while let Some(line) = self.next_line() {
            match line.strip_prefix(&indent) {
                Some(tail) => {
                    let tail = tail.to_owned();
                    raw_lines.push(line);
                    let closed = tail == "...";
                    doc.push(tail);
                    if closed {
                        break;
                    }
                }
                None => {
                    self.peeked = Some(line);
                    break;
                }
            }
        }

        let payload = serde_yaml::from_str(&doc.join("\n")).ok();
        Token::Yaml(YamlBlock {
            payload,
            raw: raw_lines.join("\n"),
        })
    }
}

/// What one grammar rule made of a line, free of any borrow into it.
enum Classified {
    Token(Token),
    YamlBegin { indent: String, marker: String },
}

fn classify(rule: Rule, line: &str, seen_body: bool) -> Option<Classified> {
    let mut pairs = TAPParser::parse(rule, line).ok()?;
    let top = pairs.next()?;
    if top.as_span().end() != line.len() {
        return None;
    }
    let mut inner = top.into_inner();
    Some(match rule {
        // A version declaration is only a version declaration while nothing
        // else has been seen.
        Rule::version if seen_body => Classified::Token(Token::Unknown(Unknown {
            raw: line.to_owned(),
        })),
        Rule::version => Classified::Token(make_version(inner, line)),
        Rule::plan => Classified::Token(make_plan(inner, line)),
        Rule::test => Classified::Token(make_test(inner, line)),
        Rule::bail_out => Classified::Token(make_bail_out(inner, line)),
        Rule::comment => Classified::Token(make_comment(inner, line)),
        Rule::yaml_begin => Classified::YamlBegin {
            indent: inner
                .next()
                .map(|p| p.as_str().to_owned())
                .unwrap_or_default(),
            marker: inner
                .next()
                .map(|p| p.as_str().to_owned())
                .unwrap_or_default(),
        },
        _ => unreachable!(),
    })
}

fn make_version(mut pairs: Pairs<Rule>, raw: &str) -> Token {
    let raw = raw.to_owned();
    let number = pairs.next().and_then(|p| p.as_str().parse::<u32>().ok());
    match number {
        Some(version) => Token::Version(Version { version, raw }),
        None => Token::Unknown(Unknown { raw }),
    }
}

fn make_plan(pairs: Pairs<Rule>, raw: &str) -> Token {
    let raw = raw.to_owned();
    let mut planned = None;
    let mut directive = None;
    for pair in pairs {
        match pair.as_rule() {
            Rule::planned => planned = pair.as_str().parse::<u32>().ok(),
            Rule::plan_directive => {
                let explanation = pair
                    .into_inner()
                    .find(|p| p.as_rule() == Rule::explanation)
                    .map(|p| p.as_str().trim().to_owned())
                    .filter(|s| !s.is_empty());
                directive = Some(Directive {
                    key: Key::Skip,
                    explanation,
                });
            }
            _ => unreachable!(),
        }
    }
    match planned {
        Some(planned) => Token::Plan(Plan {
            planned,
            directive,
            raw,
        }),
        None => Token::Unknown(Unknown { raw }),
    }
}

fn make_test(pairs: Pairs<Rule>, raw: &str) -> Token {
    let raw = raw.to_owned();
    let mut ok = false;
    let mut number = None;
    let mut description = None;
    let mut directive = None;
    for pair in pairs {
        match pair.as_rule() {
            Rule::result => ok = pair.as_str() == "ok",
            Rule::number => number = pair.as_str().parse::<u32>().ok(),
            Rule::description => {
                description = Some(pair.as_str().trim().to_owned()).filter(|s| !s.is_empty())
            }
            Rule::directive => directive = make_directive(pair.into_inner()),
            _ => unreachable!(),
        }
    }
    Token::Test(Test {
        ok,
        number,
        description,
        directive,
        raw,
    })
}

fn make_directive(pairs: Pairs<Rule>) -> Option<Directive> {
    let mut key = None;
    let mut explanation = None;
    for pair in pairs {
        match pair.as_rule() {
            Rule::key => {
                key = match pair.as_str().to_uppercase().as_str() {
                    "SKIP" => Some(Key::Skip),
                    "TODO" => Some(Key::Todo),
                    _ => None,
                }
            }
            Rule::explanation => {
                explanation = Some(pair.as_str().trim().to_owned()).filter(|s| !s.is_empty())
            }
            _ => unreachable!(),
        }
    }
    key.map(|key| Directive { key, explanation })
}

fn make_bail_out(mut pairs: Pairs<Rule>, raw: &str) -> Token {
    let raw = raw.to_owned();
    let reason = pairs
        .next()
        .map(|p| p.as_str().trim().to_owned())
        .filter(|s| !s.is_empty());
    Token::Bailout(BailOut { reason, raw })
}

fn make_comment(mut pairs: Pairs<Rule>, raw: &str) -> Token {
    let text = pairs.next().map(|p| p.as_str().to_owned()).unwrap_or_default();
    Token::Comment(Comment {
        text,
        raw: raw.to_owned(),
    })
}
