//! Turns event records into message bodies.
//!
//! Body templates are rendered with minijinja. Sources may be written in
//! Jinja syntax or in the dotted action syntax common to monitoring tools;
//! the latter is rewritten before compilation:
//!
//! | Action                         | Meaning                                   |
//! |--------------------------------|-------------------------------------------|
//! | `{{.a}}`, `{{ .a.b }}`         | field `a`, nested field `a.b`             |
//! | `{{.}}`, `{{$}}`               | the whole record                          |
//! | `{{$.a}}`                      | field `a` of the record, inside a loop    |
//! | `{{if .a}}`, `{{else if .b}}`  | conditional, closed by `{{end}}`          |
//! | `{{else}}`                     | else branch of `if` or empty `range`      |
//! | `{{range .list}}`              | loop; `.` is the current element          |
//! | `{{range $v := .list}}`        | loop binding `$v`                         |
//! | `{{range $k, $v := .map}}`     | loop over the key/value pairs of a map    |
//! | `{{/* note */}}`               | comment                                   |
//!
//! `{{- ` and ` -}}` trim surrounding whitespace. Conditions and values are
//! Jinja expressions (`{{if .level == "high"}}`, `{{ .msg | upper }}`);
//! prefix function calls such as `eq .a .b` or `printf` are not supported,
//! nor are `with`, `define`, `template` and `block`.
//!
//! A field the record does not carry prints as `<no value>` and the body is
//! still delivered.

use std::fmt::{self, Write as _};

use minijinja::{Environment, ErrorKind, UndefinedBehavior};
use serde_json::Value;

use crate::config::SmtpConfig;
use crate::error::{Error, Result};
use crate::event::EventRecord;

const BODY_TEMPLATE: &str = "body";

/// Context name the whole record is bound to.
const RECORD_VAR: &str = "__record";

/// Printed in place of fields the record does not carry.
pub const NO_VALUE: &str = "<no value>";

/// A body template compiled once at channel construction.
pub struct BodyTemplate {
    env: Environment<'static>,
    source: String,
    binds_record: bool,
}

impl BodyTemplate {
    pub fn compile(source: &str) -> Result<Self> {
        let translated = translate(source)?;

        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        env.set_keep_trailing_newline(true);
        env.set_formatter(|out, state, value| {
            if value.is_undefined() {
                out.write_str(NO_VALUE).map_err(|_| {
                    minijinja::Error::new(ErrorKind::WriteFailure, "failed to write placeholder")
                })
            } else {
                minijinja::escape_formatter(out, state, value)
            }
        });
        env.add_template_owned(BODY_TEMPLATE, translated.source)
            .map_err(|e| Error::Template(e.to_string()))?;

        Ok(Self {
            env,
            source: source.to_string(),
            binds_record: translated.binds_record,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn render(&self, record: &EventRecord) -> Result<String> {
        let tmpl = self
            .env
            .get_template(BODY_TEMPLATE)
            .map_err(|e| Error::Formatting(format!("template error: {}", e)))?;

        let rendered = if self.binds_record {
            let mut context = record.fields().clone();
            context.insert(RECORD_VAR.to_string(), Value::Object(record.fields().clone()));
            tmpl.render(&context)
        } else {
            tmpl.render(record)
        };
        rendered.map_err(|e| Error::Formatting(format!("template render error: {}", e)))
    }
}

impl fmt::Debug for BodyTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyTemplate")
            .field("source", &self.source)
            .finish()
    }
}

/// Message body formatter: template when configured, JSON otherwise.
#[derive(Debug, Default)]
pub struct MessageFormatter {
    template: Option<BodyTemplate>,
}

impl MessageFormatter {
    pub fn new(template: Option<BodyTemplate>) -> Self {
        Self { template }
    }

    /// Compile the configured template, if any.
    pub fn from_config(config: &SmtpConfig) -> Result<Self> {
        let template = config
            .template_source()
            .map(BodyTemplate::compile)
            .transpose()?;
        Ok(Self::new(template))
    }

    pub fn has_template(&self) -> bool {
        self.template.is_some()
    }

    /// Produce the body for one record.
    ///
    /// Without a template the record is encoded as compact JSON. An `Err`
    /// means the record cannot be delivered; an `Ok` with an empty string
    /// is treated the same way by the worker.
    pub fn format(&self, record: &EventRecord) -> Result<String> {
        match &self.template {
            Some(template) => template.render(record),
            None => serde_json::to_string(record)
                .map_err(|e| Error::Formatting(format!("Failed to encode event as JSON: {}", e))),
        }
    }
}

struct Translated {
    source: String,
    binds_record: bool,
}

enum Block {
    If,
    Range { dot: String },
}

#[derive(Default)]
struct Translator {
    out: String,
    blocks: Vec<Block>,
    binds_record: bool,
    loops: usize,
}

/// Rewrite dotted actions into Jinja. Jinja sources pass through unchanged.
fn translate(source: &str) -> Result<Translated> {
    let mut t = Translator::default();
    let mut rest = source;

    while let Some(start) = rest.find("{{") {
        t.out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            // Unterminated; left for the parser to report.
            t.out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        t.action(&after[..end])?;
        rest = &after[end + 2..];
    }
    t.out.push_str(rest);

    Ok(Translated {
        source: t.out,
        binds_record: t.binds_record,
    })
}

impl Translator {
    fn action(&mut self, inner: &str) -> Result<()> {
        let (trim_left, body) = match inner.strip_prefix('-') {
            Some(body) if body.starts_with(char::is_whitespace) => (true, body),
            _ => (false, inner),
        };
        let (trim_right, body) = match body.strip_suffix('-') {
            Some(body) if body.ends_with(char::is_whitespace) => (true, body),
            _ => (false, body),
        };

        let trimmed = body.trim();
        if let Some(comment) = trimmed.strip_prefix("/*").and_then(|c| c.strip_suffix("*/")) {
            self.delimited("{#", trim_left, comment.trim(), trim_right, "#}");
            return Ok(());
        }

        let (keyword, args) = split_keyword(trimmed);
        match keyword {
            "if" => {
                let cond = self.expr(args);
                self.blocks.push(Block::If);
                self.tag(trim_left, &format!("if {}", cond), trim_right);
            }
            "else" => {
                let in_if = matches!(self.blocks.last(), Some(Block::If));
                match split_keyword(args) {
                    ("", _) if !self.blocks.is_empty() => self.tag(trim_left, "else", trim_right),
                    ("if", cond) if in_if => {
                        let cond = self.expr(cond);
                        self.tag(trim_left, &format!("elif {}", cond), trim_right);
                    }
                    _ => return Err(unexpected(trimmed)),
                }
            }
            "range" => {
                let head = self.range_head(args)?;
                self.tag(trim_left, &head, trim_right);
            }
            "end" => {
                let closing = match self.blocks.pop() {
                    Some(Block::If) => "endif",
                    Some(Block::Range { .. }) => "endfor",
                    None => return Err(unexpected(trimmed)),
                };
                self.tag(trim_left, closing, trim_right);
            }
            "with" | "define" | "template" | "block" | "break" | "continue" => {
                return Err(Error::Template(format!(
                    "unsupported action '{}' in {{{{{}}}}}",
                    keyword, trimmed
                )));
            }
            _ => {
                let expr = self.expr(body);
                self.out.push_str(if trim_left { "{{-" } else { "{{" });
                self.out.push_str(&expr);
                self.out.push_str(if trim_right { "-}}" } else { "}}" });
            }
        }
        Ok(())
    }

    /// Build a `for` head and open the loop block.
    fn range_head(&mut self, args: &str) -> Result<String> {
        let head = match args.split_once(":=") {
            Some((vars, iterable)) => {
                let iterable = self.expr(iterable.trim());
                let vars = vars
                    .split(',')
                    .map(|v| loop_variable(v.trim()))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| unexpected(&format!("range {}", args)))?;
                match vars.as_slice() {
                    [value] => {
                        self.blocks.push(Block::Range { dot: value.to_string() });
                        format!("for {} in {}", value, iterable)
                    }
                    [key, value] => {
                        self.blocks.push(Block::Range { dot: value.to_string() });
                        format!("for {}, {} in ({})|items", key, value, iterable)
                    }
                    _ => return Err(unexpected(&format!("range {}", args))),
                }
            }
            None => {
                let iterable = self.expr(args);
                let item = format!("__item{}", self.loops);
                self.loops += 1;
                let head = format!("for {} in {}", item, iterable);
                self.blocks.push(Block::Range { dot: item });
                head
            }
        };
        Ok(head)
    }

    /// Rewrite dotted references and `$` variables inside one expression.
    fn expr(&mut self, text: &str) -> String {
        let dot = self.blocks.iter().rev().find_map(|b| match b {
            Block::Range { dot } => Some(dot.clone()),
            Block::If => None,
        });

        let chars: Vec<char> = text.chars().collect();
        let mut out = String::with_capacity(text.len());
        let mut prev: Option<char> = None;
        let mut quote: Option<char> = None;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            let next = chars.get(i + 1).copied();
            i += 1;

            if let Some(q) = quote {
                if c == q && prev != Some('\\') {
                    quote = None;
                }
                out.push(c);
                prev = Some(c);
                continue;
            }

            match c {
                '"' | '\'' => {
                    quote = Some(c);
                    out.push(c);
                }
                '$' => {
                    let root_field =
                        next == Some('.') && chars.get(i + 1).copied().is_some_and(starts_name);
                    if next.is_some_and(starts_name) {
                        // `$name` is a loop variable
                    } else if root_field {
                        i += 1;
                    } else {
                        out.push_str(RECORD_VAR);
                        self.binds_record = true;
                    }
                }
                '.' if !prev.is_some_and(ends_value) => {
                    if next.is_some_and(starts_name) {
                        if let Some(dot) = &dot {
                            out.push_str(dot);
                            out.push('.');
                        }
                    } else if next.is_some_and(|n| n.is_ascii_digit()) {
                        out.push('.');
                    } else if let Some(dot) = &dot {
                        out.push_str(dot);
                    } else {
                        out.push_str(RECORD_VAR);
                        self.binds_record = true;
                    }
                }
                _ => out.push(c),
            }
            prev = Some(c);
        }
        out
    }

    fn tag(&mut self, trim_left: bool, content: &str, trim_right: bool) {
        self.delimited("{%", trim_left, content, trim_right, "%}");
    }

    fn delimited(
        &mut self,
        open: &str,
        trim_left: bool,
        content: &str,
        trim_right: bool,
        close: &str,
    ) {
        self.out.push_str(open);
        self.out.push_str(if trim_left { "- " } else { " " });
        self.out.push_str(content);
        self.out.push_str(if trim_right { " -" } else { " " });
        self.out.push_str(close);
    }
}

fn split_keyword(text: &str) -> (&str, &str) {
    match text.find(char::is_whitespace) {
        Some(i) => (&text[..i], text[i..].trim_start()),
        None => (text, ""),
    }
}

fn loop_variable(var: &str) -> Option<&str> {
    let name = var.strip_prefix('$')?;
    let valid = name.chars().next().is_some_and(starts_name)
        && name.chars().all(|c| c.is_alphanumeric() || c == '_');
    valid.then_some(name)
}

fn starts_name(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn ends_value(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | ')' | ']' | '}')
}

fn unexpected(action: &str) -> Error {
    Error::Template(format!("unexpected {{{{{}}}}}", action))
}
