// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Output assembly for one generated source unit.
//!
//! Synthesis always emits compound statements with braces; a folding
//! pass deletes blocks that end up empty, and a reflow pass recomputes
//! indentation, so the per-field emission logic never tracks either.

use codespan_reporting::diagnostic::Diagnostic;

use crate::analyzer::{Diagnostics, ErrorCode};
use crate::eval::{expand, Bindings};
use crate::options::Options;

/// Per-unit emission state: the output buffer, the variable bindings
/// visible to template expansion, and the primitive functions the
/// emitted code calls. One generator is consumed per generated unit;
/// none of this state is shared between runs.
pub struct Generator<'a> {
    options: &'a Options,
    pub vars: Bindings,
    out: String,
    required: Vec<String>,
    pub diagnostics: Diagnostics,
}

impl<'a> Generator<'a> {
    pub fn new(options: &'a Options) -> Generator<'a> {
        Generator {
            options,
            vars: Bindings::new(),
            out: String::new(),
            required: vec![],
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn options(&self) -> &'a Options {
        self.options
    }

    /// Bind a variable in the innermost scope. The value is template
    /// text: it may itself contain expansion forms.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.vars.set(name, value);
    }

    /// Bind opaque data in the innermost scope. Dollar signs in the
    /// value are escaped so it can never be misread as template text.
    pub fn set_text(&mut self, name: &str, value: &str) {
        self.vars.set(name, value.replace('$', "$$"));
    }

    /// Run `body` with a fresh binding scope. Bindings made inside are
    /// dropped on return, restoring exactly the previous variable set.
    pub fn scoped<R>(&mut self, body: impl FnOnce(&mut Generator<'a>) -> R) -> R {
        self.vars.push_scope();
        let result = body(self);
        self.vars.pop_scope();
        result
    }

    /// Expand a template and append it to the unit, one line per
    /// template line. Bounds assertion lines are dropped when
    /// assertions are disabled, and lines left empty by expansion are
    /// dropped entirely (deliberate blanks go through
    /// [`Generator::blank_line`]). An expansion error leaves a comment
    /// placeholder so the rest of the unit can still be inspected.
    pub fn emit(&mut self, template: &str) {
        match expand(template, &self.vars) {
            Ok(text) => {
                let assert_prefix = format!("{}(", self.options.assert_macro());
                let strip_asserts = !self.options.assertions();
                for line in text.lines() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if strip_asserts && line.trim_start().starts_with(&assert_prefix) {
                        continue;
                    }
                    self.out.push_str(line);
                    self.out.push('\n');
                }
            }
            Err(err) => {
                self.diagnostics.push(
                    Diagnostic::error()
                        .with_code(ErrorCode::ExpansionError)
                        .with_message(format!("template expansion failed: {err}")),
                );
                self.out.push_str(&format!("/* expansion error: {err} */\n"));
            }
        }
    }

    /// Append text verbatim.
    pub fn emit_raw(&mut self, text: &str) {
        self.out.push_str(text);
        if !text.ends_with('\n') {
            self.out.push('\n');
        }
    }

    pub fn blank_line(&mut self) {
        self.out.push('\n');
    }

    /// Record a primitive function the emitted code calls. Requesting
    /// an already-recorded primitive keeps the first request position.
    pub fn require(&mut self, name: &str) {
        if !self.required.iter().any(|r| r == name) {
            self.required.push(name.to_owned());
        }
    }

    pub fn required(&self) -> &[String] {
        &self.required
    }

    /// Fold empty blocks, reflow indentation, and return the finished
    /// unit text.
    pub fn finish(self) -> (String, Diagnostics, Vec<String>) {
        let text = reflow(&fold_braces(&self.out), self.options.indent_width());
        (text, self.diagnostics, self.required)
    }
}

/// Delete compound blocks that ended up empty: a header line ending in
/// `{` directly followed by its closing `}`. Iterates to a fixpoint so
/// nested empty blocks collapse fully. A `} else {` header folding
/// against `}` leaves a single closing brace for the preceding block.
pub fn fold_braces(text: &str) -> String {
    let mut lines: Vec<String> = text.lines().map(str::to_owned).collect();
    loop {
        let mut found = None;
        for n in 0..lines.len().saturating_sub(1) {
            let header = lines[n].trim();
            if header.ends_with('{') && !header.starts_with("//") && lines[n + 1].trim() == "}" {
                found = Some(n);
                break;
            }
        }
        match found {
            Some(n) => {
                if lines[n].trim().starts_with('}') {
                    // `} else {` style header: keep the brace closing
                    // the preceding block.
                    lines.splice(n..n + 2, ["}".to_owned()]);
                } else {
                    lines.drain(n..n + 2);
                }
            }
            None => break,
        }
    }
    let mut out = lines.join("\n");
    if text.ends_with('\n') && !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Count braces outside string and character literals and comments.
fn brace_delta(line: &str) -> (usize, usize) {
    let mut opens = 0;
    let mut closes = 0;
    let mut chars = line.chars().peekable();
    let mut quote: Option<char> = None;
    while let Some(c) = chars.next() {
        match quote {
            Some(q) => match c {
                '\\' => {
                    chars.next();
                }
                _ if c == q => quote = None,
                _ => (),
            },
            None => match c {
                '"' | '\'' => quote = Some(c),
                '/' if chars.peek() == Some(&'/') => break,
                '{' => opens += 1,
                '}' => closes += 1,
                _ => (),
            },
        }
    }
    (opens, closes)
}

fn is_continuation_header(line: &str) -> bool {
    let opens_block = line.ends_with('{');
    let complete = line.ends_with(';') || line.ends_with('}') || line.ends_with(':');
    if opens_block || complete {
        return false;
    }
    line == "else"
        || line == "do"
        || ["if ", "if (", "for ", "for (", "while ", "while (", "else if", "} else if"]
            .iter()
            .any(|prefix| line.starts_with(prefix))
        || line.starts_with("else ") && line.ends_with(')')
}

/// Recompute indentation from brace depth. `case` and `default`
/// labels dedent by one level; the statement after a braceless
/// `if`/`else`/`for`/`while` header indents by one.
pub fn reflow(text: &str, indent: usize) -> String {
    let mut out = String::new();
    let mut depth = 0usize;
    let mut continuation = false;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            out.push('\n');
            continuation = false;
            continue;
        }

        let (opens, closes) = brace_delta(line);
        let mut level = depth;
        if line.starts_with('}') {
            level = level.saturating_sub(closes.min(level));
        } else if line.starts_with("case ") || line.starts_with("default:") {
            level = level.saturating_sub(1);
        }
        if continuation {
            level += 1;
        }

        // Preprocessor directives stay in column zero.
        if !line.starts_with('#') {
            out.push_str(&" ".repeat(level * indent));
        }
        out.push_str(line);
        out.push('\n');

        depth = (depth + opens).saturating_sub(closes);
        continuation = is_continuation_header(line);
    }
    out
}
