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

//! Text template evaluation.
//!
//! Emitted source fragments may contain expansion forms:
//!
//! - `$name` or `$(name)`: replaced by the bound variable text.
//! - `$(a op b)` with op in `+ - * / % & ^`: integer arithmetic,
//!   evaluated to a decimal literal. Operands may themselves be
//!   expansion forms.
//! - `$name(arg, ...)` or `$(name(arg, ...))`: macro expansion. The
//!   bound text is a body with positional parameters `$1`..`$9`; each
//!   parameter is replaced by the matching argument.
//! - `$$`: a literal dollar sign.
//!
//! Templates are parsed into a small expression tree and evaluated
//! tree-first: arguments are fully evaluated before substitution and
//! substituted text is never rescanned, so an inner expansion cannot
//! be corrupted by an outer partial substitution.

use std::collections::BTreeMap;
use std::fmt;

/// Maximum recursive expansion depth, bounding self-referential
/// variable bindings.
const MAX_DEPTH: usize = 32;

const ARITH_OPS: &[char] = &['+', '-', '*', '/', '%', '&', '^'];

/// Template syntax or expansion failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalError {
    /// Byte offset into the template text, where known.
    pub offset: usize,
    pub message: String,
}

impl EvalError {
    fn new(offset: usize, message: impl Into<String>) -> EvalError {
        EvalError { offset, message: message.into() }
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (at offset {})", self.message, self.offset)
    }
}

impl std::error::Error for EvalError {}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seg {
    Text(String),
    /// Positional macro parameter `$1`..`$9`.
    Param(usize),
    Var(String),
    Call { name: String, args: Vec<Template> },
    Arith { op: char, lhs: Template, rhs: Template },
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segs: Vec<Seg>,
}

/// Scoped variable bindings.
///
/// Context binding pushes one scope holding the variables derived from
/// the bound schema node and pops exactly that scope afterwards, so
/// sets from different contexts cannot collide.
#[derive(Debug, Default)]
pub struct Bindings {
    scopes: Vec<BTreeMap<String, String>>,
}

impl Bindings {
    pub fn new() -> Bindings {
        Bindings { scopes: vec![BTreeMap::new()] }
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(BTreeMap::new());
    }

    pub fn pop_scope(&mut self) {
        assert!(self.scopes.len() > 1, "cannot pop the root binding scope");
        self.scopes.pop();
    }

    /// Bind a variable in the innermost scope.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.scopes
            .last_mut()
            .unwrap_or_else(|| unreachable!("bindings always hold a root scope"))
            .insert(name.to_owned(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name)).map(String::as_str)
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Locate the matching closing parenthesis for the one at `open`.
fn matching_paren(input: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (n, c) in input[open..].char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + n);
                }
            }
            _ => (),
        }
    }
    None
}

/// Split at top level commas, honoring nested parentheses.
fn split_args(input: &str) -> Vec<&str> {
    let mut args = vec![];
    let mut depth = 0usize;
    let mut start = 0usize;
    for (n, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                args.push(&input[start..n]);
                start = n + 1;
            }
            _ => (),
        }
    }
    args.push(&input[start..]);
    args
}

/// Locate a top level arithmetic operator: outside parentheses and not
/// part of an expansion form. The first operand must be nonempty so a
/// leading sign reads as part of a literal.
fn find_operator(input: &str) -> Option<(usize, char)> {
    let mut depth = 0usize;
    let mut prev = None;
    for (n, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth > 0 => (),
            _ if ARITH_OPS.contains(&c) => {
                let lhs = input[..n].trim();
                if !lhs.is_empty() && prev != Some('$') {
                    return Some((n, c));
                }
            }
            _ => (),
        }
        prev = Some(c);
    }
    None
}

impl Template {
    /// Parse a template. The text may span multiple lines.
    pub fn parse(input: &str) -> Result<Template, EvalError> {
        let mut segs = vec![];
        let mut text = String::new();
        let mut rest = input;
        let mut base = 0usize;

        while let Some(n) = rest.find('$') {
            text.push_str(&rest[..n]);
            let offset = base + n;
            let after = &rest[n + 1..];
            let next = after.chars().next();

            let consumed = match next {
                Some('$') => {
                    text.push('$');
                    2
                }
                Some('(') => {
                    let close = matching_paren(after, 0)
                        .ok_or_else(|| EvalError::new(offset, "unterminated `$(`"))?;
                    if !text.is_empty() {
                        segs.push(Seg::Text(std::mem::take(&mut text)));
                    }
                    segs.push(Self::parse_group(&after[1..close], offset + 2)?);
                    2 + close
                }
                Some(c) if c.is_ascii_digit() => {
                    let index = c.to_digit(10).unwrap_or(0) as usize;
                    if index == 0 {
                        return Err(EvalError::new(offset, "invalid parameter `$0`"));
                    }
                    if !text.is_empty() {
                        segs.push(Seg::Text(std::mem::take(&mut text)));
                    }
                    segs.push(Seg::Param(index));
                    2
                }
                Some(c) if is_ident_start(c) => {
                    let end = after.find(|c| !is_ident(c)).unwrap_or(after.len());
                    let name = &after[..end];
                    if !text.is_empty() {
                        segs.push(Seg::Text(std::mem::take(&mut text)));
                    }
                    if after[end..].starts_with('(') {
                        let close = matching_paren(after, end)
                            .ok_or_else(|| EvalError::new(offset, "unterminated argument list"))?;
                        let args = split_args(&after[end + 1..close])
                            .iter()
                            .map(|arg| Template::parse(arg.trim()))
                            .collect::<Result<Vec<_>, _>>()?;
                        segs.push(Seg::Call { name: name.to_owned(), args });
                        2 + close
                    } else {
                        segs.push(Seg::Var(name.to_owned()));
                        1 + end
                    }
                }
                _ => {
                    return Err(EvalError::new(
                        offset,
                        format!("dangling `$` before {:?}", next.unwrap_or('\n')),
                    ));
                }
            };
            base += n + consumed;
            rest = &rest[n + consumed..];
        }
        text.push_str(rest);
        if !text.is_empty() {
            segs.push(Seg::Text(text));
        }
        Ok(Template { segs })
    }

    /// Parse the interior of a `$(...)` group: arithmetic, a variable
    /// reference, or a macro call.
    fn parse_group(content: &str, offset: usize) -> Result<Seg, EvalError> {
        if let Some((n, op)) = find_operator(content) {
            let lhs = Template::parse(content[..n].trim())?;
            let rhs = Template::parse(content[n + 1..].trim())?;
            return Ok(Seg::Arith { op, lhs, rhs });
        }

        let content_trimmed = content.trim();
        if !content_trimmed.is_empty()
            && content_trimmed.starts_with(is_ident_start)
            && content_trimmed.chars().all(is_ident)
        {
            return Ok(Seg::Var(content_trimmed.to_owned()));
        }

        if let Some(open) = content_trimmed.find('(') {
            let name = &content_trimmed[..open];
            if !name.is_empty()
                && name.starts_with(is_ident_start)
                && name.chars().all(is_ident)
                && content_trimmed.ends_with(')')
            {
                let args = split_args(&content_trimmed[open + 1..content_trimmed.len() - 1])
                    .iter()
                    .map(|arg| Template::parse(arg.trim()))
                    .collect::<Result<Vec<_>, _>>()?;
                return Ok(Seg::Call { name: name.to_owned(), args });
            }
        }

        Err(EvalError::new(offset, format!("invalid expansion `$({content})`")))
    }

    /// Test if the template contains positional parameters, i.e. is a
    /// macro body requiring arguments.
    pub fn has_params(&self) -> bool {
        self.segs.iter().any(|seg| matches!(seg, Seg::Param(_)))
    }

    pub fn eval(&self, vars: &Bindings) -> Result<String, EvalError> {
        self.eval_inner(vars, None, 0)
    }

    fn eval_inner(
        &self,
        vars: &Bindings,
        params: Option<&[String]>,
        depth: usize,
    ) -> Result<String, EvalError> {
        if depth > MAX_DEPTH {
            return Err(EvalError::new(0, "expansion exceeds the recursion limit"));
        }

        let mut out = String::new();
        for seg in &self.segs {
            match seg {
                Seg::Text(text) => out.push_str(text),
                Seg::Param(index) => {
                    let text = params.and_then(|p| p.get(index - 1)).ok_or_else(|| {
                        EvalError::new(0, format!("parameter `${index}` has no argument"))
                    })?;
                    out.push_str(text);
                }
                Seg::Var(name) => {
                    let body = Self::lookup(vars, name)?;
                    if body.has_params() {
                        return Err(EvalError::new(
                            0,
                            format!("macro `{name}` expanded without arguments"),
                        ));
                    }
                    out.push_str(&body.eval_inner(vars, None, depth + 1)?);
                }
                Seg::Call { name, args } => {
                    let args = args
                        .iter()
                        .map(|arg| arg.eval_inner(vars, params, depth + 1))
                        .collect::<Result<Vec<_>, _>>()?;
                    let body = Self::lookup(vars, name)?;
                    if body.has_params() {
                        out.push_str(&body.eval_inner(vars, Some(&args), depth + 1)?);
                    } else {
                        // A plain variable followed by an argument
                        // list: expand the variable and keep the
                        // evaluated arguments as call syntax.
                        out.push_str(&body.eval_inner(vars, None, depth + 1)?);
                        out.push('(');
                        out.push_str(&args.join(", "));
                        out.push(')');
                    }
                }
                Seg::Arith { op, lhs, rhs } => {
                    let lhs = Self::integer(&lhs.eval_inner(vars, params, depth + 1)?)?;
                    let rhs = Self::integer(&rhs.eval_inner(vars, params, depth + 1)?)?;
                    let value = match op {
                        '+' => lhs.wrapping_add(rhs),
                        '-' => lhs.wrapping_sub(rhs),
                        '*' => lhs.wrapping_mul(rhs),
                        '/' | '%' if rhs == 0 => {
                            return Err(EvalError::new(0, "division by zero in expansion"))
                        }
                        '/' => lhs.wrapping_div(rhs),
                        '%' => lhs.wrapping_rem(rhs),
                        '&' => lhs & rhs,
                        '^' => lhs ^ rhs,
                        _ => unreachable!("operator {op} is not parsed"),
                    };
                    out.push_str(&value.to_string());
                }
            }
        }
        Ok(out)
    }

    fn lookup(vars: &Bindings, name: &str) -> Result<Template, EvalError> {
        let text = vars
            .get(name)
            .ok_or_else(|| EvalError::new(0, format!("unbound variable `${name}`")))?;
        Template::parse(text)
    }

    fn integer(text: &str) -> Result<i64, EvalError> {
        let text = text.trim();
        let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X"))
        {
            i64::from_str_radix(hex, 16)
        } else {
            text.parse()
        };
        parsed.map_err(|_| EvalError::new(0, format!("`{text}` is not an integer")))
    }
}

/// Parse and evaluate a template in one step.
pub fn expand(input: &str, vars: &Bindings) -> Result<String, EvalError> {
    Template::parse(input)?.eval(vars)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings(pairs: &[(&str, &str)]) -> Bindings {
        let mut vars = Bindings::new();
        for (name, value) in pairs {
            vars.set(name, *value);
        }
        vars
    }

    #[test]
    fn plain_text_passes_through() {
        let vars = Bindings::new();
        assert_eq!(expand("size_t p = *pos;", &vars).unwrap(), "size_t p = *pos;");
        assert_eq!(expand("cost: $$12", &vars).unwrap(), "cost: $12");
    }

    #[test]
    fn variable_expansion() {
        let vars = bindings(&[("member", "this->count"), ("ctype", "uint32_t")]);
        assert_eq!(
            expand("$ctype value = $member;", &vars).unwrap(),
            "uint32_t value = this->count;"
        );
        assert_eq!(expand("$(ctype)", &vars).unwrap(), "uint32_t");
    }

    #[test]
    fn unbound_variable_is_an_error() {
        let vars = Bindings::new();
        assert!(expand("$nonesuch", &vars).is_err());
    }

    #[test]
    fn arithmetic() {
        let vars = bindings(&[("bits", "32")]);
        assert_eq!(expand("$(1 + 2)", &vars).unwrap(), "3");
        assert_eq!(expand("$(10 - 3)", &vars).unwrap(), "7");
        assert_eq!(expand("$(6 * 7)", &vars).unwrap(), "42");
        assert_eq!(expand("$(32 / 8)", &vars).unwrap(), "4");
        assert_eq!(expand("$(37 % 8)", &vars).unwrap(), "5");
        assert_eq!(expand("$(0xff & 15)", &vars).unwrap(), "15");
        assert_eq!(expand("$(5 ^ 1)", &vars).unwrap(), "4");
        // Operands may themselves be expansions.
        assert_eq!(expand("$($bits / 8)", &vars).unwrap(), "4");
        assert_eq!(expand("$($bits - 1)", &vars).unwrap(), "31");
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let vars = Bindings::new();
        assert!(expand("$(1 / 0)", &vars).is_err());
        assert!(expand("$(1 % 0)", &vars).is_err());
    }

    #[test]
    fn macro_call() {
        let vars = bindings(&[("check", "if (p + $1 > cap) return -$2;")]);
        assert_eq!(
            expand("$check(4, ERR_SPACE)", &vars).unwrap(),
            "if (p + 4 > cap) return -ERR_SPACE;"
        );
        assert_eq!(
            expand("$(check(8, ERR_SPACE))", &vars).unwrap(),
            "if (p + 8 > cap) return -ERR_SPACE;"
        );
    }

    #[test]
    fn macro_arguments_are_evaluated_first() {
        let vars = bindings(&[
            ("store", "dst[p] = $1;"),
            ("value", "this->mode"),
            ("shift", "8"),
        ]);
        assert_eq!(
            expand("$store($value >> $shift)", &vars).unwrap(),
            "dst[p] = this->mode >> 8;"
        );
    }

    #[test]
    fn macro_argument_text_is_not_rescanned() {
        // The evaluated argument contains text that looks like an
        // expansion form; substitution must not evaluate it again.
        let vars = bindings(&[("quote", "/* $1 */"), ("lit", "$$1")]);
        assert_eq!(expand("$quote($lit)", &vars).unwrap(), "/* $1 */");
    }

    #[test]
    fn nested_calls() {
        let vars = bindings(&[
            ("outer", "A($1)B"),
            ("inner", "x$1y"),
        ]);
        assert_eq!(expand("$outer($inner(7))", &vars).unwrap(), "A(x7y)B");
    }

    #[test]
    fn call_of_plain_variable_keeps_call_syntax() {
        let vars = bindings(&[("fn", "mdl_vint_write")]);
        assert_eq!(expand("$fn(dst, cap)", &vars).unwrap(), "mdl_vint_write(dst, cap)");
    }

    #[test]
    fn macro_without_arguments_is_an_error() {
        let vars = bindings(&[("check", "if (p + $1 > cap) return -1;")]);
        assert!(expand("$check", &vars).is_err());
    }

    #[test]
    fn parameter_outside_macro_is_an_error() {
        let vars = Bindings::new();
        assert!(expand("$1", &vars).is_err());
    }

    #[test]
    fn recursive_binding_is_an_error() {
        let vars = bindings(&[("loop", "$loop")]);
        assert!(expand("$loop", &vars).is_err());
    }

    #[test]
    fn unterminated_group_is_an_error() {
        let vars = Bindings::new();
        assert!(expand("$(1 + 2", &vars).is_err());
        assert!(expand("$(foo(1, 2)", &vars).is_err());
    }

    #[test]
    fn scoped_bindings() {
        let mut vars = Bindings::new();
        vars.set("name", "outer");
        vars.push_scope();
        vars.set("name", "inner");
        assert_eq!(vars.get("name"), Some("inner"));
        vars.pop_scope();
        assert_eq!(vars.get("name"), Some("outer"));
    }

    #[test]
    fn multiline_template() {
        let vars = bindings(&[("tag", "0x08")]);
        let text = "dst[p] = $tag;\np += $(0x08 & 7);\n";
        assert_eq!(expand(text, &vars).unwrap(), "dst[p] = 0x08;\np += 0;\n");
    }
}
