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

//! Primitive variant catalog.
//!
//! A library source buffer holds alternative implementations of each
//! low level wire primitive. Each template carries the configuration
//! constraints under which it applies; selection returns the first
//! registered variant whose constraints all hold. The catalog is
//! immutable once parsed and owned by the caller, so independent
//! generation runs can share it read-only.
//!
//! Template headers are structured comments:
//!
//! ```text
//! //% name: mdl_vint_write
//! //% variant: wide
//! //% when: varint_width = 64
//! //% needs: mdl_wiresize
//! //% include: <stdint.h>
//! int mdl_vint_write(...) { ... }
//! ```

use codespan_reporting::diagnostic::Diagnostic;
use std::collections::BTreeMap;

use crate::analyzer::{Diagnostics, ErrorCode};
use crate::ast::{SourceDatabase, SourceLocation, SourceRange};
use crate::corelib;
use crate::options::Options;

/// Body classification; each kind is emitted differently.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TemplateKind {
    /// Plain function: declaration and definition can be split.
    Function,
    /// `#define`: emitted whole wherever it is needed.
    Macro,
    /// C++ template: definition must be visible at the call site.
    Generic,
    /// `struct`/`union`/`typedef` declaration.
    TypeDecl,
}

/// One candidate implementation of a primitive function.
#[derive(Debug, Clone)]
pub struct CodeTemplate {
    pub loc: SourceRange,
    /// Primitive function identifier the variant implements.
    pub name: String,
    /// Variant label for forced selection.
    pub variant: Option<String>,
    /// Concrete declaration text, used as the uniqueness key between
    /// same-named variants.
    pub signature: String,
    pub kind: TemplateKind,
    pub body: String,
    /// Conjunction of configuration constraints.
    pub constraints: Vec<(String, String)>,
    /// Primitives the body calls.
    pub depends: Vec<String>,
    /// Headers the body requires.
    pub includes: Vec<String>,
}

impl CodeTemplate {
    /// Declaration line for split emission, or `None` when the kind
    /// only supports whole-body emission. Externally linked
    /// declarations must not repeat default arguments.
    pub fn declaration(&self, strip_defaults: bool) -> Option<String> {
        if self.kind != TemplateKind::Function {
            return None;
        }
        let signature =
            if strip_defaults { strip_default_arguments(&self.signature) } else { self.signature.clone() };
        Some(format!("{signature};"))
    }
}

/// Remove ` = default` initializers from a parameter list.
fn strip_default_arguments(signature: &str) -> String {
    let mut out = String::new();
    let mut depth = 0usize;
    let mut skipping = false;
    for c in signature.chars() {
        match c {
            '(' => {
                depth += 1;
                out.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                skipping = false;
                out.push(c);
            }
            ',' if depth == 1 => {
                skipping = false;
                out.push(c);
            }
            '=' if depth == 1 => skipping = true,
            _ if skipping => (),
            _ => out.push(c),
        }
    }
    // Collapse the space left behind before `,` and `)`.
    out.replace(" ,", ",").replace(" )", ")")
}

/// Multi-map from primitive identifier to candidate templates, in
/// registration order.
#[derive(Debug, Default)]
pub struct CodeLibrary {
    templates: BTreeMap<String, Vec<CodeTemplate>>,
}

struct Pending {
    loc: SourceRange,
    name: String,
    variant: Option<String>,
    constraints: Vec<(String, String)>,
    depends: Vec<String>,
    includes: Vec<String>,
    body: Vec<String>,
}

impl CodeLibrary {
    pub fn new() -> CodeLibrary {
        CodeLibrary::default()
    }

    /// Parse the built-in primitive catalog.
    pub fn core(sources: &mut SourceDatabase) -> Result<CodeLibrary, Diagnostics> {
        let mut library = CodeLibrary::new();
        library.parse(sources, "<corelib>", corelib::SOURCE)?;
        Ok(library)
    }

    /// Parse a library source buffer and register its templates. The
    /// buffer is added to the source database so diagnostics carry
    /// positions.
    pub fn parse(
        &mut self,
        sources: &mut SourceDatabase,
        name: &str,
        text: &str,
    ) -> Result<(), Diagnostics> {
        let file = sources.add(name.to_owned(), text.to_owned());
        let mut diagnostics = Diagnostics::default();
        let mut pending: Option<Pending> = None;

        let mut offset = 0usize;
        for (line_index, line) in text.lines().enumerate() {
            let loc = SourceRange {
                file,
                start: SourceLocation { offset, line: line_index, column: 0 },
                end: SourceLocation {
                    offset: offset + line.len(),
                    line: line_index,
                    column: line.len(),
                },
            };
            offset += line.len() + 1;

            let trimmed = line.trim();
            let Some(directive) = trimmed.strip_prefix("//%") else {
                if let Some(pending) = pending.as_mut() {
                    pending.body.push(line.to_owned());
                } else if !trimmed.is_empty() {
                    diagnostics.push(
                        Diagnostic::error()
                            .with_code(ErrorCode::TemplateSyntax)
                            .with_message("code before the first template header")
                            .with_labels(vec![loc.primary()]),
                    );
                }
                continue;
            };

            let Some((key, value)) = directive.split_once(':') else {
                diagnostics.push(
                    Diagnostic::error()
                        .with_code(ErrorCode::TemplateSyntax)
                        .with_message(format!("malformed template directive `{trimmed}`"))
                        .with_labels(vec![loc.primary()]),
                );
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            if key == "name" {
                if let Some(done) = pending.take() {
                    self.finish_template(done, &mut diagnostics);
                }
                pending = Some(Pending {
                    loc,
                    name: value.to_owned(),
                    variant: None,
                    constraints: vec![],
                    depends: vec![],
                    includes: vec![],
                    body: vec![],
                });
                continue;
            }

            let Some(current) = pending.as_mut() else {
                diagnostics.push(
                    Diagnostic::error()
                        .with_code(ErrorCode::TemplateSyntax)
                        .with_message(format!("directive `{key}` before any `name` header"))
                        .with_labels(vec![loc.primary()]),
                );
                continue;
            };
            match key {
                "variant" => current.variant = Some(value.to_owned()),
                "when" => match value.split_once('=') {
                    Some((k, v)) => {
                        current.constraints.push((k.trim().to_owned(), v.trim().to_owned()))
                    }
                    None => diagnostics.push(
                        Diagnostic::error()
                            .with_code(ErrorCode::TemplateSyntax)
                            .with_message(format!("malformed constraint `{value}`"))
                            .with_labels(vec![loc.primary()]),
                    ),
                },
                "needs" => current
                    .depends
                    .extend(value.split(',').map(str::trim).map(str::to_owned)),
                "include" => current.includes.push(value.to_owned()),
                _ => diagnostics.push(
                    Diagnostic::error()
                        .with_code(ErrorCode::TemplateSyntax)
                        .with_message(format!("unknown template directive `{key}`"))
                        .with_labels(vec![loc.primary()]),
                ),
            }
        }
        if let Some(done) = pending.take() {
            self.finish_template(done, &mut diagnostics);
        }
        diagnostics.err_or(())
    }

    fn finish_template(&mut self, pending: Pending, diagnostics: &mut Diagnostics) {
        // Trim the blank lines separating templates in the buffer.
        let mut body = pending.body;
        while body.first().is_some_and(|l| l.trim().is_empty()) {
            body.remove(0);
        }
        while body.last().is_some_and(|l| l.trim().is_empty()) {
            body.pop();
        }
        if body.is_empty() {
            diagnostics.push(
                Diagnostic::error()
                    .with_code(ErrorCode::TemplateSyntax)
                    .with_message(format!("template `{}` has an empty body", pending.name))
                    .with_labels(vec![pending.loc.primary()]),
            );
            return;
        }

        let first = body[0].trim();
        let kind = if first.starts_with("#define") {
            TemplateKind::Macro
        } else if first.starts_with("template") {
            TemplateKind::Generic
        } else if first.starts_with("struct")
            || first.starts_with("union")
            || first.starts_with("typedef")
        {
            TemplateKind::TypeDecl
        } else {
            TemplateKind::Function
        };
        let signature = match kind {
            TemplateKind::Macro => first.to_owned(),
            _ => first
                .split_once('{')
                .map(|(sig, _)| sig)
                .unwrap_or(first)
                .trim_end_matches(';')
                .trim()
                .to_owned(),
        };

        let template = CodeTemplate {
            loc: pending.loc,
            name: pending.name,
            variant: pending.variant,
            signature,
            kind,
            body: body.join("\n"),
            constraints: pending.constraints,
            depends: pending.depends,
            includes: pending.includes,
        };

        // Same-signature variants are legitimate alternatives as long
        // as their constraints differ; an identical constraint set is
        // a true duplicate.
        let candidates = self.templates.entry(template.name.clone()).or_default();
        if let Some(prev) = candidates
            .iter()
            .find(|t| t.signature == template.signature && t.constraints == template.constraints)
        {
            diagnostics.push(
                Diagnostic::error()
                    .with_code(ErrorCode::TemplateSyntax)
                    .with_message(format!(
                        "duplicate variant signature for primitive `{}`",
                        template.name
                    ))
                    .with_labels(vec![
                        template.loc.primary(),
                        prev.loc.secondary().with_message("first registered here"),
                    ]),
            );
            return;
        }
        candidates.push(template);
    }

    /// Registered primitive identifiers.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    pub fn variants(&self, name: &str) -> &[CodeTemplate] {
        self.templates.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Select the variant implementing `name` under the given
    /// configuration: the first registered candidate whose every
    /// constraint is either absent from the configuration or equal to
    /// it. A configuration value mapping the literal function name to
    /// a variant label overrides constraint matching entirely.
    ///
    /// Returns `None` when nothing matches; callers report a
    /// missing-implementation diagnostic and emit a placeholder
    /// rather than aborting.
    pub fn find(&self, name: &str, options: &Options) -> Option<&CodeTemplate> {
        let candidates = self.templates.get(name)?;
        if let Some(forced) = options.value(name) {
            return candidates.iter().find(|t| t.variant.as_deref() == Some(forced));
        }
        candidates.iter().find(|t| {
            t.constraints
                .iter()
                .all(|(key, value)| match options.constraint_value(key) {
                    Some(actual) => actual == *value,
                    None => true,
                })
        })
    }

    /// Resolve the transitive dependencies of `name` into `order`,
    /// dependencies ahead of dependents. A primitive already present
    /// is hoisted back to the front when re-requested. A circular
    /// dependency is returned as the chain of names forming the
    /// cycle.
    pub fn add_dependencies(
        &self,
        options: &Options,
        order: &mut Vec<String>,
        name: &str,
    ) -> Result<(), Vec<String>> {
        let mut stack = vec![];
        self.add_dependencies_inner(options, order, name, &mut stack)
    }

    fn add_dependencies_inner(
        &self,
        options: &Options,
        order: &mut Vec<String>,
        name: &str,
        stack: &mut Vec<String>,
    ) -> Result<(), Vec<String>> {
        if let Some(position) = stack.iter().position(|s| s == name) {
            let mut cycle = stack[position..].to_vec();
            cycle.push(name.to_owned());
            return Err(cycle);
        }
        if let Some(position) = order.iter().position(|s| s == name) {
            order.remove(position);
        }
        order.insert(0, name.to_owned());

        if let Some(template) = self.find(name, options) {
            stack.push(name.to_owned());
            for dependency in &template.depends {
                self.add_dependencies_inner(options, order, dependency, stack)?;
            }
            stack.pop();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Diagnostics;

    fn parse(text: &str) -> CodeLibrary {
        let mut sources = SourceDatabase::new();
        let mut library = CodeLibrary::new();
        library.parse(&mut sources, "test", text).unwrap();
        library
    }

    #[test]
    fn parse_core_library() {
        let mut sources = SourceDatabase::new();
        let library = CodeLibrary::core(&mut sources).unwrap();
        let names: Vec<&str> = library.names().collect();
        for name in [
            "mdl_escape",
            "mdl_fail",
            "mdl_load_fixed",
            "mdl_put_bytes",
            "mdl_skip_field",
            "mdl_store_fixed",
            "mdl_unzigzag",
            "mdl_vint_read",
            "mdl_vint_write",
            "mdl_wiresize",
            "mdl_zigzag",
        ] {
            assert!(names.contains(&name), "missing primitive {name}");
        }
    }

    #[test]
    fn template_kinds_are_classified() {
        let library = parse(
            "//% name: a\n\
             #define a(x) (x)\n\
             //% name: b\n\
             int b(void) { return 0; }\n\
             //% name: c\n\
             template <typename T> T c(T x) { return x; }\n\
             //% name: d\n\
             union d { float f; uint32_t u; };\n",
        );
        assert_eq!(library.variants("a")[0].kind, TemplateKind::Macro);
        assert_eq!(library.variants("b")[0].kind, TemplateKind::Function);
        assert_eq!(library.variants("c")[0].kind, TemplateKind::Generic);
        assert_eq!(library.variants("d")[0].kind, TemplateKind::TypeDecl);
    }

    #[test]
    fn signature_is_extracted() {
        let library = parse("//% name: f\nint f(uint8_t *dst, size_t cap)\n{\nreturn 0;\n}\n");
        assert_eq!(library.variants("f")[0].signature, "int f(uint8_t *dst, size_t cap)");
    }

    #[test]
    fn constraint_selection() {
        let text = "//% name: f\n\
                    //% variant: fast\n\
                    //% when: optimize = speed\n\
                    int f(void) { return 1; }\n\
                    //% name: f\n\
                    //% variant: small\n\
                    int f(int unused) { return 2; }\n";
        let library = parse(text);

        let options = Options::new("test");
        // No optimize set: the speed constraint is vacuously absent,
        // so the first registered variant wins.
        assert_eq!(library.find("f", &options).unwrap().variant.as_deref(), Some("fast"));

        let mut diagnostics = Diagnostics::default();
        let mut options = Options::new("test");
        options.set_value("optimize", "size", &mut diagnostics);
        assert_eq!(library.find("f", &options).unwrap().variant.as_deref(), Some("small"));

        let mut options = Options::new("test");
        options.set_value("optimize", "speed", &mut diagnostics);
        assert_eq!(library.find("f", &options).unwrap().variant.as_deref(), Some("fast"));

        // Selection is deterministic under an unchanged configuration.
        let first = library.find("f", &options).unwrap().signature.clone();
        assert_eq!(library.find("f", &options).unwrap().signature, first);
    }

    #[test]
    fn forced_variant_overrides_constraints() {
        let text = "//% name: f\n\
                    //% variant: fast\n\
                    //% when: optimize = speed\n\
                    int f(void) { return 1; }\n\
                    //% name: f\n\
                    //% variant: small\n\
                    int f(int unused) { return 2; }\n";
        let library = parse(text);

        let mut diagnostics = Diagnostics::default();
        let mut options = Options::new("test");
        options.set_value("optimize", "size", &mut diagnostics);
        options.set_internal_value("f", "fast");
        assert_eq!(library.find("f", &options).unwrap().variant.as_deref(), Some("fast"));

        // A forced label that matches no variant selects nothing.
        options.set_internal_value("f", "nonesuch");
        assert!(library.find("f", &options).is_none());
    }

    #[test]
    fn missing_primitive_selects_nothing() {
        let library = parse("//% name: f\nint f(void) { return 0; }\n");
        let options = Options::new("test");
        assert!(library.find("g", &options).is_none());
    }

    #[test]
    fn dependencies_precede_dependents() {
        let text = "//% name: a\n\
                    //% needs: b, c\n\
                    int a(void) { return b() + c(); }\n\
                    //% name: b\n\
                    //% needs: c\n\
                    int b(void) { return c(); }\n\
                    //% name: c\n\
                    int c(void) { return 0; }\n";
        let library = parse(text);
        let options = Options::new("test");

        let mut order = vec![];
        library.add_dependencies(&options, &mut order, "a").unwrap();
        let a = order.iter().position(|s| s == "a").unwrap();
        let b = order.iter().position(|s| s == "b").unwrap();
        let c = order.iter().position(|s| s == "c").unwrap();
        assert!(c < b && b < a);
    }

    #[test]
    fn rerequest_hoists_to_front() {
        let text = "//% name: a\nint a(void) { return 0; }\n\
                    //% name: b\nint b(void) { return 0; }\n";
        let library = parse(text);
        let options = Options::new("test");

        let mut order = vec![];
        library.add_dependencies(&options, &mut order, "a").unwrap();
        library.add_dependencies(&options, &mut order, "b").unwrap();
        assert_eq!(order, ["b", "a"]);
        library.add_dependencies(&options, &mut order, "a").unwrap();
        assert_eq!(order, ["a", "b"]);
    }

    #[test]
    fn dependency_cycle_is_an_error() {
        let text = "//% name: a\n\
                    //% needs: b\n\
                    int a(void) { return b(); }\n\
                    //% name: b\n\
                    //% needs: a\n\
                    int b(void) { return a(); }\n";
        let library = parse(text);
        let options = Options::new("test");

        let mut order = vec![];
        let cycle = library.add_dependencies(&options, &mut order, "a").unwrap_err();
        assert_eq!(cycle, ["a", "b", "a"]);
    }

    #[test]
    fn duplicate_signature_is_an_error() {
        let text = "//% name: f\nint f(void) { return 1; }\n\
                    //% name: f\nint f(void) { return 2; }\n";
        let mut sources = SourceDatabase::new();
        let mut library = CodeLibrary::new();
        assert!(library.parse(&mut sources, "test", text).is_err());
    }

    #[test]
    fn same_name_different_signature_is_a_variant() {
        let text = "//% name: wiresize\nsize_t wiresize(uint32_t v) { return 1; }\n\
                    //% name: wiresize\nsize_t wiresize(uint64_t v) { return 1; }\n";
        let library = parse(text);
        assert_eq!(library.variants("wiresize").len(), 2);
    }

    #[test]
    fn same_signature_with_different_constraints_is_a_variant() {
        let text = "//% name: f\n\
                    //% when: optimize = speed\n\
                    int f(void) { return 1; }\n\
                    //% name: f\n\
                    int f(void) { return 2; }\n";
        let library = parse(text);
        assert_eq!(library.variants("f").len(), 2);
    }

    #[test]
    fn declaration_strips_default_arguments() {
        let library =
            parse("//% name: f\nint f(uint8_t *dst, size_t cap = 0)\n{\nreturn 0;\n}\n");
        let template = &library.variants("f")[0];
        assert_eq!(
            template.declaration(false).unwrap(),
            "int f(uint8_t *dst, size_t cap = 0);"
        );
        assert_eq!(template.declaration(true).unwrap(), "int f(uint8_t *dst, size_t cap);");
    }

    #[test]
    fn code_outside_templates_is_an_error() {
        let mut sources = SourceDatabase::new();
        let mut library = CodeLibrary::new();
        assert!(library.parse(&mut sources, "test", "int stray(void);\n").is_err());
    }
}
