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

//! Hierarchical generation configuration.
//!
//! Configuration nodes form a parent chain (typically a global node, a
//! per-target node, and schema node overrides). Lookup walks from a
//! node towards the root and returns the first non-empty entry, so a
//! node's stated value always wins over an ancestor's.

use codespan_reporting::diagnostic::Diagnostic;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::analyzer::{Diagnostics, ErrorCode};
use crate::ast;

/// Generated code optimization goal.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Optimize {
    Speed,
    Size,
    /// Favor straight-line, auditable output.
    Review,
}

/// Failure behavior compiled into every generated bounds check.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Return a negative diagnostic code.
    Cancel,
    /// Throw an exception carrying a negative diagnostic code.
    Throw,
    /// Abort the process.
    Abort,
}

/// Emission mode for the selected primitive functions.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LibraryMode {
    /// Inline definitions in the declarations unit.
    Inline,
    /// File-local static definitions in the definitions unit.
    Static,
    /// Externally linked definitions in a shared primitives unit.
    Shared,
}

/// Nested type naming style.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Nesting {
    /// `Outer::Inner` class nesting.
    Class,
    /// `Outer_Inner` flattened name mangling.
    Flatten,
}

/// Byte order of fixed width wire values.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

/// Registered option key with its permitted values.
/// An empty value list accepts free-form text. Internal keys bypass
/// the allow-list entirely (used for forced variant selection, where
/// the key is a primitive function name).
struct OptionDef {
    key: &'static str,
    values: &'static [&'static str],
    flag: bool,
}

const OPTION_DEFS: &[OptionDef] = &[
    OptionDef { key: "optimize", values: &["speed", "size", "review"], flag: false },
    OptionDef { key: "varint_width", values: &["16", "32", "64"], flag: false },
    OptionDef { key: "endianness", values: &["little", "big"], flag: false },
    OptionDef { key: "error_policy", values: &["cancel", "throw", "abort"], flag: false },
    OptionDef { key: "library_mode", values: &["inline", "static", "shared"], flag: false },
    OptionDef { key: "member_sort", values: &["sorted", "unsorted"], flag: false },
    OptionDef { key: "nested_naming", values: &["class", "flatten"], flag: false },
    OptionDef { key: "storage", values: &["regular", "virtual", "static"], flag: false },
    OptionDef { key: "terminator", values: &["none", "0x00", "0xff"], flag: false },
    OptionDef { key: "unknown_fields", values: &["skip", "fail"], flag: false },
    OptionDef { key: "indent", values: &[], flag: false },
    OptionDef { key: "namespace", values: &[], flag: false },
    OptionDef { key: "assert_macro", values: &[], flag: false },
    OptionDef { key: "assertions", values: &[], flag: true },
    OptionDef { key: "enum_aliases", values: &[], flag: true },
    OptionDef { key: "allow_zero_id", values: &[], flag: true },
    OptionDef { key: "enum_text", values: &[], flag: true },
];

fn lookup_def(key: &str) -> Option<&'static OptionDef> {
    OPTION_DEFS.iter().find(|def| def.key == key)
}

/// Value of a per-node path override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverrideValue {
    Text(String),
    Flag(bool),
}

/// Option override addressed to a schema node by slash-separated path,
/// e.g. `/Response/Status/code`.
#[derive(Debug, Clone)]
pub struct NodeOverride {
    pub path: String,
    pub key: String,
    pub value: OverrideValue,
}

/// One configuration node.
#[derive(Debug, Default)]
pub struct Options {
    name: String,
    parent: Option<Rc<Options>>,
    flags: BTreeMap<String, bool>,
    values: BTreeMap<String, String>,
    overrides: Vec<NodeOverride>,
}

impl Options {
    pub fn new(name: &str) -> Options {
        Options { name: name.to_owned(), ..Default::default() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach the parent node. A node has exactly one parent; a second
    /// assignment is a programming error.
    pub fn set_parent(&mut self, parent: Rc<Options>) {
        assert!(self.parent.is_none(), "configuration `{}` already has a parent", self.name);
        self.parent = Some(parent);
    }

    /// Set a text option, validating the key and value against the
    /// registered allow-list. An unknown key or disallowed value
    /// records a non-fatal diagnostic and leaves the prior value
    /// unchanged.
    pub fn set_value(&mut self, key: &str, value: &str, diagnostics: &mut Diagnostics) {
        match lookup_def(key) {
            None => diagnostics.push(
                Diagnostic::warning()
                    .with_code(ErrorCode::UnknownOption)
                    .with_message(format!("unknown option `{key}` in configuration `{}`", self.name)),
            ),
            Some(def) if def.flag => diagnostics.push(
                Diagnostic::warning()
                    .with_code(ErrorCode::InvalidOptionValue)
                    .with_message(format!("option `{key}` is a flag, expected true/false")),
            ),
            Some(def) if !def.values.is_empty() && !def.values.contains(&value) => {
                diagnostics.push(
                    Diagnostic::warning()
                        .with_code(ErrorCode::InvalidOptionValue)
                        .with_message(format!(
                            "invalid value `{value}` for option `{key}`, expected one of {}",
                            def.values.join(", ")
                        )),
                )
            }
            Some(_) => {
                self.values.insert(key.to_owned(), value.to_owned());
            }
        }
    }

    /// Set a boolean flag, validating the key against the allow-list.
    pub fn set_flag(&mut self, key: &str, value: bool, diagnostics: &mut Diagnostics) {
        match lookup_def(key) {
            None => diagnostics.push(
                Diagnostic::warning()
                    .with_code(ErrorCode::UnknownOption)
                    .with_message(format!("unknown flag `{key}` in configuration `{}`", self.name)),
            ),
            Some(def) if !def.flag => diagnostics.push(
                Diagnostic::warning()
                    .with_code(ErrorCode::InvalidOptionValue)
                    .with_message(format!("option `{key}` takes a value, not a flag")),
            ),
            Some(_) => {
                self.flags.insert(key.to_owned(), value);
            }
        }
    }

    /// Set an option bypassing the allow-list. Used for keys the
    /// registry cannot enumerate, such as forced variant selection
    /// where the key is a primitive function name.
    pub fn set_internal_value(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_owned(), value.to_owned());
    }

    /// Register a per-node override. The key is validated here; the
    /// path is resolved against the schema tree during analysis.
    pub fn add_override(
        &mut self,
        path: &str,
        key: &str,
        value: OverrideValue,
        diagnostics: &mut Diagnostics,
    ) {
        let valid = match (&value, lookup_def(key)) {
            (_, None) => {
                diagnostics.push(
                    Diagnostic::warning()
                        .with_code(ErrorCode::UnknownOption)
                        .with_message(format!("unknown option `{key}` in override for `{path}`")),
                );
                false
            }
            (OverrideValue::Flag(_), Some(def)) if !def.flag => {
                diagnostics.push(
                    Diagnostic::warning()
                        .with_code(ErrorCode::InvalidOptionValue)
                        .with_message(format!("option `{key}` takes a value, not a flag")),
                );
                false
            }
            (OverrideValue::Text(text), Some(def)) => {
                if def.flag {
                    diagnostics.push(
                        Diagnostic::warning()
                            .with_code(ErrorCode::InvalidOptionValue)
                            .with_message(format!("option `{key}` is a flag, expected true/false")),
                    );
                    false
                } else if !def.values.is_empty() && !def.values.contains(&text.as_str()) {
                    diagnostics.push(
                        Diagnostic::warning()
                            .with_code(ErrorCode::InvalidOptionValue)
                            .with_message(format!("invalid value `{text}` for option `{key}`")),
                    );
                    false
                } else {
                    true
                }
            }
            (OverrideValue::Flag(_), Some(_)) => true,
        };
        if valid {
            self.overrides.push(NodeOverride {
                path: path.to_owned(),
                key: key.to_owned(),
                value,
            });
        }
    }

    pub fn overrides(&self) -> &[NodeOverride] {
        &self.overrides
    }

    /// Look up a text option, walking the parent chain. An empty value
    /// defaults to the inherited one.
    pub fn value(&self, key: &str) -> Option<&str> {
        let mut node = Some(self);
        while let Some(options) = node {
            match options.values.get(key) {
                Some(value) if !value.is_empty() => return Some(value),
                _ => node = options.parent.as_deref(),
            }
        }
        None
    }

    /// Look up a boolean flag, walking the parent chain.
    pub fn flag(&self, key: &str) -> Option<bool> {
        let mut node = Some(self);
        while let Some(options) = node {
            match options.flags.get(key) {
                Some(value) => return Some(*value),
                None => node = options.parent.as_deref(),
            }
        }
        None
    }

    /// Look up a constraint key: text options and flags share the key
    /// space for variant constraint matching, flags rendering as
    /// `true`/`false`.
    pub fn constraint_value(&self, key: &str) -> Option<String> {
        if let Some(value) = self.value(key) {
            return Some(value.to_owned());
        }
        self.flag(key).map(|value| if value { "true".to_owned() } else { "false".to_owned() })
    }

    /// Look up a text option with a schema node's own values taking
    /// precedence over the configuration chain.
    pub fn value_for<'a>(&'a self, node: &'a ast::NodeOptions, key: &str) -> Option<&'a str> {
        node.value(key).or_else(|| self.value(key))
    }

    pub fn flag_for(&self, node: &ast::NodeOptions, key: &str) -> Option<bool> {
        node.flag(key).or_else(|| self.flag(key))
    }

    // Typed accessors for the generation axes. Invalid values are
    // rejected at set time, so parsing falls back to the default.

    pub fn optimize(&self) -> Optimize {
        match self.value("optimize") {
            Some("speed") => Optimize::Speed,
            Some("review") => Optimize::Review,
            _ => Optimize::Size,
        }
    }

    pub fn varint_width(&self) -> usize {
        match self.value("varint_width") {
            Some("16") => 16,
            Some("32") => 32,
            _ => 64,
        }
    }

    pub fn byte_order(&self) -> ByteOrder {
        match self.value("endianness") {
            Some("big") => ByteOrder::Big,
            _ => ByteOrder::Little,
        }
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        match self.value("error_policy") {
            Some("throw") => ErrorPolicy::Throw,
            Some("abort") => ErrorPolicy::Abort,
            _ => ErrorPolicy::Cancel,
        }
    }

    pub fn library_mode(&self) -> LibraryMode {
        match self.value("library_mode") {
            Some("inline") => LibraryMode::Inline,
            Some("shared") => LibraryMode::Shared,
            _ => LibraryMode::Static,
        }
    }

    pub fn member_sort(&self) -> ast::SortMode {
        match self.value("member_sort") {
            Some("unsorted") => ast::SortMode::Unsorted,
            _ => ast::SortMode::Sorted,
        }
    }

    pub fn nesting(&self) -> Nesting {
        match self.value("nested_naming") {
            Some("class") => Nesting::Class,
            _ => Nesting::Flatten,
        }
    }

    pub fn storage(&self, node: &ast::NodeOptions) -> ast::StorageMode {
        match self.value_for(node, "storage") {
            Some("virtual") => ast::StorageMode::Virtual,
            Some("static") => ast::StorageMode::Static,
            _ => ast::StorageMode::Regular,
        }
    }

    /// Stream terminator byte ending a decode loop early, if enabled.
    pub fn terminator(&self) -> Option<u8> {
        match self.value("terminator") {
            Some("0x00") => Some(0x00),
            Some("0xff") => Some(0xff),
            _ => None,
        }
    }

    /// Whether unrecognized tags are skipped or fatal on decode.
    pub fn skip_unknown(&self) -> bool {
        !matches!(self.value("unknown_fields"), Some("fail"))
    }

    pub fn indent_width(&self) -> usize {
        self.value("indent").and_then(|v| v.parse().ok()).unwrap_or(4)
    }

    pub fn namespace(&self) -> Option<&str> {
        self.value("namespace")
    }

    pub fn assert_macro(&self) -> &str {
        self.value("assert_macro").unwrap_or("MDL_CHECK")
    }

    pub fn assertions(&self) -> bool {
        self.flag("assertions").unwrap_or(false)
    }

    pub fn enum_aliases(&self) -> bool {
        self.flag("enum_aliases").unwrap_or(false)
    }

    pub fn allow_zero_id(&self) -> bool {
        self.flag("allow_zero_id").unwrap_or(false)
    }

    pub fn enum_text(&self) -> bool {
        self.flag("enum_text").unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_chain_fallback() {
        let mut diagnostics = Diagnostics::default();
        let mut root = Options::new("global");
        root.set_value("optimize", "speed", &mut diagnostics);
        root.set_flag("assertions", true, &mut diagnostics);
        let root = Rc::new(root);

        let mut target = Options::new("target");
        target.set_parent(root.clone());
        assert_eq!(target.value("optimize"), Some("speed"));
        assert_eq!(target.optimize(), Optimize::Speed);
        assert!(target.assertions());

        // The node's own value wins over the ancestor's.
        target.set_value("optimize", "size", &mut diagnostics);
        assert_eq!(target.optimize(), Optimize::Size);
        assert_eq!(root.optimize(), Optimize::Speed);
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn empty_value_inherits() {
        let mut diagnostics = Diagnostics::default();
        let mut root = Options::new("global");
        root.set_value("namespace", "acme", &mut diagnostics);
        let root = Rc::new(root);

        let mut target = Options::new("target");
        target.set_parent(root);
        target.set_value("namespace", "", &mut diagnostics);
        assert_eq!(target.namespace(), Some("acme"));
    }

    #[test]
    #[should_panic(expected = "already has a parent")]
    fn double_parent_assignment() {
        let root = Rc::new(Options::new("global"));
        let mut target = Options::new("target");
        target.set_parent(root.clone());
        target.set_parent(root);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let mut diagnostics = Diagnostics::default();
        let mut options = Options::new("target");
        options.set_value("optimise", "speed", &mut diagnostics);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(options.value("optimise"), None);

        // Internal values bypass the allow-list.
        options.set_internal_value("mdl_vint_write", "unrolled");
        assert_eq!(options.value("mdl_vint_write"), Some("unrolled"));
    }

    #[test]
    fn invalid_value_keeps_prior() {
        let mut diagnostics = Diagnostics::default();
        let mut options = Options::new("target");
        options.set_value("error_policy", "throw", &mut diagnostics);
        options.set_value("error_policy", "panic", &mut diagnostics);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(options.error_policy(), ErrorPolicy::Throw);
    }

    #[test]
    fn flag_and_value_kinds_are_distinct() {
        let mut diagnostics = Diagnostics::default();
        let mut options = Options::new("target");
        options.set_flag("optimize", true, &mut diagnostics);
        options.set_value("assertions", "yes", &mut diagnostics);
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(options.value("optimize"), None);
        assert_eq!(options.flag("assertions"), None);
    }

    #[test]
    fn constraint_values_cover_flags() {
        let mut diagnostics = Diagnostics::default();
        let mut options = Options::new("target");
        options.set_flag("assertions", true, &mut diagnostics);
        options.set_value("optimize", "size", &mut diagnostics);
        assert_eq!(options.constraint_value("assertions").as_deref(), Some("true"));
        assert_eq!(options.constraint_value("optimize").as_deref(), Some("size"));
        assert_eq!(options.constraint_value("endianness"), None);
    }

    #[test]
    fn node_options_take_precedence() {
        let mut diagnostics = Diagnostics::default();
        let mut options = Options::new("target");
        options.set_value("storage", "virtual", &mut diagnostics);

        let mut node = ast::NodeOptions::default();
        assert_eq!(options.storage(&node), ast::StorageMode::Virtual);
        node.values.insert("storage".to_owned(), "static".to_owned());
        assert_eq!(options.storage(&node), ast::StorageMode::Static);
    }

    #[test]
    fn override_keys_are_validated() {
        let mut diagnostics = Diagnostics::default();
        let mut options = Options::new("target");
        options.add_override(
            "/Response/code",
            "storage",
            OverrideValue::Text("static".to_owned()),
            &mut diagnostics,
        );
        options.add_override(
            "/Response/code",
            "bogus",
            OverrideValue::Text("1".to_owned()),
            &mut diagnostics,
        );
        assert_eq!(options.overrides().len(), 1);
        assert_eq!(diagnostics.len(), 1);
    }
}
