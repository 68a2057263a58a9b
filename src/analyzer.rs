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

//! Schema checks and annotation.
//!
//! Two passes run before any code is emitted: validity bit assignment
//! and nested type prefixing. Emitted accessor names and presence
//! bitmap types depend on their results, and both are idempotent for
//! a fixed configuration.

use codespan_reporting::diagnostic::{Diagnostic, Severity};
use codespan_reporting::files;
use codespan_reporting::term;
use codespan_reporting::term::termcolor;
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::ast::*;
use crate::options::{Nesting, Options, OverrideValue};

/// List of unique errors reported as analyzer diagnostics.
#[repr(u16)]
#[derive(Copy, Clone)]
pub enum ErrorCode {
    DuplicateTypeIdentifier = 1,
    DuplicateFieldIdentifier = 2,
    DuplicateFieldId = 3,
    ZeroFieldId = 4,
    DuplicateEnumEntry = 5,
    DuplicateEnumValue = 6,
    EmptyEnum = 7,
    PackedFieldInvalid = 8,
    TerminatorCollision = 9,
    SentinelOnRepeated = 10,
    UnknownOption = 11,
    InvalidOptionValue = 12,
    UnresolvedOptionPath = 13,
    UndeclaredTypeIdentifier = 14,
    InvalidTypeIdentifier = 15,
    InvalidWidth = 16,
    AliasedEnumText = 17,
    MissingImplementation = 18,
    CyclicDependency = 19,
    TemplateSyntax = 20,
    ExpansionError = 21,
    RepeatedLengthPrefixed = 22,
    RecursiveMessage = 23,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "E{}", *self as u16)
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        format!("{}", code)
    }
}

/// Aggregate analyzer and generator diagnostics.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub diagnostics: Vec<Diagnostic<FileId>>,
}

impl Diagnostics {
    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    /// Append a diagnostic. Warnings are deduplicated by message text
    /// so repeated generation passes do not flood the output.
    pub fn push(&mut self, diagnostic: Diagnostic<FileId>) {
        if diagnostic.severity == Severity::Warning
            && self.diagnostics.iter().any(|d| d.message == diagnostic.message)
        {
            return;
        }
        self.diagnostics.push(diagnostic)
    }

    /// Test if any diagnostic is an error. Gates whether final output
    /// files are kept.
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.severity == Severity::Error)
    }

    /// Merge another collection, keeping warning deduplication.
    pub fn append(&mut self, other: Diagnostics) {
        for diagnostic in other.diagnostics {
            self.push(diagnostic);
        }
    }

    pub fn err_or<T>(self, value: T) -> Result<T, Diagnostics> {
        if self.has_errors() {
            Err(self)
        } else {
            Ok(value)
        }
    }

    pub fn emit(
        &self,
        sources: &SourceDatabase,
        writer: &mut dyn termcolor::WriteColor,
    ) -> Result<(), files::Error> {
        let config = term::Config::default();
        for d in self.diagnostics.iter() {
            term::emit(writer, &config, sources, d)?;
        }
        Ok(())
    }
}

/// Reference to a type declaration in the schema tree.
#[derive(Debug, Copy, Clone)]
pub enum TypeRef<'d> {
    Message(&'d Message),
    Enum(&'d Enum),
}

/// Gather information about the full schema.
/// Type names are unique across the whole file, nested or not; the
/// flattened naming mode depends on it.
#[derive(Debug)]
pub struct Scope<'d> {
    pub file: &'d File,
    pub typedef: HashMap<String, TypeRef<'d>>,
}

impl<'d> Scope<'d> {
    pub fn new(file: &'d File) -> Result<Scope<'d>, Diagnostics> {
        fn insert<'d>(
            typedef: &mut HashMap<String, TypeRef<'d>>,
            diagnostics: &mut Diagnostics,
            name: &str,
            loc: SourceRange,
            decl: TypeRef<'d>,
        ) {
            if let Some(prev) = typedef.insert(name.to_owned(), decl) {
                let prev_loc = match prev {
                    TypeRef::Message(m) => m.loc,
                    TypeRef::Enum(e) => e.loc,
                };
                diagnostics.push(
                    Diagnostic::error()
                        .with_code(ErrorCode::DuplicateTypeIdentifier)
                        .with_message(format!("redeclaration of type identifier `{name}`"))
                        .with_labels(vec![
                            loc.primary(),
                            prev_loc
                                .secondary()
                                .with_message(format!("`{name}` is first declared here")),
                        ]),
                )
            }
        }

        fn visit<'d>(
            typedef: &mut HashMap<String, TypeRef<'d>>,
            diagnostics: &mut Diagnostics,
            message: &'d Message,
        ) {
            for nested in &message.messages {
                insert(typedef, diagnostics, &nested.name, nested.loc, TypeRef::Message(nested));
                visit(typedef, diagnostics, nested);
            }
            for decl in &message.enums {
                insert(typedef, diagnostics, &decl.name, decl.loc, TypeRef::Enum(decl));
            }
        }

        let mut scope = Scope { file, typedef: Default::default() };
        let mut diagnostics = Diagnostics::default();
        for decl in &file.enums {
            insert(&mut scope.typedef, &mut diagnostics, &decl.name, decl.loc, TypeRef::Enum(decl));
        }
        for message in &file.messages {
            insert(
                &mut scope.typedef,
                &mut diagnostics,
                &message.name,
                message.loc,
                TypeRef::Message(message),
            );
            visit(&mut scope.typedef, &mut diagnostics, message);
        }
        diagnostics.err_or(scope)
    }

    pub fn get_message(&self, name: &str) -> Option<&'d Message> {
        match self.typedef.get(name) {
            Some(TypeRef::Message(message)) => Some(message),
            _ => None,
        }
    }

    pub fn get_enum(&self, name: &str) -> Option<&'d Enum> {
        match self.typedef.get(name) {
            Some(TypeRef::Enum(decl)) => Some(decl),
            _ => None,
        }
    }

    /// Wire type of the field's element encoding. Enum fields inherit
    /// the encoding declared on the enum.
    pub fn wire_type(&self, field: &Field) -> WireType {
        match &field.typ {
            FieldType::Uint { .. } | FieldType::Sint { .. } => WireType::Varint,
            FieldType::Fixed { width, .. } | FieldType::Float { width } => WireType::fixed(*width),
            FieldType::Bytes
            | FieldType::String
            | FieldType::StringRef
            | FieldType::Message { .. } => WireType::LengthPrefixed,
            FieldType::Enum { enum_id } => {
                self.get_enum(enum_id).map(Enum::wire_type).unwrap_or(WireType::Varint)
            }
        }
    }

    /// Tag value written on the wire for the field. A packed repeated
    /// field is transported as one length-prefixed run.
    pub fn tag(&self, field: &Field) -> u32 {
        let wire_type = if field.packed { WireType::LengthPrefixed } else { self.wire_type(field) };
        tag(field.id, wire_type)
    }

    /// Varint encoded size of the field tag.
    pub fn tag_size(&self, field: &Field) -> usize {
        varint_size(u64::from(self.tag(field)))
    }

    /// Payload byte count for fields with a statically fixed wire
    /// size, i.e. fixed width scalars and fixed encoded enums.
    pub fn fixed_payload_size(&self, field: &Field) -> Option<usize> {
        self.wire_type(field).fixed_size()
    }

    /// Test if the field always occupies the same number of wire
    /// bytes: a required field of fixed payload size.
    pub fn has_fixed_size(&self, field: &Field) -> bool {
        field.quantifier == Quantifier::Required && self.fixed_payload_size(field).is_some()
    }

    /// Worst case serialized size of a single element of the field,
    /// excluding its tag. `None` if unbounded (growable capacity).
    fn max_element_size(&self, field: &Field, visited: &mut HashSet<String>) -> Option<u64> {
        match &field.typ {
            FieldType::Uint { width } | FieldType::Sint { width } => {
                Some((*width as u64).div_ceil(7))
            }
            FieldType::Fixed { width, .. } | FieldType::Float { width } => Some(*width as u64 / 8),
            FieldType::Enum { enum_id } => {
                let decl = self.get_enum(enum_id)?;
                match decl.wire_type() {
                    WireType::Varint => Some((decl.width() as u64).div_ceil(7)),
                    wire_type => wire_type.fixed_size().map(|n| n as u64),
                }
            }
            FieldType::Bytes | FieldType::String | FieldType::StringRef => {
                if field.array_size == 0 {
                    None
                } else {
                    let len = field.array_size as u64;
                    Some(varint_size(len) as u64 + len)
                }
            }
            FieldType::Message { type_id } => {
                let decl = self.get_message(type_id)?;
                let size = self.max_message_size_inner(decl, visited)?;
                Some(varint_size(size) as u64 + size)
            }
        }
    }

    /// Worst case serialized size of the whole message, or `None` if
    /// any field is unbounded.
    pub fn max_message_size(&self, message: &Message) -> Option<u64> {
        self.max_message_size_inner(message, &mut HashSet::new())
    }

    fn max_message_size_inner(
        &self,
        message: &Message,
        visited: &mut HashSet<String>,
    ) -> Option<u64> {
        // A recursive message has no finite worst case.
        if !visited.insert(message.name.clone()) {
            return None;
        }
        let mut size = 0u64;
        for field in &message.fields {
            if field.usage == Usage::Obsolete {
                continue;
            }
            let element = match self.max_element_size(field, visited) {
                Some(element) => element,
                None => {
                    visited.remove(&message.name);
                    return None;
                }
            };
            let count = match field.quantifier {
                Quantifier::Repeated if field.array_size == 0 => {
                    visited.remove(&message.name);
                    return None;
                }
                Quantifier::Repeated => field.array_size as u64,
                _ => 1,
            };
            if field.packed {
                let run = element * count;
                size += self.tag_size(field) as u64 + varint_size(run) as u64 + run;
            } else {
                size += (self.tag_size(field) as u64 + element) * count;
            }
        }
        visited.remove(&message.name);
        Some(size)
    }
}

fn check_field_type(
    scope: &Scope,
    diagnostics: &mut Diagnostics,
    message: &Message,
    field: &Field,
) {
    match &field.typ {
        FieldType::Uint { width } | FieldType::Sint { width } | FieldType::Fixed { width, .. } => {
            if ![8, 16, 32, 64].contains(width) {
                diagnostics.push(
                    Diagnostic::error()
                        .with_code(ErrorCode::InvalidWidth)
                        .with_message(format!(
                            "field `{}.{}` has invalid width {width}",
                            message.name, field.name
                        ))
                        .with_labels(vec![field.loc.primary()]),
                )
            }
        }
        FieldType::Float { width } => {
            if ![32, 64].contains(width) {
                diagnostics.push(
                    Diagnostic::error()
                        .with_code(ErrorCode::InvalidWidth)
                        .with_message(format!(
                            "field `{}.{}` has invalid float width {width}",
                            message.name, field.name
                        ))
                        .with_labels(vec![field.loc.primary()]),
                )
            }
        }
        FieldType::Enum { enum_id } => {
            if scope.get_enum(enum_id).is_none() {
                let code = if scope.get_message(enum_id).is_some() {
                    ErrorCode::InvalidTypeIdentifier
                } else {
                    ErrorCode::UndeclaredTypeIdentifier
                };
                diagnostics.push(
                    Diagnostic::error()
                        .with_code(code)
                        .with_message(format!(
                            "field `{}.{}` references unknown enum `{enum_id}`",
                            message.name, field.name
                        ))
                        .with_labels(vec![field.loc.primary()]),
                )
            }
        }
        FieldType::Message { type_id } => {
            if scope.get_message(type_id).is_none() {
                let code = if scope.get_enum(type_id).is_some() {
                    ErrorCode::InvalidTypeIdentifier
                } else {
                    ErrorCode::UndeclaredTypeIdentifier
                };
                diagnostics.push(
                    Diagnostic::error()
                        .with_code(code)
                        .with_message(format!(
                            "field `{}.{}` references unknown message `{type_id}`",
                            message.name, field.name
                        ))
                        .with_labels(vec![field.loc.primary()]),
                )
            }
        }
        FieldType::Bytes | FieldType::String | FieldType::StringRef => (),
    }
}

fn check_message(
    scope: &Scope,
    options: &Options,
    diagnostics: &mut Diagnostics,
    message: &Message,
) {
    let mut ids: HashMap<u32, &Field> = HashMap::new();
    let mut names: HashMap<&str, &Field> = HashMap::new();

    for field in &message.fields {
        if let Some(prev) = names.insert(&field.name, field) {
            diagnostics.push(
                Diagnostic::error()
                    .with_code(ErrorCode::DuplicateFieldIdentifier)
                    .with_message(format!(
                        "duplicate field identifier `{}` in message `{}`",
                        field.name, message.name
                    ))
                    .with_labels(vec![
                        field.loc.primary(),
                        prev.loc.secondary().with_message("first declared here"),
                    ]),
            )
        }
        if let Some(prev) = ids.insert(field.id, field) {
            diagnostics.push(
                Diagnostic::error()
                    .with_code(ErrorCode::DuplicateFieldId)
                    .with_message(format!(
                        "duplicate field id {} in message `{}`",
                        field.id, message.name
                    ))
                    .with_labels(vec![
                        field.loc.primary(),
                        prev.loc.secondary().with_message("first used here"),
                    ]),
            )
        }
        if field.id == 0 && !options.flag_for(&field.options, "allow_zero_id").unwrap_or(false) {
            diagnostics.push(
                Diagnostic::error()
                    .with_code(ErrorCode::ZeroFieldId)
                    .with_message(format!(
                        "field `{}.{}` uses reserved id 0 without the `allow_zero_id` flag",
                        message.name, field.name
                    ))
                    .with_labels(vec![field.loc.primary()]),
            )
        }
        if field.packed && !(field.quantifier == Quantifier::Repeated && field.typ.is_scalar()) {
            diagnostics.push(
                Diagnostic::error()
                    .with_code(ErrorCode::PackedFieldInvalid)
                    .with_message(format!(
                        "field `{}.{}` is packed but not a repeated scalar",
                        message.name, field.name
                    ))
                    .with_labels(vec![field.loc.primary()]),
            )
        }
        if field.invalid_value.is_some() && field.quantifier == Quantifier::Repeated {
            diagnostics.push(
                Diagnostic::error()
                    .with_code(ErrorCode::SentinelOnRepeated)
                    .with_message(format!(
                        "repeated field `{}.{}` cannot declare an unset sentinel",
                        message.name, field.name
                    ))
                    .with_labels(vec![field.loc.primary()]),
            )
        }
        if field.quantifier == Quantifier::Repeated
            && matches!(field.typ, FieldType::Bytes | FieldType::String | FieldType::StringRef)
        {
            diagnostics.push(
                Diagnostic::error()
                    .with_code(ErrorCode::RepeatedLengthPrefixed)
                    .with_message(format!(
                        "repeated field `{}.{}` cannot hold text or byte elements",
                        message.name, field.name
                    ))
                    .with_labels(vec![field.loc.primary()]),
            )
        }
        check_field_type(scope, diagnostics, message, field);
    }

    // The decode loop reads the terminator before the tag, so a field
    // whose first tag byte equals the terminator could never be
    // decoded.
    if let Some(terminator) = options.terminator() {
        for field in &message.fields {
            let tag = scope.tag(field);
            let first_byte = if tag < 0x80 { tag as u8 } else { (tag & 0x7f) as u8 | 0x80 };
            if first_byte == terminator {
                diagnostics.push(
                    Diagnostic::error()
                        .with_code(ErrorCode::TerminatorCollision)
                        .with_message(format!(
                            "terminator {terminator:#04x} collides with the tag of field `{}.{}`",
                            message.name, field.name
                        ))
                        .with_labels(vec![field.loc.primary()]),
                )
            }
        }
    }

    for nested in &message.messages {
        check_message(scope, options, diagnostics, nested);
    }
    for decl in &message.enums {
        check_enum(options, diagnostics, decl);
    }
}

fn check_enum(options: &Options, diagnostics: &mut Diagnostics, decl: &Enum) {
    if decl.entries.is_empty() {
        diagnostics.push(
            Diagnostic::error()
                .with_code(ErrorCode::EmptyEnum)
                .with_message(format!("enum `{}` declares no entries", decl.name))
                .with_labels(vec![decl.loc.primary()]),
        )
    }

    let mut names: HashMap<&str, &EnumEntry> = HashMap::new();
    for entry in &decl.entries {
        if let Some(prev) = names.insert(&entry.name, entry) {
            diagnostics.push(
                Diagnostic::error()
                    .with_code(ErrorCode::DuplicateEnumEntry)
                    .with_message(format!(
                        "duplicate entry `{}` in enum `{}`",
                        entry.name, decl.name
                    ))
                    .with_labels(vec![
                        entry.loc.primary(),
                        prev.loc.secondary().with_message("first declared here"),
                    ]),
            )
        }
    }

    let aliases_allowed = options.flag_for(&decl.options, "enum_aliases").unwrap_or(false);
    if decl.has_aliases() {
        if !aliases_allowed {
            diagnostics.push(
                Diagnostic::error()
                    .with_code(ErrorCode::DuplicateEnumValue)
                    .with_message(format!(
                        "enum `{}` declares aliased values without the `enum_aliases` flag",
                        decl.name
                    ))
                    .with_labels(vec![decl.loc.primary()]),
            )
        } else if decl.options.flag("enum_text") == Some(true) {
            // The value to name inversion is ambiguous.
            diagnostics.push(
                Diagnostic::error()
                    .with_code(ErrorCode::AliasedEnumText)
                    .with_message(format!(
                        "aliased enum `{}` cannot also request a text conversion function",
                        decl.name
                    ))
                    .with_labels(vec![decl.loc.primary()]),
            )
        }
    }
}

/// Resolve a slash-separated node path against the schema tree and
/// apply the override to the first enum, field, or message found.
/// Returns false if the path does not resolve.
fn apply_override(file: &mut File, path: &str, key: &str, value: &OverrideValue) -> bool {
    fn apply(options: &mut NodeOptions, key: &str, value: &OverrideValue) {
        match value {
            OverrideValue::Text(text) => {
                options.values.insert(key.to_owned(), text.clone());
            }
            OverrideValue::Flag(flag) => {
                options.flags.insert(key.to_owned(), *flag);
            }
        }
    }

    fn walk<'a>(message: &'a mut Message, segments: &[&str]) -> Option<&'a mut NodeOptions> {
        let (head, rest) = segments.split_first()?;
        if rest.is_empty() {
            if message.fields.iter().any(|f| f.name == *head) {
                let field = message.fields.iter_mut().find(|f| f.name == *head)?;
                return Some(&mut field.options);
            }
            if message.enums.iter().any(|e| e.name == *head) {
                let decl = message.enums.iter_mut().find(|e| e.name == *head)?;
                return Some(&mut decl.options);
            }
        }
        let nested = message.messages.iter_mut().find(|m| m.name == *head)?;
        if rest.is_empty() {
            Some(&mut nested.options)
        } else {
            walk(nested, rest)
        }
    }

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let Some((head, rest)) = segments.split_first() else {
        return false;
    };

    if rest.is_empty() {
        if let Some(decl) = file.enums.iter_mut().find(|e| e.name == *head) {
            apply(&mut decl.options, key, value);
            return true;
        }
    }
    let Some(message) = file.messages.iter_mut().find(|m| m.name == *head) else {
        return false;
    };
    let target = if rest.is_empty() { Some(&mut message.options) } else { walk(message, rest) };
    match target {
        Some(options) => {
            apply(options, key, value);
            true
        }
        None => false,
    }
}

/// Assign validity bit indices in ascending field id order and select
/// the presence bitmap representation.
fn assign_valid_bits(message: &mut Message) {
    let mut order: Vec<usize> = (0..message.fields.len()).collect();
    order.sort_by_key(|n| message.fields[*n].id);

    let mut next_bit = 0;
    for n in order {
        let field = &mut message.fields[n];
        field.valid_bit = if field.needs_valid_bit() {
            let bit = ValidityBit::Bit(next_bit);
            next_bit += 1;
            bit
        } else if field.invalid_value.is_some() && field.quantifier == Quantifier::Optional {
            ValidityBit::Sentinel
        } else {
            ValidityBit::NotNeeded
        };
    }
    message.valid_bits = next_bit;
    message.bitmap = BitmapKind::from_bits(next_bit);

    for nested in &mut message.messages {
        assign_valid_bits(nested);
    }
}

/// Apply the configured naming style to nested types, depth-first.
fn assign_prefixes(message: &mut Message, prefix: &str, nesting: Nesting) {
    message.full_name = if prefix.is_empty() {
        message.name.clone()
    } else {
        join_name(prefix, &message.name, nesting)
    };
    for decl in &mut message.enums {
        decl.full_name = join_name(&message.full_name, &decl.name, nesting);
    }
    let parent = message.full_name.clone();
    for nested in &mut message.messages {
        assign_prefixes(nested, &parent, nesting);
    }
}

fn join_name(prefix: &str, name: &str, nesting: Nesting) -> String {
    match nesting {
        Nesting::Class => format!("{prefix}::{name}"),
        Nesting::Flatten => format!("{prefix}_{name}"),
    }
}

/// Check the schema and return an annotated copy.
///
/// On success the second return value carries the non-fatal
/// diagnostics (unresolved override paths and similar warnings).
pub fn analyze(file: &File, options: &Options) -> Result<(File, Diagnostics), Diagnostics> {
    let mut diagnostics = Diagnostics::default();

    let scope = Scope::new(file)?;
    for message in &file.messages {
        check_message(&scope, options, &mut diagnostics, message);
    }
    for decl in &file.enums {
        check_enum(options, &mut diagnostics, decl);
    }
    if diagnostics.has_errors() {
        return Err(diagnostics);
    }

    let mut file = file.clone();
    for node_override in options.overrides() {
        if !apply_override(&mut file, &node_override.path, &node_override.key, &node_override.value)
        {
            diagnostics.push(
                Diagnostic::warning()
                    .with_code(ErrorCode::UnresolvedOptionPath)
                    .with_message(format!(
                        "option path `{}` does not name a schema node",
                        node_override.path
                    )),
            )
        }
    }

    for message in &mut file.messages {
        assign_valid_bits(message);
        assign_prefixes(message, "", options.nesting());
    }
    for decl in &mut file.enums {
        decl.full_name = decl.name.clone();
    }

    // Node overrides may have changed per-enum flags; re-run the alias
    // checks against the applied values.
    fn recheck(options: &Options, diagnostics: &mut Diagnostics, message: &Message) {
        for decl in &message.enums {
            check_enum(options, diagnostics, decl);
        }
        for nested in &message.messages {
            recheck(options, diagnostics, nested);
        }
    }
    let mut post = Diagnostics::default();
    for decl in &file.enums {
        check_enum(options, &mut post, decl);
    }
    for message in &file.messages {
        recheck(options, &mut post, message);
    }
    if post.has_errors() {
        return Err(post);
    }

    Ok((file, diagnostics))
}
