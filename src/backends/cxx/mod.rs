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

//! C++ compiler backend.
//!
//! Walks the annotated schema and emits a declarations unit (types,
//! accessors) and a definitions unit (primitives, encode/decode/size
//! methods). Under the shared library mode the selected primitives
//! move to their own declarations + definitions pair instead.

use codespan_reporting::diagnostic::Diagnostic;
use heck::ToSnakeCase;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use crate::analyzer::{Diagnostics, ErrorCode, Scope};
use crate::ast;
use crate::ast::{BitmapKind, FieldType, Quantifier, StorageMode, Usage, ValidityBit};
use crate::generator::Generator;
use crate::library::{CodeLibrary, TemplateKind};
use crate::options::{LibraryMode, Nesting, Options};

mod decoder;
mod encoder;

/// Generated source units for one schema target.
#[derive(Debug)]
pub struct Output {
    pub base_name: String,
    /// Declarations unit (`<base>.h`).
    pub header: String,
    /// Definitions unit (`<base>.cc`).
    pub source: String,
    /// Shared primitive declarations (`<base>_wire.h`), only under the
    /// shared library mode.
    pub library_header: Option<String>,
    /// Shared primitive definitions (`<base>_wire.cc`).
    pub library_source: Option<String>,
}

/// Generate a sanitized C++ identifier: reserved words are suffixed.
pub fn to_ident(name: &str) -> String {
    match name {
        "alignas" | "alignof" | "asm" | "auto" | "bool" | "break" | "case" | "catch" | "char"
        | "class" | "const" | "constexpr" | "continue" | "default" | "delete" | "do" | "double"
        | "else" | "enum" | "explicit" | "export" | "extern" | "false" | "float" | "for"
        | "friend" | "goto" | "if" | "inline" | "int" | "long" | "mutable" | "namespace"
        | "new" | "noexcept" | "nullptr" | "operator" | "private" | "protected" | "public"
        | "register" | "return" | "short" | "signed" | "sizeof" | "static" | "struct"
        | "switch" | "template" | "this" | "throw" | "true" | "try" | "typedef" | "typeid"
        | "typename" | "union" | "unsigned" | "using" | "virtual" | "void" | "volatile"
        | "while" => format!("{name}_"),
        _ => name.to_owned(),
    }
}

fn unsigned_type(width: usize) -> String {
    format!("uint{width}_t")
}

fn signed_type(width: usize) -> String {
    format!("int{width}_t")
}

/// C++ type storing one element of the field.
fn element_type(scope: &Scope, field: &ast::Field) -> String {
    match &field.typ {
        FieldType::Uint { width } => unsigned_type(*width),
        FieldType::Sint { width } => signed_type(*width),
        FieldType::Fixed { width, signed: true } => signed_type(*width),
        FieldType::Fixed { width, signed: false } => unsigned_type(*width),
        FieldType::Float { width: 32 } => "float".to_owned(),
        FieldType::Float { .. } => "double".to_owned(),
        FieldType::Bytes => "uint8_t".to_owned(),
        FieldType::String | FieldType::StringRef => "char".to_owned(),
        FieldType::Enum { enum_id } => scope
            .get_enum(enum_id)
            .map(|decl| decl.type_name().to_owned())
            .unwrap_or_else(|| enum_id.clone()),
        FieldType::Message { type_id } => scope
            .get_message(type_id)
            .map(|decl| decl.type_name().to_owned())
            .unwrap_or_else(|| type_id.clone()),
    }
}

/// Bit width backing the element, used for zigzag shifts and
/// truncation casts.
fn element_bits(scope: &Scope, field: &ast::Field) -> usize {
    match &field.typ {
        FieldType::Uint { width }
        | FieldType::Sint { width }
        | FieldType::Fixed { width, .. }
        | FieldType::Float { width } => *width,
        FieldType::Enum { enum_id } => scope.get_enum(enum_id).map(ast::Enum::width).unwrap_or(32),
        _ => 0,
    }
}

/// Escape text into a C string literal body.
pub fn escape_string(text: &str) -> String {
    let mut out = String::new();
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Qualify a literal default or sentinel for an enum typed field:
/// entry names resolve against the enum, numbers are cast.
fn enum_literal(scope: &Scope, field: &ast::Field, literal: &str) -> String {
    if let FieldType::Enum { enum_id } = &field.typ {
        let type_name = scope
            .get_enum(enum_id)
            .map(|decl| decl.type_name().to_owned())
            .unwrap_or_else(|| enum_id.clone());
        if literal.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
            return format!("{type_name}::{}", to_ident(literal));
        }
        return format!("({type_name}){literal}");
    }
    literal.to_owned()
}

/// Presence bitmap expressions for a bit tracked field.
struct PresenceBit {
    test: String,
    set: String,
    clear: String,
}

fn presence_bit(message: &ast::Message, bit: usize) -> PresenceBit {
    match message.bitmap {
        BitmapKind::None => unreachable!("presence bit without a bitmap"),
        BitmapKind::Bytes(_) => {
            let byte = bit / 8;
            let mask = format!("0x{:02x}u", 1u32 << (bit % 8));
            PresenceBit {
                test: format!("(_has[{byte}] & {mask}) != 0"),
                set: format!("_has[{byte}] |= {mask};"),
                clear: format!("_has[{byte}] &= (uint8_t)~{mask};"),
            }
        }
        kind => {
            let (mask, cast) = match kind {
                BitmapKind::U64 => (format!("0x{:x}ull", 1u64 << bit), "uint64_t"),
                BitmapKind::U32 => (format!("0x{:x}ul", 1u64 << bit), "uint32_t"),
                BitmapKind::U16 => (format!("0x{:x}u", 1u64 << bit), "uint16_t"),
                _ => (format!("0x{:02x}u", 1u64 << bit), "uint8_t"),
            };
            PresenceBit {
                test: format!("(_has & {mask}) != 0"),
                set: format!("_has |= {mask};"),
                clear: format!("_has &= ({cast})~{mask};"),
            }
        }
    }
}

fn bitmap_member(message: &ast::Message) -> Option<String> {
    match message.bitmap {
        BitmapKind::None => None,
        BitmapKind::U8 => Some("uint8_t _has;".to_owned()),
        BitmapKind::U16 => Some("uint16_t _has;".to_owned()),
        BitmapKind::U32 => Some("uint32_t _has;".to_owned()),
        BitmapKind::U64 => Some("uint64_t _has;".to_owned()),
        BitmapKind::Bytes(n) => Some(format!("uint8_t _has[{n}];")),
    }
}

/// Member name of a field.
pub(super) fn member_name(field: &ast::Field) -> String {
    to_ident(&field.name.to_snake_case())
}

/// Bind the per-field template variables. The closure runs with the
/// binding scope pushed; it is popped on return, restoring the
/// message level set.
pub(super) fn with_field<R>(
    gen: &mut Generator,
    scope: &Scope,
    message: &ast::Message,
    field: &ast::Field,
    body: impl FnOnce(&mut Generator) -> R,
) -> R {
    let name = member_name(field);
    let tag = scope.tag(field);
    let bits = element_bits(scope, field);

    gen.scoped(|gen| {
        gen.set("fname", name.clone());
        gen.set("count", format!("{name}_count"));
        gen.set("lenm", format!("{name}_len"));
        gen.set("ctype", element_type(scope, field));
        gen.set("tag", format!("0x{tag:02x}"));
        gen.set("tagsize", scope.tag_size(field).to_string());
        gen.set("wt", (tag & 7).to_string());
        gen.set("cap", field.array_size.to_string());
        gen.set("has_test", "");
        gen.set("has_set", "");
        gen.set("has_clear", "");
        if bits > 0 {
            gen.set("bits", bits.to_string());
            gen.set("uelem", unsigned_type(bits));
        }
        if let Some(bytes) = scope.fixed_payload_size(field) {
            gen.set("bytes", bytes.to_string());
        }
        if let Some(sentinel) = &field.invalid_value {
            gen.set("sentinel", enum_literal(scope, field, sentinel));
        }
        if let ValidityBit::Bit(bit) = field.valid_bit {
            let presence = presence_bit(message, bit);
            gen.set("has_test", presence.test);
            gen.set("has_set", presence.set);
            gen.set("has_clear", presence.clear);
        }
        body(gen)
    })
}

/// Open the presence guard around an optional field's encode or size
/// logic. Returns true when a closing brace must be emitted.
pub(super) fn open_presence_guard(gen: &mut Generator, field: &ast::Field) -> bool {
    match field.valid_bit {
        ValidityBit::Bit(_) => {
            gen.emit("if ($has_test) {");
            true
        }
        ValidityBit::Sentinel => {
            gen.emit("if ($fname != $sentinel) {");
            true
        }
        _ if matches!(field.typ, FieldType::StringRef)
            && field.quantifier == Quantifier::Optional =>
        {
            gen.emit("if ($fname != NULL) {");
            true
        }
        _ => false,
    }
}

/// Collect the messages reachable from the requested names. An empty
/// filter selects the whole file. The result is ordered so that every
/// message precedes the messages whose members embed it.
fn select_messages<'d>(
    scope: &Scope<'d>,
    file: &'d ast::File,
    only: &[String],
    diagnostics: &mut Diagnostics,
) -> Result<Vec<&'d ast::Message>, ()> {
    fn all<'d>(message: &'d ast::Message, into: &mut Vec<&'d ast::Message>) {
        into.push(message);
        for nested in &message.messages {
            all(nested, into);
        }
    }

    let mut universe = vec![];
    for message in &file.messages {
        all(message, &mut universe);
    }

    let selected: Vec<&ast::Message> = if only.is_empty() {
        universe
    } else {
        // Walk field references from the requested roots.
        let mut wanted: HashSet<&str> = HashSet::new();
        let mut queue: Vec<&ast::Message> = vec![];
        for name in only {
            match scope.get_message(name) {
                Some(message) => queue.push(message),
                None => diagnostics.push(
                    Diagnostic::warning()
                        .with_code(ErrorCode::UnresolvedOptionPath)
                        .with_message(format!("message filter `{name}` matches no declaration")),
                ),
            }
        }
        while let Some(message) = queue.pop() {
            if !wanted.insert(message.name.as_str()) {
                continue;
            }
            for nested in &message.messages {
                queue.push(nested);
            }
            for field in &message.fields {
                if let FieldType::Message { type_id } = &field.typ {
                    if let Some(decl) = scope.get_message(type_id) {
                        queue.push(decl);
                    }
                }
            }
        }
        universe.into_iter().filter(|m| wanted.contains(m.name.as_str())).collect()
    };

    // Order member types ahead of the structs embedding them.
    fn visit<'d>(
        n: usize,
        selected: &[&'d ast::Message],
        index: &HashMap<&str, usize>,
        state: &mut [u8],
        order: &mut Vec<&'d ast::Message>,
        diagnostics: &mut Diagnostics,
    ) -> Result<(), ()> {
        match state[n] {
            2 => return Ok(()),
            1 => {
                diagnostics.push(
                    Diagnostic::error()
                        .with_code(ErrorCode::RecursiveMessage)
                        .with_message(format!(
                            "message `{}` embeds itself and has no finite layout",
                            selected[n].name
                        ))
                        .with_labels(vec![selected[n].loc.primary()]),
                );
                return Err(());
            }
            _ => (),
        }
        state[n] = 1;
        for field in &selected[n].fields {
            if let FieldType::Message { type_id } = &field.typ {
                if let Some(dep) = index.get(type_id.as_str()) {
                    visit(*dep, selected, index, state, order, diagnostics)?;
                }
            }
        }
        state[n] = 2;
        order.push(selected[n]);
        Ok(())
    }

    let index: HashMap<&str, usize> =
        selected.iter().enumerate().map(|(n, m)| (m.name.as_str(), n)).collect();
    let mut order: Vec<&ast::Message> = vec![];
    let mut state = vec![0u8; selected.len()];
    for n in 0..selected.len() {
        visit(n, &selected, &index, &mut state, &mut order, diagnostics)?;
    }
    Ok(order)
}

/// Map the ordered message list onto distinct top level roots,
/// preserving the order of first use. Class nesting emits whole
/// subtrees, so the root order must respect cross references.
fn top_level_roots<'d>(
    file: &'d ast::File,
    messages: &[&'d ast::Message],
) -> Vec<&'d ast::Message> {
    fn owns(message: &ast::Message, name: &str) -> bool {
        message.name == name || message.messages.iter().any(|nested| owns(nested, name))
    }

    let mut roots: Vec<&ast::Message> = vec![];
    for message in messages {
        let root = file.messages.iter().find(|root| owns(root, &message.name));
        if let Some(root) = root {
            if !roots.iter().any(|r| r.name == root.name) {
                roots.push(root);
            }
        }
    }
    roots
}

/// Collect the enums used by the selected messages, plus file level
/// enums when no filter is active.
fn select_enums<'d>(
    scope: &Scope<'d>,
    file: &'d ast::File,
    messages: &[&'d ast::Message],
    only: &[String],
) -> Vec<&'d ast::Enum> {
    let mut seen = BTreeSet::new();
    let mut enums = vec![];
    let mut add = |decl: &'d ast::Enum| {
        if seen.insert(decl.name.clone()) {
            enums.push(decl);
        }
    };
    if only.is_empty() {
        for decl in &file.enums {
            add(decl);
        }
    }
    for message in messages {
        for decl in &message.enums {
            add(decl);
        }
        for field in &message.fields {
            if let FieldType::Enum { enum_id } = &field.typ {
                if let Some(decl) = scope.get_enum(enum_id) {
                    add(decl);
                }
            }
        }
    }
    enums
}

fn generate_enum_declaration(decl: &ast::Enum, nesting: Nesting) -> String {
    // Under class nesting the declaration is emitted inside the
    // owning struct and uses the bare name.
    let name = match nesting {
        Nesting::Class => decl.name.clone(),
        Nesting::Flatten => decl.type_name().to_owned(),
    };
    let backing =
        if decl.is_signed() { signed_type(decl.width()) } else { unsigned_type(decl.width()) };
    let mut out = format!("enum class {name} : {backing} {{\n");
    for entry in &decl.entries {
        out.push_str(&format!("{} = {},\n", to_ident(&entry.name), entry.value));
    }
    out.push_str("};\n");
    out
}

fn generate_enum_text(decl: &ast::Enum) -> String {
    let type_name = decl.type_name();
    let fn_name = format!("{}_text", type_name.replace("::", "_").to_snake_case());
    let mut out =
        format!("inline const char *{fn_name}({type_name} value)\n{{\nswitch (value) {{\n");
    for entry in &decl.entries {
        out.push_str(&format!(
            "case {type_name}::{}:\nreturn \"{}\";\n",
            to_ident(&entry.name),
            escape_string(&entry.name)
        ));
    }
    out.push_str("default:\nreturn \"?\";\n}\n}\n");
    out
}

fn enum_text_enabled(options: &Options, decl: &ast::Enum) -> bool {
    if decl.has_aliases() {
        return false;
    }
    options.flag_for(&decl.options, "enum_text").unwrap_or(true)
}

/// Member declarations for one field.
fn member_lines(scope: &Scope, field: &ast::Field) -> Vec<String> {
    let name = member_name(field);
    let ctype = element_type(scope, field);
    let cap = field.array_size;
    let mut lines = vec![];
    match (&field.typ, field.quantifier) {
        (FieldType::Bytes, _) if cap > 0 => {
            lines.push(format!("uint8_t {name}[{cap}];"));
            lines.push(format!("uint32_t {name}_len;"));
        }
        (FieldType::Bytes, _) => {
            lines.push(format!("const uint8_t *{name};"));
            lines.push(format!("uint32_t {name}_len;"));
        }
        (FieldType::String, _) if cap > 0 => {
            lines.push(format!("char {name}[{}];", cap + 1));
        }
        (FieldType::String, _) | (FieldType::StringRef, _) => {
            lines.push(format!("const char *{name};"));
            lines.push(format!("uint32_t {name}_len;"));
        }
        (_, Quantifier::Repeated) if cap > 0 => {
            lines.push(format!("{ctype} {name}[{cap}];"));
            lines.push(format!("uint32_t {name}_count;"));
        }
        (_, Quantifier::Repeated) => {
            lines.push(format!("const {ctype} *{name};"));
            lines.push(format!("uint32_t {name}_count;"));
        }
        _ => lines.push(format!("{ctype} {name};")),
    }
    lines
}

/// Accessors for one field, emitted inline in the struct body.
fn emit_accessors(gen: &mut Generator, scope: &Scope, message: &ast::Message, field: &ast::Field) {
    if field.usage == Usage::Obsolete {
        return;
    }

    with_field(gen, scope, message, field, |gen| {
        gen.set("attr", if field.usage == Usage::Deprecated { "[[deprecated]] " } else { "" });

        // Presence accessors.
        match field.valid_bit {
            ValidityBit::Bit(_) => {
                gen.emit("$(attr)bool has_$fname() const {");
                gen.emit("return $has_test;");
                gen.emit("}");
                gen.emit("$(attr)void clear_$fname() {");
                gen.emit("$has_clear");
                gen.emit("}");
            }
            ValidityBit::Sentinel => {
                gen.emit("$(attr)bool has_$fname() const {");
                gen.emit("return $fname != $sentinel;");
                gen.emit("}");
                gen.emit("$(attr)void clear_$fname() {");
                gen.emit("$fname = $sentinel;");
                gen.emit("}");
            }
            _ if matches!(field.typ, FieldType::StringRef)
                && field.quantifier == Quantifier::Optional =>
            {
                gen.emit("$(attr)bool has_$fname() const {");
                gen.emit("return $fname != NULL;");
                gen.emit("}");
                gen.emit("$(attr)void clear_$fname() {");
                gen.emit("$fname = NULL;");
                gen.emit("$lenm = 0;");
                gen.emit("}");
            }
            _ => (),
        }

        match (&field.typ, field.quantifier) {
            (FieldType::Bytes, _) => {
                if field.array_size > 0 {
                    gen.emit("$(attr)void set_$fname(const void *data, size_t size) {");
                    gen.emit("MDL_CHECK(size <= $cap);");
                    gen.emit("if (size > $cap) {");
                    gen.emit("size = $cap;");
                    gen.emit("}");
                    gen.emit("memcpy($fname, data, size);");
                    gen.emit("$lenm = (uint32_t)size;");
                    gen.emit("$has_set");
                    gen.emit("}");
                } else {
                    gen.emit("$(attr)void set_$fname(const uint8_t *data, size_t size) {");
                    gen.emit("$fname = data;");
                    gen.emit("$lenm = (uint32_t)size;");
                    gen.emit("$has_set");
                    gen.emit("}");
                }
            }
            (FieldType::String, _) if field.array_size > 0 => {
                gen.emit("$(attr)void set_$fname(const char *value) {");
                gen.emit("strncpy($fname, value, $cap);");
                gen.emit("$fname[$cap] = '\\0';");
                gen.emit("$has_set");
                gen.emit("}");
            }
            (FieldType::String, _) | (FieldType::StringRef, _) => {
                gen.emit("$(attr)void set_$fname(const char *value) {");
                gen.emit("$fname = value;");
                gen.emit("$lenm = value ? (uint32_t)strlen(value) : 0;");
                gen.emit("$has_set");
                gen.emit("}");
            }
            (FieldType::Message { .. }, Quantifier::Repeated) => {
                if field.array_size > 0 {
                    gen.emit("$(attr)$ctype *add_$fname() {");
                    gen.emit("if ($count >= $cap) {");
                    gen.emit("return NULL;");
                    gen.emit("}");
                    gen.emit("return &$fname[$count++];");
                    gen.emit("}");
                }
            }
            (FieldType::Message { .. }, _) => (),
            (_, Quantifier::Repeated) => {
                if field.array_size > 0 {
                    gen.emit("$(attr)bool add_$fname($ctype value) {");
                    gen.emit("if ($count >= $cap) {");
                    gen.emit("return false;");
                    gen.emit("}");
                    gen.emit("$fname[$count++] = value;");
                    gen.emit("return true;");
                    gen.emit("}");
                }
            }
            _ => {
                gen.emit("$(attr)$ctype get_$fname() const {");
                gen.emit("return $fname;");
                gen.emit("}");
                gen.emit("$(attr)void set_$fname($ctype value) {");
                gen.emit("$fname = value;");
                gen.emit("$has_set");
                gen.emit("}");
            }
        }
    });
}

/// The struct declaration, including inline accessors and the entry
/// point declarations. Under class nesting the nested types recurse
/// into the struct body.
fn emit_struct(
    gen: &mut Generator,
    scope: &Scope,
    options: &Options,
    message: &ast::Message,
    nesting: Nesting,
    text_fns: &mut Vec<String>,
) {
    let name = match nesting {
        Nesting::Class => message.name.clone(),
        Nesting::Flatten => message.type_name().to_owned(),
    };
    gen.emit_raw(&format!("struct {name} {{"));

    if nesting == Nesting::Class {
        for decl in &message.enums {
            gen.emit_raw(&generate_enum_declaration(decl, nesting));
            if enum_text_enabled(options, decl) {
                text_fns.push(generate_enum_text(decl));
            }
        }
        for nested in &message.messages {
            emit_struct(gen, scope, options, nested, nesting, text_fns);
        }
    }

    let storage = options.storage(&message.options);
    let member_prefix = if storage == StorageMode::Static { "static " } else { "" };
    for field in &message.fields {
        if field.usage == Usage::Obsolete {
            continue;
        }
        for line in member_lines(scope, field) {
            gen.emit_raw(&format!("{member_prefix}{line}"));
        }
    }
    if let Some(bitmap) = bitmap_member(message) {
        gen.emit_raw(&format!("{member_prefix}{bitmap}"));
    }
    gen.blank_line();

    for field in &message.fields {
        emit_accessors(gen, scope, message, field);
    }

    let method_prefix = if storage == StorageMode::Virtual { "virtual " } else { "" };
    if storage == StorageMode::Virtual {
        gen.emit_raw(&format!("virtual ~{name}() = default;"));
    }
    gen.emit_raw(&format!("{method_prefix}void clear();"));
    gen.emit_raw(&format!("{method_prefix}size_t wire_size() const;"));
    gen.emit_raw(&format!(
        "{method_prefix}int encode(uint8_t *dst, size_t cap, size_t *pos) const;"
    ));
    gen.emit_raw(&format!(
        "{method_prefix}int decode(const uint8_t *src, size_t len, size_t *pos);"
    ));
    gen.emit_raw("};");
    gen.blank_line();
}

/// Out of class definitions for static storage members.
fn emit_static_members(
    gen: &mut Generator,
    scope: &Scope,
    options: &Options,
    message: &ast::Message,
) {
    if options.storage(&message.options) == StorageMode::Static {
        let name = message.type_name();
        let mut define = |line: &str| {
            let line = line.trim_end_matches(';');
            let (ctype, member) = line
                .rsplit_once(' ')
                .unwrap_or_else(|| unreachable!("member line has no space: {line}"));
            let stars = member.chars().take_while(|c| *c == '*').count();
            gen.emit_raw(&format!(
                "{ctype} {}{name}::{};",
                "*".repeat(stars),
                &member[stars..]
            ));
        };
        for field in &message.fields {
            if field.usage == Usage::Obsolete {
                continue;
            }
            for line in member_lines(scope, field) {
                define(&line);
            }
        }
        if let Some(bitmap) = bitmap_member(message) {
            define(&bitmap);
        }
        gen.blank_line();
    }
}

/// The clear() definition: reset every member to its default or zero
/// state and clear the presence bitmap.
fn emit_clear(gen: &mut Generator, scope: &Scope, message: &ast::Message) {
    gen.emit("void $msg::clear()");
    gen.emit("{");
    for field in &message.fields {
        if field.usage == Usage::Obsolete {
            continue;
        }
        with_field(gen, scope, message, field, |gen| {
            if field.quantifier == Quantifier::Repeated {
                gen.emit("$count = 0;");
                return;
            }
            match &field.typ {
                FieldType::Bytes => {
                    if field.array_size == 0 {
                        gen.emit("$fname = NULL;");
                    }
                    gen.emit("$lenm = 0;");
                }
                FieldType::String if field.array_size > 0 => match &field.default_value {
                    Some(default) => {
                        gen.set_text("default", &format!("\"{}\"", escape_string(default)));
                        gen.emit("strncpy($fname, $default, $cap);");
                        gen.emit("$fname[$cap] = '\\0';");
                    }
                    None => gen.emit("$fname[0] = '\\0';"),
                },
                FieldType::String | FieldType::StringRef => match &field.default_value {
                    Some(default) => {
                        gen.set_text("default", &format!("\"{}\"", escape_string(default)));
                        gen.set("dlen", default.len().to_string());
                        gen.emit("$fname = $default;");
                        gen.emit("$lenm = $dlen;");
                    }
                    None => {
                        gen.emit("$fname = NULL;");
                        gen.emit("$lenm = 0;");
                    }
                },
                FieldType::Message { .. } => gen.emit("$fname.clear();"),
                FieldType::Enum { enum_id } => {
                    let default = field
                        .default_value
                        .as_deref()
                        .or(field.invalid_value.as_deref())
                        .map(|literal| enum_literal(scope, field, literal))
                        .or_else(|| {
                            scope.get_enum(enum_id).and_then(|decl| {
                                decl.entries.first().map(|entry| {
                                    format!("{}::{}", decl.type_name(), to_ident(&entry.name))
                                })
                            })
                        })
                        .unwrap_or_else(|| "($ctype)0".to_owned());
                    gen.set("default", default);
                    gen.emit("$fname = $default;");
                }
                _ => {
                    let default = field
                        .default_value
                        .clone()
                        .or_else(|| field.invalid_value.clone())
                        .unwrap_or_else(|| "0".to_owned());
                    gen.set("default", default);
                    gen.emit("$fname = ($ctype)$default;");
                }
            }
        });
    }
    match message.bitmap {
        BitmapKind::None => (),
        BitmapKind::Bytes(_) => gen.emit("memset(_has, 0, sizeof(_has));"),
        _ => gen.emit("_has = 0;"),
    }
    gen.emit("}");
    gen.blank_line();
}

/// Emit the selected primitives in dependency order. Returns the
/// includes required by the emitted bodies.
fn emit_primitives(
    gen: &mut Generator,
    library: &CodeLibrary,
    options: &Options,
    order: &[String],
    mode: LibraryMode,
    declarations_only: bool,
    diagnostics: &mut Diagnostics,
) -> BTreeSet<String> {
    let mut includes = BTreeSet::new();
    let mut emitted: HashSet<(String, String)> = HashSet::new();

    for name in order {
        let Some(template) = library.find(name, options) else {
            diagnostics.push(
                Diagnostic::warning()
                    .with_code(ErrorCode::MissingImplementation)
                    .with_message(format!(
                        "no implementation of `{name}` matches configuration `{}`",
                        options.name()
                    )),
            );
            gen.emit_raw(&format!("/* missing implementation: {name} */"));
            gen.blank_line();
            continue;
        };
        if !emitted.insert((template.name.clone(), template.signature.clone())) {
            continue;
        }
        // Shared mode: only functions have split definitions; macros
        // and type declarations live in the shared header alone.
        if mode == LibraryMode::Shared
            && !declarations_only
            && template.kind != TemplateKind::Function
        {
            continue;
        }
        for include in &template.includes {
            includes.insert(include.clone());
        }

        if declarations_only {
            match template.declaration(true) {
                Some(declaration) => gen.emit_raw(&declaration),
                None => gen.emit_raw(&template.body),
            }
            gen.blank_line();
            continue;
        }

        let body = match (mode, template.kind) {
            (LibraryMode::Inline, TemplateKind::Function)
                if !template.body.trim_start().starts_with("static")
                    && !template.body.trim_start().starts_with("inline") =>
            {
                format!("inline {}", template.body)
            }
            (LibraryMode::Static, TemplateKind::Function)
                if !template.body.trim_start().starts_with("static") =>
            {
                format!("static {}", template.body)
            }
            _ => template.body.clone(),
        };
        gen.emit_raw(&body);
        gen.blank_line();
    }
    includes
}

fn preamble(base_name: &str) -> String {
    format!("// Generated from schema target `{base_name}` by mdlc.\n// /!\\ Do not edit by hand\n\n")
}

fn finish_into(gen: Generator, text: &mut String, diagnostics: &mut Diagnostics) {
    let (generated, generated_diags, _) = gen.finish();
    diagnostics.append(generated_diags);
    text.push_str(&generated);
}

/// Generate the output units for the analyzed schema.
///
/// Schema errors abort the unit; missing implementations and
/// unresolved filters degrade to diagnostics plus placeholders.
pub fn generate(
    file: &ast::File,
    options: &Options,
    library: &CodeLibrary,
    base_name: &str,
    only: &[String],
) -> Result<(Output, Diagnostics), Diagnostics> {
    let mut diagnostics = Diagnostics::default();
    let scope = Scope::new(file)?;
    let nesting = options.nesting();
    let mode = options.library_mode();

    let Ok(messages) = select_messages(&scope, file, only, &mut diagnostics) else {
        return Err(diagnostics);
    };
    let enums = select_enums(&scope, file, &messages, only);

    // Definitions first: methods record the primitives they call.
    let mut methods = Generator::new(options);
    methods.set("vint_t", unsigned_type(options.varint_width()));
    methods.require("mdl_fail");
    for message in &messages {
        methods.scoped(|gen| {
            gen.set("msg", message.type_name().to_owned());
            emit_clear(gen, &scope, message);
            encoder::emit_wire_size(gen, &scope, message);
            encoder::emit_encode(gen, &scope, message);
            decoder::emit_decode(gen, &scope, message);
        });
    }
    let mut statics = Generator::new(options);
    for message in &messages {
        emit_static_members(&mut statics, &scope, options, message);
    }

    // Resolve primitive dependencies, dependencies first.
    let mut order = vec![];
    for name in methods.required().to_vec() {
        if let Err(cycle) = library.add_dependencies(options, &mut order, &name) {
            diagnostics.push(
                Diagnostic::error()
                    .with_code(ErrorCode::CyclicDependency)
                    .with_message(format!("primitive dependency cycle: {}", cycle.join(" -> "))),
            );
        }
    }

    // Declaration body: enums, structs, text conversions.
    let mut decls = Generator::new(options);
    let mut text_fns = vec![];
    if let Some(namespace) = options.namespace() {
        decls.emit_raw(&format!("namespace {namespace} {{"));
        decls.blank_line();
    }
    decls.emit_raw("enum {");
    decls.emit_raw("MDL_ERR_SPACE = 1,");
    decls.emit_raw("MDL_ERR_TRUNCATED = 2,");
    decls.emit_raw("MDL_ERR_TAG = 3,");
    decls.emit_raw("MDL_ERR_CAPACITY = 4,");
    decls.emit_raw("MDL_ERR_LENGTH = 5,");
    decls.emit_raw("};");
    decls.blank_line();

    match nesting {
        Nesting::Flatten => {
            for decl in &enums {
                decls.emit_raw(&generate_enum_declaration(decl, nesting));
                decls.blank_line();
                if enum_text_enabled(options, decl) {
                    text_fns.push(generate_enum_text(decl));
                }
            }
            for message in &messages {
                emit_struct(&mut decls, &scope, options, message, nesting, &mut text_fns);
            }
        }
        Nesting::Class => {
            // Free standing enums; nested ones are declared inside
            // their struct by emit_struct.
            for decl in &file.enums {
                if enums.iter().any(|e| e.name == decl.name) {
                    decls.emit_raw(&generate_enum_declaration(decl, nesting));
                    decls.blank_line();
                    if enum_text_enabled(options, decl) {
                        text_fns.push(generate_enum_text(decl));
                    }
                }
            }
            for root in top_level_roots(file, &messages) {
                emit_struct(&mut decls, &scope, options, root, nesting, &mut text_fns);
            }
        }
    }
    for text_fn in &text_fns {
        decls.emit_raw(text_fn);
        decls.blank_line();
    }
    if let Some(namespace) = options.namespace() {
        decls.emit_raw(&format!("}}  // namespace {namespace}"));
    }

    // Primitive emission per the configured mode.
    let mut inline_primitives = Generator::new(options);
    let mut source_primitives = Generator::new(options);
    let mut shared_decls = Generator::new(options);
    let mut shared_defs = Generator::new(options);
    let primitive_includes = match mode {
        LibraryMode::Inline => emit_primitives(
            &mut inline_primitives,
            library,
            options,
            &order,
            mode,
            false,
            &mut diagnostics,
        ),
        LibraryMode::Static => emit_primitives(
            &mut source_primitives,
            library,
            options,
            &order,
            mode,
            false,
            &mut diagnostics,
        ),
        LibraryMode::Shared => {
            let includes = emit_primitives(
                &mut shared_decls,
                library,
                options,
                &order,
                mode,
                true,
                &mut diagnostics,
            );
            emit_primitives(&mut shared_defs, library, options, &order, mode, false, &mut diagnostics);
            includes
        }
    };

    // Assemble the declarations unit.
    let mut header_text = preamble(base_name);
    header_text.push_str("#pragma once\n\n");
    header_text.push_str("#include <stdint.h>\n#include <stddef.h>\n#include <string.h>\n");
    if mode == LibraryMode::Shared {
        header_text.push_str(&format!("#include \"{base_name}_wire.h\"\n"));
    }
    if mode == LibraryMode::Inline {
        for include in &primitive_includes {
            header_text.push_str(&format!("#include {include}\n"));
        }
    }
    header_text.push('\n');
    if options.assertions() {
        let assert_macro = options.assert_macro();
        header_text.push_str(&format!(
            "#ifndef {assert_macro}\n#include <assert.h>\n#define {assert_macro} assert\n#endif  // {assert_macro}\n\n"
        ));
    }
    if mode == LibraryMode::Inline {
        finish_into(inline_primitives, &mut header_text, &mut diagnostics);
    }
    finish_into(decls, &mut header_text, &mut diagnostics);

    // Assemble the definitions unit.
    let mut source_text = preamble(base_name);
    source_text.push_str(&format!("#include \"{base_name}.h\"\n"));
    if mode == LibraryMode::Static {
        for include in &primitive_includes {
            source_text.push_str(&format!("#include {include}\n"));
        }
    }
    source_text.push('\n');
    if let Some(namespace) = options.namespace() {
        source_text.push_str(&format!("namespace {namespace} {{\n\n"));
    }
    if mode == LibraryMode::Static {
        finish_into(source_primitives, &mut source_text, &mut diagnostics);
    }
    finish_into(statics, &mut source_text, &mut diagnostics);
    finish_into(methods, &mut source_text, &mut diagnostics);
    if let Some(namespace) = options.namespace() {
        source_text.push_str(&format!("}}  // namespace {namespace}\n"));
    }

    // Assemble the shared primitive units.
    let (library_header, library_source) = if mode == LibraryMode::Shared {
        let mut decl_text = preamble(base_name);
        decl_text.push_str("#pragma once\n\n");
        decl_text.push_str("#include <stddef.h>\n");
        for include in &primitive_includes {
            decl_text.push_str(&format!("#include {include}\n"));
        }
        decl_text.push('\n');
        finish_into(shared_decls, &mut decl_text, &mut diagnostics);

        let mut def_text = preamble(base_name);
        def_text.push_str(&format!("#include \"{base_name}_wire.h\"\n\n"));
        finish_into(shared_defs, &mut def_text, &mut diagnostics);
        (Some(decl_text), Some(def_text))
    } else {
        (None, None)
    };

    let output = Output {
        base_name: base_name.to_owned(),
        header: header_text,
        source: source_text,
        library_header,
        library_source,
    };
    if diagnostics.has_errors() {
        Err(diagnostics)
    } else {
        Ok((output, diagnostics))
    }
}

/// Write the units to disk. Any failure unlinks the files already
/// written so an errored run leaves no partial output behind.
pub fn write_output(output: &Output, directory: &Path) -> io::Result<Vec<PathBuf>> {
    let mut units = vec![
        (format!("{}.h", output.base_name), &output.header),
        (format!("{}.cc", output.base_name), &output.source),
    ];
    if let Some(library_header) = &output.library_header {
        units.push((format!("{}_wire.h", output.base_name), library_header));
    }
    if let Some(library_source) = &output.library_source {
        units.push((format!("{}_wire.cc", output.base_name), library_source));
    }

    let mut written = vec![];
    for (name, text) in units {
        let path = directory.join(name);
        if let Err(err) = std::fs::write(&path, text) {
            for path in &written {
                let _ = std::fs::remove_file(path);
            }
            return Err(err);
        }
        written.push(path);
    }
    Ok(written)
}
