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

//! Decode dispatch synthesis.
//!
//! One loop reads a tag and branches on the known (field id, wire
//! type) pairs; unknown tags are skipped by wire type or fatal per
//! configuration. Every read is bounded by `$lim`, which the packed
//! run decoder rebinds to the end of the declared byte length so an
//! element can never read past its run.

use codespan_reporting::diagnostic::Diagnostic;

use crate::analyzer::{ErrorCode, Scope};
use crate::ast;
use crate::ast::{Quantifier, Usage};
use crate::generator::Generator;

use super::encoder::{classify, Element};
use super::with_field;

/// Read one element into `$val`.
fn emit_element(gen: &mut Generator, element: Element) {
    match element {
        Element::Varint => {
            gen.require("mdl_vint_read");
            gen.emit("$vint_t v;");
            gen.emit("if (mdl_vint_read(src, $lim, &p, &v) < 0) {");
            gen.emit("mdl_fail(MDL_ERR_TRUNCATED);");
            gen.emit("}");
            gen.emit("$val = ($ctype)($uelem)v;");
        }
        Element::Zigzag => {
            gen.require("mdl_vint_read");
            gen.require("mdl_unzigzag");
            gen.emit("$vint_t v;");
            gen.emit("if (mdl_vint_read(src, $lim, &p, &v) < 0) {");
            gen.emit("mdl_fail(MDL_ERR_TRUNCATED);");
            gen.emit("}");
            gen.emit("$val = ($ctype)mdl_unzigzag((uint64_t)v);");
        }
        Element::Fixed => {
            gen.require("mdl_load_fixed");
            gen.emit("uint64_t v;");
            gen.emit("if (mdl_load_fixed(src, $lim, &p, &v, $bytes) < 0) {");
            gen.emit("mdl_fail(MDL_ERR_TRUNCATED);");
            gen.emit("}");
            gen.emit("$val = ($ctype)($uelem)v;");
        }
        Element::Float => {
            gen.require("mdl_load_fixed");
            gen.emit("uint64_t v;");
            gen.emit("if (mdl_load_fixed(src, $lim, &p, &v, $bytes) < 0) {");
            gen.emit("mdl_fail(MDL_ERR_TRUNCATED);");
            gen.emit("}");
            gen.emit("$uelem raw = ($uelem)v;");
            gen.emit("memcpy(&$val, &raw, $bytes);");
        }
        Element::Message => {
            gen.require("mdl_vint_read");
            gen.emit("$vint_t n;");
            gen.emit("if (mdl_vint_read(src, $lim, &p, &n) < 0) {");
            gen.emit("mdl_fail(MDL_ERR_TRUNCATED);");
            gen.emit("}");
            gen.emit("if ((size_t)n > $lim - p) {");
            gen.emit("mdl_fail(MDL_ERR_TRUNCATED);");
            gen.emit("}");
            gen.emit("{");
            gen.emit("size_t end = p + (size_t)n;");
            gen.emit("{");
            gen.emit("int rc = $val.decode(src, end, &p);");
            gen.emit("if (rc < 0) {");
            gen.emit("return rc;");
            gen.emit("}");
            gen.emit("}");
            gen.emit("if (p != end) {");
            gen.emit("mdl_fail(MDL_ERR_LENGTH);");
            gen.emit("}");
            gen.emit("}");
        }
        Element::Bytes | Element::Str | Element::StrRef => {
            unreachable!("length prefixed payloads are decoded whole")
        }
    }
}

/// Read a length prefixed payload into the field members.
fn emit_length_prefixed(gen: &mut Generator, field: &ast::Field, element: Element) {
    gen.require("mdl_vint_read");
    gen.emit("$vint_t n;");
    gen.emit("if (mdl_vint_read(src, $lim, &p, &n) < 0) {");
    gen.emit("mdl_fail(MDL_ERR_TRUNCATED);");
    gen.emit("}");
    gen.emit("if ((size_t)n > $lim - p) {");
    gen.emit("mdl_fail(MDL_ERR_TRUNCATED);");
    gen.emit("}");
    match element {
        Element::Bytes if field.array_size > 0 => {
            gen.emit("if (n > $cap) {");
            gen.emit("mdl_fail(MDL_ERR_CAPACITY);");
            gen.emit("}");
            gen.emit("memcpy($fname, &src[p], (size_t)n);");
            gen.emit("$lenm = (uint32_t)n;");
        }
        Element::Bytes => {
            gen.emit("$fname = &src[p];");
            gen.emit("$lenm = (uint32_t)n;");
        }
        Element::Str if field.array_size > 0 => {
            gen.emit("if (n > $cap) {");
            gen.emit("mdl_fail(MDL_ERR_CAPACITY);");
            gen.emit("}");
            gen.emit("memcpy($fname, &src[p], (size_t)n);");
            gen.emit("$fname[n] = '\\0';");
        }
        Element::Str | Element::StrRef => {
            gen.emit("$fname = (const char *)&src[p];");
            gen.emit("$lenm = (uint32_t)n;");
        }
        _ => unreachable!("not a length prefixed element"),
    }
    gen.emit("p += (size_t)n;");
}

fn emit_skip(gen: &mut Generator) {
    gen.require("mdl_skip_field");
    gen.emit("if (mdl_skip_field(src, len, &p, (unsigned)(tag & 7u)) < 0) {");
    gen.emit("mdl_fail(MDL_ERR_TAG);");
    gen.emit("}");
}

fn emit_field_decode(gen: &mut Generator, scope: &Scope, field: &ast::Field) {
    let element = classify(scope, field);

    if field.usage == Usage::Obsolete {
        // The id stays reserved in the dispatch table and its payload
        // is skipped like an unknown field.
        emit_skip(gen);
        return;
    }

    if field.quantifier == Quantifier::Repeated {
        if field.array_size == 0 {
            gen.diagnostics.push(
                Diagnostic::warning()
                    .with_code(ErrorCode::RepeatedLengthPrefixed)
                    .with_message(format!(
                        "growable repeated field `{}` is skipped on decode",
                        field.name
                    )),
            );
            gen.emit("/* growable repeated field: encode only */");
            emit_skip(gen);
            return;
        }
        if field.packed {
            gen.require("mdl_vint_read");
            gen.emit("$vint_t n;");
            gen.emit("if (mdl_vint_read(src, $lim, &p, &n) < 0) {");
            gen.emit("mdl_fail(MDL_ERR_TRUNCATED);");
            gen.emit("}");
            gen.emit("if ((size_t)n > $lim - p) {");
            gen.emit("mdl_fail(MDL_ERR_TRUNCATED);");
            gen.emit("}");
            gen.emit("{");
            gen.emit("size_t end = p + (size_t)n;");
            gen.emit("while (p < end) {");
            gen.emit("if ($count >= $cap) {");
            gen.emit("mdl_fail(MDL_ERR_CAPACITY);");
            gen.emit("}");
            gen.emit("{");
            gen.scoped(|gen| {
                // Bound element reads by the run, not the stream.
                gen.set("lim", "end");
                gen.set("val", "$fname[$count]");
                emit_element(gen, element);
            });
            gen.emit("}");
            gen.emit("$count++;");
            gen.emit("}");
            gen.emit("if (p != end) {");
            gen.emit("mdl_fail(MDL_ERR_LENGTH);");
            gen.emit("}");
            gen.emit("}");
        } else {
            gen.emit("if ($count >= $cap) {");
            gen.emit("mdl_fail(MDL_ERR_CAPACITY);");
            gen.emit("}");
            gen.scoped(|gen| {
                gen.set("val", "$fname[$count]");
                emit_element(gen, element);
            });
            gen.emit("$count++;");
        }
        return;
    }

    match element {
        Element::Bytes | Element::Str | Element::StrRef => emit_length_prefixed(gen, field, element),
        element => gen.scoped(|gen| {
            gen.set("val", "$fname");
            emit_element(gen, element);
        }),
    }
    gen.emit("$has_set");
}

/// The decode entry point: clear, then read tags until the stream is
/// consumed or the terminator byte is seen.
pub(super) fn emit_decode(gen: &mut Generator, scope: &Scope, message: &ast::Message) {
    let sort = gen.options().member_sort();
    let terminator = gen.options().terminator();
    let skip_unknown = gen.options().skip_unknown();

    gen.emit("int $msg::decode(const uint8_t *src, size_t len, size_t *pos)");
    gen.emit("{");
    gen.emit("size_t p = *pos;");
    gen.emit("clear();");
    gen.require("mdl_vint_read");
    gen.set("lim", "len");
    gen.emit("while (p < len) {");
    if let Some(terminator) = terminator {
        gen.set("term", format!("0x{terminator:02x}"));
        gen.emit("if (src[p] == $term) {");
        gen.emit("p++;");
        gen.emit("break;");
        gen.emit("}");
    }
    gen.emit("$vint_t tag;");
    gen.emit("if (mdl_vint_read(src, len, &p, &tag) < 0) {");
    gen.emit("mdl_fail(MDL_ERR_TRUNCATED);");
    gen.emit("}");
    gen.emit("switch (tag) {");
    for field in message.iter_fields(sort) {
        with_field(gen, scope, message, field, |gen| {
            gen.emit("case $tag:");
            gen.emit("{");
            emit_field_decode(gen, scope, field);
            gen.emit("break;");
            gen.emit("}");
        });
    }
    gen.emit("default:");
    gen.emit("{");
    if skip_unknown {
        emit_skip(gen);
    } else {
        gen.emit("mdl_fail(MDL_ERR_TAG);");
    }
    gen.emit("break;");
    gen.emit("}");
    gen.emit("}");
    gen.emit("}");
    gen.emit("*pos = p;");
    gen.emit("return 0;");
    gen.emit("}");
    gen.blank_line();
}
