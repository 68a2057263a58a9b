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

//! Encode and size calculation synthesis.

use crate::analyzer::Scope;
use crate::ast;
use crate::ast::{FieldType, Quantifier, Usage, WireType};
use crate::generator::Generator;
use crate::options::Optimize;

use super::{open_presence_guard, with_field};

/// Encoding shape of one element of a field, the axis the per-field
/// state machine dispatches on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(super) enum Element {
    /// Varint transported unsigned integer (or varint enum).
    Varint,
    /// Zigzag mapped signed integer.
    Zigzag,
    /// Full width integer (or fixed encoded enum).
    Fixed,
    Float,
    Bytes,
    Str,
    StrRef,
    Message,
}

pub(super) fn classify(scope: &Scope, field: &ast::Field) -> Element {
    match &field.typ {
        FieldType::Uint { .. } => Element::Varint,
        FieldType::Sint { .. } => Element::Zigzag,
        FieldType::Fixed { .. } => Element::Fixed,
        FieldType::Float { .. } => Element::Float,
        FieldType::Bytes => Element::Bytes,
        FieldType::String => Element::Str,
        FieldType::StringRef => Element::StrRef,
        FieldType::Message { .. } => Element::Message,
        FieldType::Enum { enum_id } => {
            match scope.get_enum(enum_id).map(ast::Enum::wire_type) {
                Some(WireType::Varint) | None => Element::Varint,
                Some(_) => Element::Fixed,
            }
        }
    }
}

/// Write the field tag. Optimizing for speed proves single byte tags
/// statically and stores a literal instead of calling the varint
/// writer.
fn emit_tag(gen: &mut Generator, scope: &Scope, field: &ast::Field) {
    let tag = scope.tag(field);
    if gen.options().optimize() == Optimize::Speed && tag < 0x80 {
        gen.emit("if (p + 1 > cap) {");
        gen.emit("mdl_fail(MDL_ERR_SPACE);");
        gen.emit("}");
        gen.emit("dst[p++] = $tag;");
    } else {
        gen.require("mdl_vint_write");
        gen.emit("if (mdl_vint_write(dst, cap, &p, $tag) < 0) {");
        gen.emit("mdl_fail(MDL_ERR_SPACE);");
        gen.emit("}");
    }
}

/// Encode one element; the value expression is bound as `$val`.
fn emit_element(gen: &mut Generator, element: Element) {
    match element {
        Element::Varint => {
            gen.require("mdl_vint_write");
            gen.emit("if (mdl_vint_write(dst, cap, &p, ($vint_t)($uelem)$val) < 0) {");
            gen.emit("mdl_fail(MDL_ERR_SPACE);");
            gen.emit("}");
        }
        Element::Zigzag => {
            gen.require("mdl_vint_write");
            gen.require("mdl_zigzag");
            gen.emit(
                "if (mdl_vint_write(dst, cap, &p, ($vint_t)($uelem)mdl_zigzag((int64_t)$val, $bits)) < 0) {",
            );
            gen.emit("mdl_fail(MDL_ERR_SPACE);");
            gen.emit("}");
        }
        Element::Fixed => {
            gen.require("mdl_store_fixed");
            gen.emit("if (mdl_store_fixed(dst, cap, &p, (uint64_t)($uelem)$val, $bytes) < 0) {");
            gen.emit("mdl_fail(MDL_ERR_SPACE);");
            gen.emit("}");
        }
        Element::Float => {
            gen.require("mdl_store_fixed");
            gen.emit("{");
            gen.emit("$uelem raw;");
            gen.emit("memcpy(&raw, &$val, $bytes);");
            gen.emit("if (mdl_store_fixed(dst, cap, &p, (uint64_t)raw, $bytes) < 0) {");
            gen.emit("mdl_fail(MDL_ERR_SPACE);");
            gen.emit("}");
            gen.emit("}");
        }
        Element::Bytes | Element::Str | Element::StrRef => {
            unreachable!("length prefixed elements are encoded whole")
        }
        Element::Message => {
            gen.require("mdl_vint_write");
            gen.emit("{");
            gen.emit("size_t n = $val.wire_size();");
            gen.emit("if (mdl_vint_write(dst, cap, &p, ($vint_t)n) < 0) {");
            gen.emit("mdl_fail(MDL_ERR_SPACE);");
            gen.emit("}");
            gen.emit("{");
            gen.emit("int rc = $val.encode(dst, cap, &p);");
            gen.emit("if (rc < 0) {");
            gen.emit("return rc;");
            gen.emit("}");
            gen.emit("}");
            gen.emit("}");
        }
    }
}

/// Encode a length prefixed payload field (bytes and strings).
fn emit_length_prefixed(gen: &mut Generator, field: &ast::Field, element: Element) {
    gen.require("mdl_vint_write");
    gen.require("mdl_put_bytes");
    match element {
        Element::Str if field.array_size > 0 => {
            gen.emit("{");
            gen.emit("size_t n = strlen($fname);");
            gen.emit("if (mdl_vint_write(dst, cap, &p, ($vint_t)n) < 0) {");
            gen.emit("mdl_fail(MDL_ERR_SPACE);");
            gen.emit("}");
            gen.emit("if (mdl_put_bytes(dst, cap, &p, $fname, n) < 0) {");
            gen.emit("mdl_fail(MDL_ERR_SPACE);");
            gen.emit("}");
            gen.emit("}");
        }
        _ => {
            gen.emit("if (mdl_vint_write(dst, cap, &p, ($vint_t)$lenm) < 0) {");
            gen.emit("mdl_fail(MDL_ERR_SPACE);");
            gen.emit("}");
            gen.emit("if (mdl_put_bytes(dst, cap, &p, $fname, $lenm) < 0) {");
            gen.emit("mdl_fail(MDL_ERR_SPACE);");
            gen.emit("}");
        }
    }
}

/// Packed run: one tag, the byte length of the run, then the
/// concatenated element encodings.
fn emit_packed_encode(gen: &mut Generator, scope: &Scope, field: &ast::Field, element: Element) {
    gen.emit("if ($count > 0) {");
    emit_tag(gen, scope, field);
    match element {
        Element::Varint => {
            gen.require("mdl_wiresize");
            gen.emit("size_t run = 0;");
            gen.emit("for (uint32_t i = 0; i < $count; i++) {");
            gen.emit("run += mdl_wiresize((uint64_t)($uelem)$fname[i]);");
            gen.emit("}");
        }
        Element::Zigzag => {
            gen.require("mdl_wiresize");
            gen.require("mdl_zigzag");
            gen.emit("size_t run = 0;");
            gen.emit("for (uint32_t i = 0; i < $count; i++) {");
            gen.emit("run += mdl_wiresize((uint64_t)($uelem)mdl_zigzag((int64_t)$fname[i], $bits));");
            gen.emit("}");
        }
        _ => gen.emit("size_t run = (size_t)$count * $bytes;"),
    }
    gen.emit("if (mdl_vint_write(dst, cap, &p, ($vint_t)run) < 0) {");
    gen.emit("mdl_fail(MDL_ERR_SPACE);");
    gen.emit("}");
    gen.emit("for (uint32_t i = 0; i < $count; i++) {");
    gen.scoped(|gen| {
        gen.set("val", "$fname[i]");
        emit_element(gen, element);
    });
    gen.emit("}");
    gen.emit("}");
}

fn emit_field_encode(gen: &mut Generator, scope: &Scope, field: &ast::Field) {
    let element = classify(scope, field);

    if field.quantifier == Quantifier::Repeated {
        if field.packed {
            emit_packed_encode(gen, scope, field, element);
        } else {
            gen.emit("for (uint32_t i = 0; i < $count; i++) {");
            emit_tag(gen, scope, field);
            gen.scoped(|gen| {
                gen.set("val", "$fname[i]");
                emit_element(gen, element);
            });
            gen.emit("}");
        }
        return;
    }

    let guarded = open_presence_guard(gen, field);
    emit_tag(gen, scope, field);
    match element {
        Element::Bytes | Element::Str | Element::StrRef => {
            emit_length_prefixed(gen, field, element)
        }
        element => gen.scoped(|gen| {
            gen.set("val", "$fname");
            emit_element(gen, element);
        }),
    }
    if guarded {
        gen.emit("}");
    }
}

/// The encode entry point: walk the fields in the configured order
/// and write tag + payload for every present field.
pub(super) fn emit_encode(gen: &mut Generator, scope: &Scope, message: &ast::Message) {
    let sort = gen.options().member_sort();
    gen.emit("int $msg::encode(uint8_t *dst, size_t cap, size_t *pos) const");
    gen.emit("{");
    gen.emit("size_t p = *pos;");
    gen.emit("MDL_CHECK(p <= cap);");
    for field in message.iter_fields(sort) {
        if field.usage == Usage::Obsolete {
            continue;
        }
        with_field(gen, scope, message, field, |gen| emit_field_encode(gen, scope, field));
    }
    gen.emit("*pos = p;");
    gen.emit("return 0;");
    gen.emit("}");
    gen.blank_line();
}

/// Size contribution statements for one field. Statically fixed
/// contributions are folded into the initial constant instead.
fn emit_field_size(gen: &mut Generator, scope: &Scope, field: &ast::Field) {
    let element = classify(scope, field);

    if field.quantifier == Quantifier::Repeated {
        if field.packed {
            gen.emit("if ($count > 0) {");
            match element {
                Element::Varint => {
                    gen.require("mdl_wiresize");
                    gen.emit("size_t run = 0;");
                    gen.emit("for (uint32_t i = 0; i < $count; i++) {");
                    gen.emit("run += mdl_wiresize((uint64_t)($uelem)$fname[i]);");
                    gen.emit("}");
                }
                Element::Zigzag => {
                    gen.require("mdl_wiresize");
                    gen.require("mdl_zigzag");
                    gen.emit("size_t run = 0;");
                    gen.emit("for (uint32_t i = 0; i < $count; i++) {");
                    gen.emit(
                        "run += mdl_wiresize((uint64_t)($uelem)mdl_zigzag((int64_t)$fname[i], $bits));",
                    );
                    gen.emit("}");
                }
                _ => gen.emit("size_t run = (size_t)$count * $bytes;"),
            }
            gen.require("mdl_wiresize");
            gen.emit("size += $tagsize + mdl_wiresize((uint64_t)run) + run;");
            gen.emit("}");
        } else {
            match element {
                Element::Varint => {
                    gen.require("mdl_wiresize");
                    gen.emit("for (uint32_t i = 0; i < $count; i++) {");
                    gen.emit("size += $tagsize + mdl_wiresize((uint64_t)($uelem)$fname[i]);");
                    gen.emit("}");
                }
                Element::Zigzag => {
                    gen.require("mdl_wiresize");
                    gen.require("mdl_zigzag");
                    gen.emit("for (uint32_t i = 0; i < $count; i++) {");
                    gen.emit(
                        "size += $tagsize + mdl_wiresize((uint64_t)($uelem)mdl_zigzag((int64_t)$fname[i], $bits));",
                    );
                    gen.emit("}");
                }
                Element::Message => {
                    gen.require("mdl_wiresize");
                    gen.emit("for (uint32_t i = 0; i < $count; i++) {");
                    gen.emit("size_t n = $fname[i].wire_size();");
                    gen.emit("size += $tagsize + mdl_wiresize((uint64_t)n) + n;");
                    gen.emit("}");
                }
                _ => gen.emit("size += (size_t)$count * $($tagsize + $bytes);"),
            }
        }
        return;
    }

    let guarded = open_presence_guard(gen, field);
    match element {
        Element::Varint => {
            gen.require("mdl_wiresize");
            gen.emit("size += $tagsize + mdl_wiresize((uint64_t)($uelem)$fname);");
        }
        Element::Zigzag => {
            gen.require("mdl_wiresize");
            gen.require("mdl_zigzag");
            gen.emit(
                "size += $tagsize + mdl_wiresize((uint64_t)($uelem)mdl_zigzag((int64_t)$fname, $bits));",
            );
        }
        Element::Fixed | Element::Float => gen.emit("size += $($tagsize + $bytes);"),
        Element::Bytes | Element::StrRef => {
            gen.require("mdl_wiresize");
            gen.emit("size += $tagsize + mdl_wiresize((uint64_t)$lenm) + $lenm;");
        }
        Element::Str => {
            gen.require("mdl_wiresize");
            if field.array_size > 0 {
                gen.emit("{");
                gen.emit("size_t n = strlen($fname);");
                gen.emit("size += $tagsize + mdl_wiresize((uint64_t)n) + n;");
                gen.emit("}");
            } else {
                gen.emit("size += $tagsize + mdl_wiresize((uint64_t)$lenm) + $lenm;");
            }
        }
        Element::Message => {
            gen.require("mdl_wiresize");
            gen.emit("{");
            gen.emit("size_t n = $fname.wire_size();");
            gen.emit("size += $tagsize + mdl_wiresize((uint64_t)n) + n;");
            gen.emit("}");
        }
    }
    if guarded {
        gen.emit("}");
    }
}

/// The size calculation entry point: a pure function summing the
/// folded constant part and the per-field variable contributions.
pub(super) fn emit_wire_size(gen: &mut Generator, scope: &Scope, message: &ast::Message) {
    let sort = gen.options().member_sort();

    // Fold the tag and payload bytes of required fixed size fields
    // into one literal.
    let mut constant = 0usize;
    for field in message.iter_fields(sort) {
        if field.usage != Usage::Obsolete && scope.has_fixed_size(field) {
            constant += scope.tag_size(field)
                + scope
                    .fixed_payload_size(field)
                    .unwrap_or_else(|| unreachable!("fixed size field has a fixed payload"));
        }
    }

    gen.emit("size_t $msg::wire_size() const");
    gen.emit("{");
    gen.set("const_size", constant.to_string());
    gen.emit("size_t size = $const_size;");
    for field in message.iter_fields(sort) {
        if field.usage == Usage::Obsolete || scope.has_fixed_size(field) {
            continue;
        }
        with_field(gen, scope, message, field, |gen| emit_field_size(gen, scope, field));
    }
    gen.emit("return size;");
    gen.emit("}");
    gen.blank_line();
}
