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

//! End to end generation tests over a programmatically built schema.

use mdl_compiler::analyzer::{analyze, Diagnostics};
use mdl_compiler::ast::{
    Enum, EnumEncoding, EnumEntry, Field, FieldType, File, Message, Quantifier, SourceDatabase,
    SourceRange, Usage,
};
use mdl_compiler::backends::cxx;
use mdl_compiler::library::CodeLibrary;
use mdl_compiler::options::Options;

fn loc() -> SourceRange {
    SourceRange::default()
}

/// The schema used throughout: a required scalar, an optional string
/// without sentinel, and a packed byte run, so the tag layout of the
/// wire format shows up literally in the output.
fn sample_file() -> File {
    let mut file = File::new(0);

    let mut status = Message::new(loc(), "Status");
    status.fields.push(Field::new(
        loc(),
        1,
        "code",
        Quantifier::Required,
        FieldType::Uint { width: 32 },
    ));
    let mut label = Field::new(loc(), 2, "label", Quantifier::Optional, FieldType::String);
    label.array_size = 15;
    status.fields.push(label);
    let mut samples = Field::new(
        loc(),
        3,
        "samples",
        Quantifier::Repeated,
        FieldType::Uint { width: 8 },
    );
    samples.packed = true;
    samples.array_size = 8;
    status.fields.push(samples);
    file.messages.push(status);

    let mut mode = Enum::new(loc(), "Mode", EnumEncoding::Varint);
    mode.entries.push(EnumEntry { loc: loc(), name: "IDLE".to_owned(), value: 0 });
    mode.entries.push(EnumEntry { loc: loc(), name: "ACTIVE".to_owned(), value: 1 });
    file.enums.push(mode);

    file
}

fn generate(file: &File, options: &Options) -> (cxx::Output, Diagnostics) {
    let mut sources = SourceDatabase::new();
    let library = CodeLibrary::core(&mut sources).unwrap();
    let (analyzed, _) = analyze(file, options).unwrap();
    cxx::generate(&analyzed, options, &library, "status", &[]).unwrap()
}

#[test]
fn declarations_unit_holds_types_and_accessors() {
    let options = Options::new("test");
    let (output, diagnostics) = generate(&sample_file(), &options);
    assert!(!diagnostics.has_errors());

    assert!(output.header.contains("#pragma once"));
    assert!(output.header.contains("struct Status {"));
    assert!(output.header.contains("uint32_t code;"));
    assert!(output.header.contains("char label[16];"));
    assert!(output.header.contains("uint8_t samples[8];"));
    assert!(output.header.contains("uint32_t samples_count;"));
    // One optional field without sentinel: a single byte bitmap.
    assert!(output.header.contains("uint8_t _has;"));
    assert!(output.header.contains("bool has_label() const"));
    assert!(output.header.contains("enum class Mode : uint8_t {"));
    assert!(output.header.contains("const char *mode_text(Mode value)"));
}

#[test]
fn tag_bytes_match_the_wire_layout() {
    let options = Options::new("test");
    let (output, _) = generate(&sample_file(), &options);

    // id 1, varint: tag 0x08. id 2, length prefixed: 0x12. id 3,
    // packed run: 0x1a. The default configuration writes tags through
    // the varint writer.
    assert!(output.source.contains("mdl_vint_write(dst, cap, &p, 0x08)"));
    assert!(output.source.contains("mdl_vint_write(dst, cap, &p, 0x12)"));
    assert!(output.source.contains("mdl_vint_write(dst, cap, &p, 0x1a)"));
    assert!(output.source.contains("case 0x08:"));
    assert!(output.source.contains("case 0x12:"));
    assert!(output.source.contains("case 0x1a:"));
}

#[test]
fn speed_optimization_emits_literal_tag_bytes() {
    let mut diagnostics = Diagnostics::default();
    let mut options = Options::new("test");
    options.set_value("optimize", "speed", &mut diagnostics);
    let (output, _) = generate(&sample_file(), &options);

    assert!(output.source.contains("dst[p++] = 0x08;"));
    assert!(output.source.contains("dst[p++] = 0x12;"));
    // Speed also selects the clz wiresize variant.
    assert!(output.source.contains("__builtin_clzll"));
}

#[test]
fn optional_field_is_guarded_by_its_presence_bit() {
    let options = Options::new("test");
    let (output, _) = generate(&sample_file(), &options);

    assert!(output.source.contains("if ((_has & 0x01u) != 0) {"));
    assert!(output.header.contains("_has |= 0x01u;"));
    assert!(output.header.contains("_has &= (uint8_t)~0x01u;"));
}

#[test]
fn packed_run_encodes_length_then_elements() {
    let options = Options::new("test");
    let (output, _) = generate(&sample_file(), &options);

    // Variable length elements: the run length is summed first, then
    // written as a varint ahead of the elements.
    assert!(output.source.contains("if (samples_count > 0) {"));
    assert!(output.source.contains("run += mdl_wiresize((uint64_t)(uint8_t)samples[i]);"));
    assert!(output.source.contains("mdl_vint_write(dst, cap, &p, (uint64_t)run)"));
    // Decode loops inside the declared byte length.
    assert!(output.source.contains("while (p < end) {"));
    assert!(output.source.contains("if (p != end) {"));
}

#[test]
fn unknown_tags_are_skipped_by_default_and_fatal_on_request() {
    let options = Options::new("test");
    let (output, _) = generate(&sample_file(), &options);
    assert!(output.source.contains("mdl_skip_field(src, len, &p, (unsigned)(tag & 7u))"));

    let mut diagnostics = Diagnostics::default();
    let mut options = Options::new("test");
    options.set_value("unknown_fields", "fail", &mut diagnostics);
    let (output, _) = generate(&sample_file(), &options);
    assert!(!output.source.contains("mdl_skip_field"));
    assert!(output.source.contains("mdl_fail(MDL_ERR_TAG);"));
}

#[test]
fn terminator_byte_ends_the_decode_loop() {
    let mut diagnostics = Diagnostics::default();
    let mut options = Options::new("test");
    options.set_value("terminator", "0xff", &mut diagnostics);
    let (output, _) = generate(&sample_file(), &options);

    assert!(output.source.contains("if (src[p] == 0xff) {"));
}

#[test]
fn error_policy_changes_the_failure_macro() {
    let options = Options::new("test");
    let (output, _) = generate(&sample_file(), &options);
    assert!(output.source.contains("#define mdl_fail(code) return -(code)"));

    let mut diagnostics = Diagnostics::default();
    let mut options = Options::new("test");
    options.set_value("error_policy", "throw", &mut diagnostics);
    let (output, _) = generate(&sample_file(), &options);
    assert!(output.source.contains("#define mdl_fail(code) throw (int)(-(code))"));

    let mut options = Options::new("test");
    options.set_value("error_policy", "abort", &mut diagnostics);
    let (output, _) = generate(&sample_file(), &options);
    assert!(output.source.contains("#define mdl_fail(code) abort()"));
}

#[test]
fn primitives_precede_their_dependents() {
    let options = Options::new("test");
    let (output, _) = generate(&sample_file(), &options);

    // Static library mode by default; mdl_skip_field calls
    // mdl_vint_read, so the reader must be defined first.
    let read = output.source.find("static int mdl_vint_read").unwrap();
    let skip = output.source.find("static int mdl_skip_field").unwrap();
    assert!(read < skip);
}

#[test]
fn inline_mode_moves_primitives_to_the_header() {
    let mut diagnostics = Diagnostics::default();
    let mut options = Options::new("test");
    options.set_value("library_mode", "inline", &mut diagnostics);
    let (output, _) = generate(&sample_file(), &options);

    assert!(output.header.contains("inline int mdl_vint_write"));
    assert!(!output.source.contains("inline int mdl_vint_write"));
    assert!(output.library_header.is_none());
}

#[test]
fn shared_mode_splits_the_primitive_units() {
    let mut diagnostics = Diagnostics::default();
    let mut options = Options::new("test");
    options.set_value("library_mode", "shared", &mut diagnostics);
    let (output, _) = generate(&sample_file(), &options);

    let library_header = output.library_header.unwrap();
    let library_source = output.library_source.unwrap();
    assert!(library_header
        .contains("int mdl_vint_write(uint8_t *dst, size_t cap, size_t *pos, uint64_t value);"));
    assert!(library_source.contains("int mdl_vint_write(uint8_t *dst"));
    // The failure macro cannot be externally linked; it lives in the
    // shared header only.
    assert!(library_header.contains("#define mdl_fail"));
    assert!(!library_source.contains("#define mdl_fail"));
    assert!(output.header.contains("#include \"status_wire.h\""));
}

#[test]
fn forced_variant_miss_degrades_to_a_placeholder() {
    let mut options = Options::new("test");
    options.set_internal_value("mdl_vint_write", "nonesuch");
    let file = sample_file();

    let mut sources = SourceDatabase::new();
    let library = CodeLibrary::core(&mut sources).unwrap();
    let (analyzed, _) = analyze(&file, &options).unwrap();
    let (output, diagnostics) =
        cxx::generate(&analyzed, &options, &library, "status", &[]).unwrap();

    assert!(output.source.contains("/* missing implementation: mdl_vint_write */"));
    assert!(!diagnostics.is_empty());
    assert!(!diagnostics.has_errors());
}

#[test]
fn message_filter_restricts_generation() {
    let mut file = sample_file();
    let mut extra = Message::new(loc(), "Unrelated");
    extra.fields.push(Field::new(
        loc(),
        1,
        "x",
        Quantifier::Required,
        FieldType::Uint { width: 8 },
    ));
    file.messages.push(extra);

    let options = Options::new("test");
    let mut sources = SourceDatabase::new();
    let library = CodeLibrary::core(&mut sources).unwrap();
    let (analyzed, _) = analyze(&file, &options).unwrap();
    let (output, _) = cxx::generate(
        &analyzed,
        &options,
        &library,
        "status",
        &["Status".to_owned()],
    )
    .unwrap();

    assert!(output.header.contains("struct Status {"));
    assert!(!output.header.contains("struct Unrelated"));
}

#[test]
fn nested_messages_embed_their_member_types_first() {
    let mut file = File::new(0);
    let mut point = Message::new(loc(), "Point");
    point.fields.push(Field::new(
        loc(),
        1,
        "x",
        Quantifier::Required,
        FieldType::Fixed { width: 32, signed: true },
    ));
    point.fields.push(Field::new(
        loc(),
        2,
        "y",
        Quantifier::Required,
        FieldType::Fixed { width: 32, signed: true },
    ));
    let mut track = Message::new(loc(), "Track");
    let mut points = Field::new(
        loc(),
        1,
        "points",
        Quantifier::Repeated,
        FieldType::Message { type_id: "Point".to_owned() },
    );
    points.array_size = 4;
    track.fields.push(points);
    // Declared dependent first: the emitted order must still place
    // Point ahead of Track.
    file.messages.push(track);
    file.messages.push(point);

    let options = Options::new("test");
    let (output, _) = generate(&file, &options);
    let point_at = output.header.find("struct Point {").unwrap();
    let track_at = output.header.find("struct Track {").unwrap();
    assert!(point_at < track_at);
    assert!(output.source.contains("points[i].encode(dst, cap, &p)"));
    assert!(output.source.contains("points[points_count].decode(src, end, &p)"));
}

#[test]
fn class_nesting_declares_nested_types_inline() {
    let mut file = File::new(0);
    let mut inner = Message::new(loc(), "Inner");
    inner.fields.push(Field::new(
        loc(),
        1,
        "x",
        Quantifier::Required,
        FieldType::Uint { width: 16 },
    ));
    let mut outer = Message::new(loc(), "Outer");
    outer.messages.push(inner);
    let mut member = Field::new(
        loc(),
        1,
        "inner",
        Quantifier::Optional,
        FieldType::Message { type_id: "Inner".to_owned() },
    );
    member.invalid_value = None;
    outer.fields.push(member);
    file.messages.push(outer);

    let mut diagnostics = Diagnostics::default();
    let mut options = Options::new("test");
    options.set_value("nested_naming", "class", &mut diagnostics);
    let (output, _) = generate(&file, &options);

    let outer_at = output.header.find("struct Outer {").unwrap();
    let inner_at = output.header.find("struct Inner {").unwrap();
    assert!(outer_at < inner_at);
    assert!(output.source.contains("int Outer::Inner::encode"));

    // Flattened naming mangles the nested name instead.
    let options = Options::new("test");
    let (output, _) = generate(&file, &options);
    assert!(output.header.contains("struct Outer_Inner {"));
    assert!(output.source.contains("int Outer_Inner::encode"));
}

#[test]
fn aliased_enum_skips_the_text_function() {
    let mut file = sample_file();
    let mut level = Enum::new(loc(), "Level", EnumEncoding::Varint);
    level.entries.push(EnumEntry { loc: loc(), name: "LOW".to_owned(), value: 0 });
    level.entries.push(EnumEntry { loc: loc(), name: "MIN".to_owned(), value: 0 });
    file.enums.push(level);

    let mut diagnostics = Diagnostics::default();
    let mut options = Options::new("test");
    options.set_flag("enum_aliases", true, &mut diagnostics);
    let (output, _) = generate(&file, &options);

    assert!(output.header.contains("enum class Level"));
    assert!(!output.header.contains("level_text"));
    assert!(output.header.contains("mode_text"));
}

#[test]
fn deprecated_fields_carry_the_attribute() {
    let mut file = sample_file();
    let mut old = Field::new(loc(), 4, "old_code", Quantifier::Optional, FieldType::Uint {
        width: 16,
    });
    old.usage = Usage::Deprecated;
    old.invalid_value = Some("0".to_owned());
    file.messages[0].fields.push(old);

    let options = Options::new("test");
    let (output, _) = generate(&file, &options);
    assert!(output.header.contains("[[deprecated]] void set_old_code(uint16_t value)"));
}

#[test]
fn obsolete_fields_only_reserve_their_tag() {
    let mut file = sample_file();
    let mut gone = Field::new(loc(), 5, "gone", Quantifier::Required, FieldType::Uint {
        width: 32,
    });
    gone.usage = Usage::Obsolete;
    file.messages[0].fields.push(gone);

    let options = Options::new("test");
    let (output, _) = generate(&file, &options);
    // No member, no accessor, no encode branch; the decode dispatch
    // still skips the reserved id cleanly (id 5, varint: tag 0x28).
    assert!(!output.header.contains("gone"));
    assert!(output.source.contains("case 0x28:"));
}

#[test]
fn assertions_flag_gates_check_lines() {
    let options = Options::new("test");
    let (output, _) = generate(&sample_file(), &options);
    assert!(!output.source.contains("MDL_CHECK"));

    let mut diagnostics = Diagnostics::default();
    let mut options = Options::new("test");
    options.set_flag("assertions", true, &mut diagnostics);
    let (output, _) = generate(&sample_file(), &options);
    assert!(output.header.contains("#define MDL_CHECK assert"));
    assert!(output.source.contains("MDL_CHECK(p <= cap);"));
}

#[test]
fn sentinel_fields_compare_instead_of_using_the_bitmap() {
    let mut file = sample_file();
    let mut retries = Field::new(loc(), 6, "retries", Quantifier::Optional, FieldType::Uint {
        width: 16,
    });
    retries.invalid_value = Some("0xffff".to_owned());
    file.messages[0].fields.push(retries);

    let options = Options::new("test");
    let (output, _) = generate(&file, &options);
    assert!(output.source.contains("if (retries != 0xffff) {"));
    assert!(output.header.contains("return retries != 0xffff;"));
    // Still only one bitmap bit (for the label field).
    assert!(output.header.contains("uint8_t _has;"));
}

#[test]
fn write_output_unlinks_partial_files_on_failure() {
    let options = Options::new("test");
    let (output, _) = generate(&sample_file(), &options);

    let dir = tempfile::tempdir().unwrap();
    let written = cxx::write_output(&output, dir.path()).unwrap();
    assert_eq!(written.len(), 2);
    assert!(dir.path().join("status.h").exists());
    assert!(dir.path().join("status.cc").exists());

    // Make the second unit unwritable by occupying its path with a
    // directory; the first unit must be unlinked again.
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("status.cc")).unwrap();
    assert!(cxx::write_output(&output, dir.path()).is_err());
    assert!(!dir.path().join("status.h").exists());
}

#[test]
fn generated_output_is_deterministic() {
    let options = Options::new("test");
    let (first, _) = generate(&sample_file(), &options);
    let (second, _) = generate(&sample_file(), &options);
    assert_eq!(first.header, second.header);
    assert_eq!(first.source, second.source);
}
