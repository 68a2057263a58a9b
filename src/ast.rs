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

//! Schema intermediate representation.
//!
//! The types in this module form the accessor contract with the schema
//! parser front end: the parser builds a [`File`] and the analyzer
//! annotates it (validity bits, type prefixes) before code generation.

use codespan_reporting::diagnostic;
use codespan_reporting::files;
#[cfg(feature = "serde")]
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::ops;

/// File identifier.
/// References a source file in the source database.
pub type FileId = usize;

/// Source database.
/// Stores the source file contents for reference.
pub type SourceDatabase = files::SimpleFiles<String, String>;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct SourceLocation {
    /// Byte offset into the file (counted from zero).
    pub offset: usize,
    /// Line number (counted from zero).
    pub line: usize,
    /// Column number (counted from zero)
    pub column: usize,
}

#[derive(Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct SourceRange {
    pub file: FileId,
    pub start: SourceLocation,
    pub end: SourceLocation,
}

/// Field presence quantifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Quantifier {
    Required,
    Optional,
    Repeated,
}

/// Field lifecycle state.
/// Deprecated fields keep their accessors but carry a deprecation
/// attribute; obsolete fields only reserve their wire id.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Usage {
    Regular,
    Deprecated,
    Obsolete,
}

/// Member generation mode for a message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum StorageMode {
    Regular,
    /// Entry points are declared `virtual`.
    Virtual,
    /// Data members are declared `static`.
    Static,
}

/// Member emission order.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SortMode {
    /// Ascending field id order.
    Sorted,
    /// Insertion order of the IR field vector. The analyzer never
    /// reorders fields, so this order is exactly as stable as the
    /// input IR.
    Unsorted,
}

/// Wire type code, the low three bits of a field tag.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum WireType {
    Varint,
    Fixed64,
    LengthPrefixed,
    Fixed8,
    Fixed16,
    Fixed32,
}

impl WireType {
    pub fn code(self) -> u32 {
        match self {
            WireType::Varint => 0,
            WireType::Fixed64 => 1,
            WireType::LengthPrefixed => 2,
            WireType::Fixed8 => 3,
            WireType::Fixed16 => 4,
            WireType::Fixed32 => 5,
        }
    }

    /// Wire type of a fixed width encoding.
    pub fn fixed(width: usize) -> WireType {
        match width {
            8 => WireType::Fixed8,
            16 => WireType::Fixed16,
            32 => WireType::Fixed32,
            64 => WireType::Fixed64,
            _ => panic!("invalid fixed width: {width}"),
        }
    }

    /// Number of payload bytes implied by the wire type, if fixed.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            WireType::Fixed8 => Some(1),
            WireType::Fixed16 => Some(2),
            WireType::Fixed32 => Some(4),
            WireType::Fixed64 => Some(8),
            WireType::Varint | WireType::LengthPrefixed => None,
        }
    }
}

/// Field type class.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum FieldType {
    /// Unsigned integer, varint encoded.
    Uint { width: usize },
    /// Signed integer, zigzag mapped then varint encoded.
    Sint { width: usize },
    /// Integer stored with its full width on the wire.
    Fixed { width: usize, signed: bool },
    /// IEEE float, stored as the matching fixed width.
    Float { width: usize },
    /// Length-prefixed byte run.
    Bytes,
    /// Length-prefixed text, NUL terminated in memory.
    String,
    /// Length-prefixed text referenced through a borrowed pointer.
    /// The null pointer doubles as the unset state.
    StringRef,
    /// Reference to an enum declaration; inherits its encoding.
    Enum { enum_id: String },
    /// Length-prefixed nested message.
    Message { type_id: String },
}

impl FieldType {
    /// Test if the type is a scalar, i.e. eligible for packed encoding.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            FieldType::Uint { .. }
                | FieldType::Sint { .. }
                | FieldType::Fixed { .. }
                | FieldType::Float { .. }
                | FieldType::Enum { .. }
        )
    }
}

/// Validity bit assignment for an optional field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ValidityBit {
    /// The analyzer has not run yet.
    Unassigned,
    /// Presence is tracked by comparing against the declared sentinel.
    Sentinel,
    /// The field does not track presence (required, repeated, or
    /// pointer-like optional).
    NotNeeded,
    /// Bit position in the message presence bitmap.
    Bit(usize),
}

/// Representation selected for a message presence bitmap.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum BitmapKind {
    None,
    U8,
    U16,
    U32,
    U64,
    /// Byte array of the given length.
    Bytes(usize),
}

impl BitmapKind {
    /// Narrowest representation holding `bits` presence bits.
    pub fn from_bits(bits: usize) -> BitmapKind {
        match bits {
            0 => BitmapKind::None,
            1..=8 => BitmapKind::U8,
            9..=16 => BitmapKind::U16,
            17..=32 => BitmapKind::U32,
            33..=64 => BitmapKind::U64,
            _ => BitmapKind::Bytes(bits.div_ceil(8)),
        }
    }
}

/// Enum value encoding.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum EnumEncoding {
    Varint,
    Fixed(usize),
    /// Narrowest fixed width that holds every declared value.
    Dynamic,
}

/// Option values attached directly to a schema node, either declared
/// in the schema source or applied from a configuration node path
/// override. Node values take precedence over the target configuration.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct NodeOptions {
    pub values: BTreeMap<String, String>,
    pub flags: BTreeMap<String, bool>,
}

impl NodeOptions {
    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn flag(&self, key: &str) -> Option<bool> {
        self.flags.get(key).copied()
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct EnumEntry {
    pub loc: SourceRange,
    pub name: String,
    pub value: i64,
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Enum {
    pub loc: SourceRange,
    pub name: String,
    pub entries: Vec<EnumEntry>,
    pub encoding: EnumEncoding,
    /// Fully prefixed type name, filled in by the analyzer.
    pub full_name: String,
    pub options: NodeOptions,
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Field {
    pub loc: SourceRange,
    /// Wire id. Must be positive unless the zero id opt-in flag is set.
    pub id: u32,
    pub name: String,
    pub quantifier: Quantifier,
    pub typ: FieldType,
    /// Literal text of the declared default value.
    pub default_value: Option<String>,
    /// Literal text of the declared "invalid/unset" sentinel.
    pub invalid_value: Option<String>,
    /// Fixed element capacity for repeated or length-prefixed fields.
    /// Zero selects a growable (pointer) member.
    pub array_size: usize,
    pub packed: bool,
    pub usage: Usage,
    /// Filled in by the analyzer.
    pub valid_bit: ValidityBit,
    pub options: NodeOptions,
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Message {
    pub loc: SourceRange,
    pub name: String,
    /// Fields in schema insertion order.
    pub fields: Vec<Field>,
    pub messages: Vec<Message>,
    pub enums: Vec<Enum>,
    pub storage: StorageMode,
    /// Total validity bit count, filled in by the analyzer.
    pub valid_bits: usize,
    /// Presence bitmap representation, filled in by the analyzer.
    pub bitmap: BitmapKind,
    /// Fully prefixed type name, filled in by the analyzer.
    pub full_name: String,
    pub options: NodeOptions,
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct File {
    pub file: FileId,
    pub package: Option<String>,
    pub messages: Vec<Message>,
    pub enums: Vec<Enum>,
}

impl SourceLocation {
    /// Construct a new source location.
    ///
    /// The `line_starts` indicates the byte offsets where new lines
    /// start in the file. The first element should thus be `0` since
    /// every file has at least one line starting at offset `0`.
    pub fn new(offset: usize, line_starts: &[usize]) -> SourceLocation {
        let mut loc = SourceLocation { offset, line: 0, column: offset };
        for (line, start) in line_starts.iter().enumerate() {
            if *start > offset {
                break;
            }
            loc = SourceLocation { offset, line, column: offset - start };
        }
        loc
    }
}

impl SourceRange {
    pub fn primary(&self) -> diagnostic::Label<FileId> {
        diagnostic::Label::primary(self.file, self.start.offset..self.end.offset)
    }
    pub fn secondary(&self) -> diagnostic::Label<FileId> {
        diagnostic::Label::secondary(self.file, self.start.offset..self.end.offset)
    }
}

impl fmt::Display for SourceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start.line == self.end.line {
            write!(f, "{}:{}-{}", self.start.line, self.start.column, self.end.column)
        } else {
            write!(
                f,
                "{}:{}-{}:{}",
                self.start.line, self.start.column, self.end.line, self.end.column
            )
        }
    }
}

impl fmt::Debug for SourceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRange").finish_non_exhaustive()
    }
}

impl ops::Add<SourceRange> for SourceRange {
    type Output = SourceRange;

    fn add(self, rhs: SourceRange) -> SourceRange {
        assert_eq!(self.file, rhs.file);
        SourceRange {
            file: self.file,
            start: self.start.min(rhs.start),
            end: self.end.max(rhs.end),
        }
    }
}

impl Enum {
    pub fn new(loc: SourceRange, name: &str, encoding: EnumEncoding) -> Enum {
        Enum {
            loc,
            name: name.to_owned(),
            entries: vec![],
            encoding,
            full_name: String::new(),
            options: NodeOptions::default(),
        }
    }

    pub fn min_value(&self) -> i64 {
        self.entries.iter().map(|e| e.value).min().unwrap_or(0)
    }

    pub fn max_value(&self) -> i64 {
        self.entries.iter().map(|e| e.value).max().unwrap_or(0)
    }

    /// First declared name for the value.
    pub fn name_of(&self, value: i64) -> Option<&str> {
        self.entries.iter().find(|e| e.value == value).map(|e| e.name.as_str())
    }

    pub fn value_of(&self, name: &str) -> Option<i64> {
        self.entries.iter().find(|e| e.name == name).map(|e| e.value)
    }

    /// Test if two entries share a value.
    pub fn has_aliases(&self) -> bool {
        self.entries
            .iter()
            .enumerate()
            .any(|(n, e)| self.entries[..n].iter().any(|p| p.value == e.value))
    }

    pub fn is_signed(&self) -> bool {
        self.min_value() < 0
    }

    /// Storage width of the enum: the declared fixed width, or for the
    /// dynamic encoding the narrowest of 8/16/32/64 bits that holds
    /// every declared value.
    pub fn width(&self) -> usize {
        match self.encoding {
            EnumEncoding::Fixed(width) => width,
            EnumEncoding::Varint | EnumEncoding::Dynamic => {
                let min = self.min_value();
                let max = self.max_value();
                for width in [8usize, 16, 32] {
                    let fits = if self.is_signed() {
                        min >= -(1i64 << (width - 1)) && max < (1i64 << (width - 1))
                    } else {
                        max < (1i64 << width)
                    };
                    if fits {
                        return width;
                    }
                }
                64
            }
        }
    }

    /// Wire encoding selected for the enum. Dynamic resolves to the
    /// fixed encoding of [`Enum::width`].
    pub fn wire_type(&self) -> WireType {
        match self.encoding {
            EnumEncoding::Varint => WireType::Varint,
            EnumEncoding::Fixed(width) => WireType::fixed(width),
            EnumEncoding::Dynamic => WireType::fixed(self.width()),
        }
    }

    pub fn type_name(&self) -> &str {
        if self.full_name.is_empty() {
            &self.name
        } else {
            &self.full_name
        }
    }
}

impl Field {
    pub fn new(loc: SourceRange, id: u32, name: &str, quantifier: Quantifier, typ: FieldType) -> Field {
        Field {
            loc,
            id,
            name: name.to_owned(),
            quantifier,
            typ,
            default_value: None,
            invalid_value: None,
            array_size: 0,
            packed: false,
            usage: Usage::Regular,
            valid_bit: ValidityBit::Unassigned,
            options: NodeOptions::default(),
        }
    }

    /// Test whether presence tracking requires a bitmap bit: optional,
    /// without a declared sentinel, and not a pointer-like type whose
    /// null state doubles as unset.
    pub fn needs_valid_bit(&self) -> bool {
        self.quantifier == Quantifier::Optional
            && self.invalid_value.is_none()
            && !matches!(self.typ, FieldType::StringRef)
            && self.usage != Usage::Obsolete
    }
}

impl Message {
    pub fn new(loc: SourceRange, name: &str) -> Message {
        Message {
            loc,
            name: name.to_owned(),
            fields: vec![],
            messages: vec![],
            enums: vec![],
            storage: StorageMode::Regular,
            valid_bits: 0,
            bitmap: BitmapKind::None,
            full_name: String::new(),
            options: NodeOptions::default(),
        }
    }

    pub fn field(&self, id: u32) -> Option<&Field> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn field_by_name(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Borrowed view of the fields in ascending id order.
    pub fn fields_by_id(&self) -> Vec<&Field> {
        let mut fields: Vec<&Field> = self.fields.iter().collect();
        fields.sort_by_key(|f| f.id);
        fields
    }

    /// Fields in the configured emission order.
    pub fn iter_fields(&self, mode: SortMode) -> Vec<&Field> {
        match mode {
            SortMode::Sorted => self.fields_by_id(),
            SortMode::Unsorted => self.fields.iter().collect(),
        }
    }

    pub fn type_name(&self) -> &str {
        if self.full_name.is_empty() {
            &self.name
        } else {
            &self.full_name
        }
    }
}

impl File {
    pub fn new(file: FileId) -> File {
        File { file, package: None, messages: vec![], enums: vec![] }
    }
}

/// Number of bytes in the varint encoding of `value`: the smallest `n`
/// such that `value < 128^n`.
pub fn varint_size(value: u64) -> usize {
    let mut size = 1;
    let mut value = value >> 7;
    while value != 0 {
        size += 1;
        value >>= 7;
    }
    size
}

/// Map a signed value of the given bit width onto an unsigned value
/// for varint transport: `(v << 1) ^ (v >> (width - 1))`.
pub fn zigzag(value: i64, width: usize) -> u64 {
    let mapped = ((value << 1) ^ (value >> (width - 1))) as u64;
    if width == 64 {
        mapped
    } else {
        mapped & ((1u64 << width) - 1)
    }
}

/// Inverse of [`zigzag`]: bit 0 becomes the sign, the rest shift right.
pub fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Compose a field tag from the wire id and the wire type code.
pub fn tag(id: u32, wire_type: WireType) -> u32 {
    (id << 3) | wire_type.code()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_location_new() {
        let line_starts = &[0, 20, 80, 120, 150];
        assert_eq!(
            SourceLocation::new(0, line_starts),
            SourceLocation { offset: 0, line: 0, column: 0 }
        );
        assert_eq!(
            SourceLocation::new(50, line_starts),
            SourceLocation { offset: 50, line: 1, column: 30 }
        );
        assert_eq!(
            SourceLocation::new(1000, line_starts),
            SourceLocation { offset: 1000, line: 4, column: 850 }
        );
    }

    #[test]
    fn varint_size_boundaries() {
        assert_eq!(varint_size(0), 1);
        assert_eq!(varint_size(127), 1);
        assert_eq!(varint_size(128), 2);
        assert_eq!(varint_size(16383), 2);
        assert_eq!(varint_size(16384), 3);
        assert_eq!(varint_size(u64::MAX), 10);
    }

    #[test]
    fn zigzag_small_magnitudes_stay_small() {
        assert_eq!(zigzag(0, 64), 0);
        assert_eq!(zigzag(-1, 64), 1);
        assert_eq!(zigzag(1, 64), 2);
        assert_eq!(zigzag(-2, 64), 3);
        assert_eq!(zigzag(2, 64), 4);
        assert_eq!(zigzag(-1, 32), 1);
        assert_eq!(zigzag(i64::from(i32::MIN), 32), u64::from(u32::MAX));
    }

    #[test]
    fn zigzag_round_trip() {
        for value in [0i64, 1, -1, 63, -64, 300, -300, i64::MAX, i64::MIN] {
            assert_eq!(unzigzag(zigzag(value, 64)), value);
        }
        for value in [0i64, -1, i64::from(i32::MIN), i64::from(i32::MAX)] {
            assert_eq!(unzigzag(zigzag(value, 32)), value);
        }
    }

    #[test]
    fn tag_layout() {
        // Concrete scenario values: a required varint field with id 1
        // tags as 0x08, a length-prefixed field with id 2 as 0x12, and
        // a packed run with id 3 as 0x1a.
        assert_eq!(tag(1, WireType::Varint), 0x08);
        assert_eq!(tag(2, WireType::LengthPrefixed), 0x12);
        assert_eq!(tag(3, WireType::LengthPrefixed), 0x1a);
        assert_eq!(tag(4, WireType::Fixed32), 0x25);
    }

    #[test]
    fn bitmap_kind_selection() {
        assert_eq!(BitmapKind::from_bits(0), BitmapKind::None);
        assert_eq!(BitmapKind::from_bits(1), BitmapKind::U8);
        assert_eq!(BitmapKind::from_bits(8), BitmapKind::U8);
        assert_eq!(BitmapKind::from_bits(9), BitmapKind::U16);
        assert_eq!(BitmapKind::from_bits(33), BitmapKind::U64);
        assert_eq!(BitmapKind::from_bits(64), BitmapKind::U64);
        assert_eq!(BitmapKind::from_bits(65), BitmapKind::Bytes(9));
    }

    #[test]
    fn enum_dynamic_width() {
        let loc = SourceRange::default();
        let mut e = Enum::new(loc, "Mode", EnumEncoding::Dynamic);
        e.entries.push(EnumEntry { loc, name: "A".to_owned(), value: 0 });
        e.entries.push(EnumEntry { loc, name: "B".to_owned(), value: 200 });
        assert_eq!(e.width(), 8);
        assert_eq!(e.wire_type(), WireType::Fixed8);

        e.entries.push(EnumEntry { loc, name: "C".to_owned(), value: 70000 });
        assert_eq!(e.width(), 32);
        assert_eq!(e.wire_type(), WireType::Fixed32);

        e.entries.push(EnumEntry { loc, name: "D".to_owned(), value: -1 });
        assert!(e.is_signed());
        assert_eq!(e.width(), 32);
    }

    #[test]
    fn enum_aliases() {
        let loc = SourceRange::default();
        let mut e = Enum::new(loc, "Mode", EnumEncoding::Varint);
        e.entries.push(EnumEntry { loc, name: "A".to_owned(), value: 1 });
        e.entries.push(EnumEntry { loc, name: "B".to_owned(), value: 2 });
        assert!(!e.has_aliases());
        e.entries.push(EnumEntry { loc, name: "FIRST".to_owned(), value: 1 });
        assert!(e.has_aliases());
        assert_eq!(e.name_of(1), Some("A"));
    }

    #[test]
    fn needs_valid_bit() {
        let loc = SourceRange::default();
        let mut f =
            Field::new(loc, 1, "value", Quantifier::Optional, FieldType::Uint { width: 32 });
        assert!(f.needs_valid_bit());
        f.invalid_value = Some("0xffffffff".to_owned());
        assert!(!f.needs_valid_bit());

        let f = Field::new(loc, 2, "name", Quantifier::Optional, FieldType::StringRef);
        assert!(!f.needs_valid_bit());
        let f = Field::new(loc, 3, "count", Quantifier::Required, FieldType::Uint { width: 8 });
        assert!(!f.needs_valid_bit());
    }

    #[test]
    fn unsorted_iteration_preserves_insertion_order() {
        let loc = SourceRange::default();
        let mut m = Message::new(loc, "Test");
        m.fields.push(Field::new(loc, 3, "c", Quantifier::Required, FieldType::Bytes));
        m.fields.push(Field::new(loc, 1, "a", Quantifier::Required, FieldType::Bytes));
        m.fields.push(Field::new(loc, 2, "b", Quantifier::Required, FieldType::Bytes));

        let unsorted: Vec<u32> = m.iter_fields(SortMode::Unsorted).iter().map(|f| f.id).collect();
        assert_eq!(unsorted, vec![3, 1, 2]);
        let sorted: Vec<u32> = m.iter_fields(SortMode::Sorted).iter().map(|f| f.id).collect();
        assert_eq!(sorted, vec![1, 2, 3]);
    }
}
