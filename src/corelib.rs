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

//! Built-in primitive catalog source.
//!
//! Variant ordering matters: within one primitive the constrained
//! variants come first and the unconstrained fallback last, so a
//! configuration that sets none of the constrained keys still selects
//! an implementation.

/// The primitive library consumed by [`crate::library::CodeLibrary::core`].
pub const SOURCE: &str = r#"
//% name: mdl_wiresize
//% variant: clz
//% when: optimize = speed
//% include: <stdint.h>
size_t mdl_wiresize(uint64_t value)
{
    unsigned bits = 64u - (unsigned)__builtin_clzll(value | 1u);
    return (size_t)((bits * 9u + 64u) / 64u);
}

//% name: mdl_wiresize
//% variant: loop
//% include: <stdint.h>
size_t mdl_wiresize(uint64_t value)
{
    size_t size = 1;
    while (value >= 0x80u) {
        value >>= 7;
        size++;
    }
    return size;
}

//% name: mdl_vint_write
//% variant: narrow
//% when: varint_width = 16
//% include: <stdint.h>
int mdl_vint_write(uint8_t *dst, size_t cap, size_t *pos, uint16_t value)
{
    size_t p = *pos;
    while (value >= 0x80u) {
        if (p >= cap) {
            return -1;
        }
        dst[p++] = (uint8_t)(value | 0x80u);
        value = (uint16_t)(value >> 7);
    }
    if (p >= cap) {
        return -1;
    }
    dst[p++] = (uint8_t)value;
    *pos = p;
    return 0;
}

//% name: mdl_vint_write
//% variant: medium
//% when: varint_width = 32
//% include: <stdint.h>
int mdl_vint_write(uint8_t *dst, size_t cap, size_t *pos, uint32_t value)
{
    size_t p = *pos;
    while (value >= 0x80u) {
        if (p >= cap) {
            return -1;
        }
        dst[p++] = (uint8_t)(value | 0x80u);
        value >>= 7;
    }
    if (p >= cap) {
        return -1;
    }
    dst[p++] = (uint8_t)value;
    *pos = p;
    return 0;
}

//% name: mdl_vint_write
//% variant: wide
//% include: <stdint.h>
int mdl_vint_write(uint8_t *dst, size_t cap, size_t *pos, uint64_t value)
{
    size_t p = *pos;
    while (value >= 0x80u) {
        if (p >= cap) {
            return -1;
        }
        dst[p++] = (uint8_t)(value | 0x80u);
        value >>= 7;
    }
    if (p >= cap) {
        return -1;
    }
    dst[p++] = (uint8_t)value;
    *pos = p;
    return 0;
}

//% name: mdl_vint_read
//% variant: narrow
//% when: varint_width = 16
//% include: <stdint.h>
int mdl_vint_read(const uint8_t *src, size_t len, size_t *pos, uint16_t *out)
{
    uint16_t value = 0;
    unsigned shift = 0;
    size_t p = *pos;
    while (p < len) {
        uint8_t byte = src[p++];
        value |= (uint16_t)((uint16_t)(byte & 0x7fu) << shift);
        if ((byte & 0x80u) == 0) {
            *pos = p;
            *out = value;
            return 0;
        }
        shift += 7;
        if (shift >= 16) {
            return -1;
        }
    }
    return -1;
}

//% name: mdl_vint_read
//% variant: medium
//% when: varint_width = 32
//% include: <stdint.h>
int mdl_vint_read(const uint8_t *src, size_t len, size_t *pos, uint32_t *out)
{
    uint32_t value = 0;
    unsigned shift = 0;
    size_t p = *pos;
    while (p < len) {
        uint8_t byte = src[p++];
        value |= (uint32_t)(byte & 0x7fu) << shift;
        if ((byte & 0x80u) == 0) {
            *pos = p;
            *out = value;
            return 0;
        }
        shift += 7;
        if (shift >= 32) {
            return -1;
        }
    }
    return -1;
}

//% name: mdl_vint_read
//% variant: wide
//% include: <stdint.h>
int mdl_vint_read(const uint8_t *src, size_t len, size_t *pos, uint64_t *out)
{
    uint64_t value = 0;
    unsigned shift = 0;
    size_t p = *pos;
    while (p < len) {
        uint8_t byte = src[p++];
        value |= (uint64_t)(byte & 0x7fu) << shift;
        if ((byte & 0x80u) == 0) {
            *pos = p;
            *out = value;
            return 0;
        }
        shift += 7;
        if (shift >= 64) {
            return -1;
        }
    }
    return -1;
}

//% name: mdl_zigzag
//% include: <stdint.h>
#define mdl_zigzag(value, bits) ((uint64_t)(((value) << 1) ^ ((value) >> ((bits) - 1))))

//% name: mdl_unzigzag
//% include: <stdint.h>
#define mdl_unzigzag(value) ((int64_t)((value) >> 1) ^ -(int64_t)((value) & 1u))

//% name: mdl_store_fixed
//% variant: be
//% when: endianness = big
//% include: <stdint.h>
int mdl_store_fixed(uint8_t *dst, size_t cap, size_t *pos, uint64_t value, size_t width)
{
    size_t p = *pos;
    size_t i;
    if (p + width > cap) {
        return -1;
    }
    for (i = 0; i < width; i++) {
        dst[p + i] = (uint8_t)(value >> (8 * (width - 1 - i)));
    }
    *pos = p + width;
    return 0;
}

//% name: mdl_store_fixed
//% variant: le
//% include: <stdint.h>
int mdl_store_fixed(uint8_t *dst, size_t cap, size_t *pos, uint64_t value, size_t width)
{
    size_t p = *pos;
    size_t i;
    if (p + width > cap) {
        return -1;
    }
    for (i = 0; i < width; i++) {
        dst[p + i] = (uint8_t)(value >> (8 * i));
    }
    *pos = p + width;
    return 0;
}

//% name: mdl_load_fixed
//% variant: be
//% when: endianness = big
//% include: <stdint.h>
int mdl_load_fixed(const uint8_t *src, size_t len, size_t *pos, uint64_t *out, size_t width)
{
    size_t p = *pos;
    size_t i;
    uint64_t value = 0;
    if (p + width > len) {
        return -1;
    }
    for (i = 0; i < width; i++) {
        value = (value << 8) | src[p + i];
    }
    *pos = p + width;
    *out = value;
    return 0;
}

//% name: mdl_load_fixed
//% variant: le
//% include: <stdint.h>
int mdl_load_fixed(const uint8_t *src, size_t len, size_t *pos, uint64_t *out, size_t width)
{
    size_t p = *pos;
    size_t i;
    uint64_t value = 0;
    if (p + width > len) {
        return -1;
    }
    for (i = 0; i < width; i++) {
        value |= (uint64_t)src[p + i] << (8 * i);
    }
    *pos = p + width;
    *out = value;
    return 0;
}

//% name: mdl_put_bytes
//% include: <stdint.h>
//% include: <string.h>
int mdl_put_bytes(uint8_t *dst, size_t cap, size_t *pos, const void *src, size_t len)
{
    size_t p = *pos;
    if (p + len > cap) {
        return -1;
    }
    memcpy(&dst[p], src, len);
    *pos = p + len;
    return 0;
}

//% name: mdl_skip_field
//% needs: mdl_vint_read, mdl_load_fixed
//% include: <stdint.h>
int mdl_skip_field(const uint8_t *src, size_t len, size_t *pos, unsigned wire_type)
{
    uint64_t scratch;
    switch (wire_type) {
    case 0:
        return mdl_vint_read(src, len, pos, &scratch);
    case 1:
        return mdl_load_fixed(src, len, pos, &scratch, 8);
    case 2:
        if (mdl_vint_read(src, len, pos, &scratch) < 0) {
            return -1;
        }
        if (scratch > len - *pos) {
            return -1;
        }
        *pos += (size_t)scratch;
        return 0;
    case 3:
        return mdl_load_fixed(src, len, pos, &scratch, 1);
    case 4:
        return mdl_load_fixed(src, len, pos, &scratch, 2);
    case 5:
        return mdl_load_fixed(src, len, pos, &scratch, 4);
    default:
        return -1;
    }
}

//% name: mdl_escape
//% include: <stdint.h>
//% include: <stdio.h>
int mdl_escape(char *dst, size_t cap, const char *src, size_t len)
{
    size_t out = 0;
    size_t i;
    for (i = 0; i < len; i++) {
        unsigned char c = (unsigned char)src[i];
        const char *replacement = 0;
        switch (c) {
        case '"':
            replacement = "\\\"";
            break;
        case '\\':
            replacement = "\\\\";
            break;
        case '\n':
            replacement = "\\n";
            break;
        case '\r':
            replacement = "\\r";
            break;
        case '\t':
            replacement = "\\t";
            break;
        default:
            break;
        }
        if (replacement) {
            if (out + 2 > cap) {
                return -1;
            }
            dst[out++] = replacement[0];
            dst[out++] = replacement[1];
        } else if (c < 0x20u || c >= 0x7fu) {
            if (out + 6 > cap) {
                return -1;
            }
            snprintf(&dst[out], cap - out, "\\u%04x", (unsigned)c);
            out += 6;
        } else {
            if (out + 1 > cap) {
                return -1;
            }
            dst[out++] = (char)c;
        }
    }
    if (out >= cap) {
        return -1;
    }
    dst[out] = '\0';
    return (int)out;
}

//% name: mdl_fail
//% variant: throw
//% when: error_policy = throw
#define mdl_fail(code) throw (int)(-(code))

//% name: mdl_fail
//% variant: abort
//% when: error_policy = abort
//% include: <stdlib.h>
#define mdl_fail(code) abort()

//% name: mdl_fail
//% variant: cancel
#define mdl_fail(code) return -(code)
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Diagnostics;
    use crate::ast::SourceDatabase;
    use crate::library::{CodeLibrary, TemplateKind};
    use crate::options::Options;

    fn core() -> CodeLibrary {
        let mut sources = SourceDatabase::new();
        CodeLibrary::core(&mut sources).unwrap()
    }

    #[test]
    fn default_configuration_selects_every_primitive() {
        let library = core();
        let options = Options::new("test");
        for name in library.names() {
            assert!(library.find(name, &options).is_some(), "no default variant for {name}");
        }
    }

    #[test]
    fn optimize_speed_selects_clz_wiresize() {
        let library = core();
        let mut diagnostics = Diagnostics::default();
        let mut options = Options::new("test");
        options.set_value("optimize", "speed", &mut diagnostics);
        assert_eq!(library.find("mdl_wiresize", &options).unwrap().variant.as_deref(), Some("clz"));

        let mut options = Options::new("test");
        options.set_value("optimize", "size", &mut diagnostics);
        assert_eq!(
            library.find("mdl_wiresize", &options).unwrap().variant.as_deref(),
            Some("loop")
        );
    }

    #[test]
    fn varint_width_selects_accumulator() {
        let library = core();
        let mut diagnostics = Diagnostics::default();
        let mut options = Options::new("test");
        options.set_value("varint_width", "32", &mut diagnostics);
        let template = library.find("mdl_vint_write", &options).unwrap();
        assert_eq!(template.variant.as_deref(), Some("medium"));
        assert!(template.signature.contains("uint32_t value"));

        let options = Options::new("test");
        let template = library.find("mdl_vint_write", &options).unwrap();
        assert_eq!(template.variant.as_deref(), Some("wide"));
    }

    #[test]
    fn endianness_selects_fixed_store() {
        let library = core();
        let mut diagnostics = Diagnostics::default();
        let mut options = Options::new("test");
        options.set_value("endianness", "big", &mut diagnostics);
        assert_eq!(
            library.find("mdl_store_fixed", &options).unwrap().variant.as_deref(),
            Some("be")
        );
        options.set_value("endianness", "little", &mut diagnostics);
        assert_eq!(
            library.find("mdl_store_fixed", &options).unwrap().variant.as_deref(),
            Some("le")
        );
    }

    #[test]
    fn error_policy_selects_fail_macro() {
        let library = core();
        let options = Options::new("test");
        let template = library.find("mdl_fail", &options).unwrap();
        assert_eq!(template.kind, TemplateKind::Macro);
        assert!(template.body.contains("return -(code)"));

        let mut diagnostics = Diagnostics::default();
        let mut options = Options::new("test");
        options.set_value("error_policy", "throw", &mut diagnostics);
        assert!(library.find("mdl_fail", &options).unwrap().body.contains("throw"));

        let mut options = Options::new("test");
        options.set_value("error_policy", "abort", &mut diagnostics);
        assert!(library.find("mdl_fail", &options).unwrap().body.contains("abort"));
    }

    #[test]
    fn skip_field_depends_on_readers() {
        let library = core();
        let options = Options::new("test");
        let mut order = vec![];
        library.add_dependencies(&options, &mut order, "mdl_skip_field").unwrap();
        let skip = order.iter().position(|s| s == "mdl_skip_field").unwrap();
        let read = order.iter().position(|s| s == "mdl_vint_read").unwrap();
        let load = order.iter().position(|s| s == "mdl_load_fixed").unwrap();
        assert!(read < skip);
        assert!(load < skip);
    }
}
