//! Minimal DEX reader producing one content hash per class
//!
//! Only the pieces needed for change detection are decoded: the string, type,
//! proto, field and method tables, `class_def_item`s with their interfaces,
//! annotations and static values, `class_data_item`s and the `code_item`s
//! they reference. Table indices are resolved to names before hashing so a
//! change in one class does not shift the hash of another. Instruction
//! operands are hashed as written.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use droidswap_core::prelude::*;

pub const DEX_MAGIC_PREFIX: &[u8; 4] = b"dex\n";
pub const HEADER_SIZE: usize = 0x70;
pub const NO_INDEX: u32 = 0xffff_ffff;

pub const CLASS_DEF_SIZE: usize = 32;
pub const CODE_ITEM_HEADER: usize = 16;
pub const PROTO_ID_SIZE: usize = 12;
pub const MEMBER_ID_SIZE: usize = 8;

// encoded_value types
pub const VALUE_BYTE: u8 = 0x00;
pub const VALUE_INT: u8 = 0x04;
pub const VALUE_STRING: u8 = 0x17;
pub const VALUE_TYPE: u8 = 0x18;
pub const VALUE_FIELD: u8 = 0x19;
pub const VALUE_METHOD: u8 = 0x1a;
pub const VALUE_ENUM: u8 = 0x1b;
pub const VALUE_ARRAY: u8 = 0x1c;
pub const VALUE_ANNOTATION: u8 = 0x1d;
pub const VALUE_NULL: u8 = 0x1e;
pub const VALUE_BOOLEAN: u8 = 0x1f;

/// Nesting limit for arrays and annotations inside encoded values
const MAX_VALUE_DEPTH: usize = 32;

/// Per-class hashes of one dex file, keyed by descriptor (`Lcom/example/Foo;`)
pub type ClassHashes = BTreeMap<String, String>;

/// Bounds-checked little-endian reader over a dex image
struct DexCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DexCursor<'a> {
    fn at(data: &'a [u8], pos: usize) -> Result<Self> {
        if pos > data.len() {
            return Err(Error::malformed_dex(format!(
                "offset {:#x} is past the end of the file ({:#x})",
                pos,
                data.len()
            )));
        }
        Ok(Self { data, pos })
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                Error::malformed_dex(format!("read of {} bytes at {:#x} overflows", len, self.pos))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn uleb128(&mut self) -> Result<u32> {
        let mut result: u32 = 0;
        for i in 0..5 {
            let byte = self.u8()?;
            result |= u32::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(Error::malformed_dex(format!(
            "uleb128 at {:#x} is longer than 5 bytes",
            self.pos
        )))
    }

    /// Zero-extended unsigned value of `len` bytes, as used by index values
    fn index(&mut self, len: usize) -> Result<u32> {
        if len > 4 {
            return Err(Error::malformed_dex(format!(
                "index value of {} bytes at {:#x}",
                len, self.pos
            )));
        }
        Ok(self
            .bytes(len)?
            .iter()
            .rev()
            .fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
    }
}

/// Length-delimited update so adjacent fields cannot run into each other
fn feed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u32).to_le_bytes());
    hasher.update(bytes);
}

/// Section offsets from the dex header
#[derive(Debug, Clone, Copy)]
struct Header {
    string_ids_size: u32,
    string_ids_off: u32,
    type_ids_size: u32,
    type_ids_off: u32,
    proto_ids_size: u32,
    proto_ids_off: u32,
    field_ids_size: u32,
    field_ids_off: u32,
    method_ids_size: u32,
    method_ids_off: u32,
    class_defs_size: u32,
    class_defs_off: u32,
}

fn read_header(data: &[u8]) -> Result<Header> {
    if data.len() < HEADER_SIZE || &data[0..4] != DEX_MAGIC_PREFIX {
        return Err(Error::malformed_dex("missing dex magic"));
    }

    let field = |off: usize| -> Result<u32> { DexCursor::at(data, off)?.u32() };

    Ok(Header {
        string_ids_size: field(0x38)?,
        string_ids_off: field(0x3c)?,
        type_ids_size: field(0x40)?,
        type_ids_off: field(0x44)?,
        proto_ids_size: field(0x48)?,
        proto_ids_off: field(0x4c)?,
        field_ids_size: field(0x50)?,
        field_ids_off: field(0x54)?,
        method_ids_size: field(0x58)?,
        method_ids_off: field(0x5c)?,
        class_defs_size: field(0x60)?,
        class_defs_off: field(0x64)?,
    })
}

fn check_index(kind: &str, idx: u32, size: u32) -> Result<()> {
    if idx >= size {
        return Err(Error::malformed_dex(format!(
            "{} index {} out of range",
            kind, idx
        )));
    }
    Ok(())
}

/// Parsed view of a dex file
pub struct DexFile<'a> {
    data: &'a [u8],
    header: Header,
}

impl<'a> DexFile<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let header = read_header(data)?;
        Ok(Self { data, header })
    }

    pub fn class_count(&self) -> u32 {
        self.header.class_defs_size
    }

    fn cursor(&self, off: usize) -> Result<DexCursor<'a>> {
        DexCursor::at(self.data, off)
    }

    fn string(&self, idx: u32) -> Result<String> {
        check_index("string", idx, self.header.string_ids_size)?;
        let id_off = self.header.string_ids_off as usize + idx as usize * 4;
        let data_off = self.cursor(id_off)?.u32()? as usize;

        let mut cursor = self.cursor(data_off)?;
        let _utf16_len = cursor.uleb128()?;
        let start = cursor.pos;
        let end = self.data[start..]
            .iter()
            .position(|b| *b == 0)
            .map(|n| start + n)
            .ok_or_else(|| Error::malformed_dex("unterminated string"))?;

        // MUTF-8; descriptors are ASCII in practice
        Ok(String::from_utf8_lossy(&self.data[start..end]).into_owned())
    }

    fn type_descriptor(&self, idx: u32) -> Result<String> {
        check_index("type", idx, self.header.type_ids_size)?;
        let off = self.header.type_ids_off as usize + idx as usize * 4;
        let string_idx = self.cursor(off)?.u32()?;
        self.string(string_idx)
    }

    fn type_list(&self, off: u32) -> Result<Vec<String>> {
        if off == 0 {
            return Ok(Vec::new());
        }
        let mut cursor = self.cursor(off as usize)?;
        let size = cursor.u32()?;
        (0..size)
            .map(|_| {
                let idx = cursor.u16()?;
                self.type_descriptor(u32::from(idx))
            })
            .collect()
    }

    /// `Lcom/example/Foo;->name:I`
    fn field_ref(&self, idx: u32) -> Result<String> {
        check_index("field", idx, self.header.field_ids_size)?;
        let mut cursor =
            self.cursor(self.header.field_ids_off as usize + idx as usize * MEMBER_ID_SIZE)?;
        let class = self.type_descriptor(u32::from(cursor.u16()?))?;
        let ty = self.type_descriptor(u32::from(cursor.u16()?))?;
        let name = self.string(cursor.u32()?)?;
        Ok(format!("{}->{}:{}", class, name, ty))
    }

    /// `Lcom/example/Foo;->name(ILjava/lang/String;)V`
    fn method_ref(&self, idx: u32) -> Result<String> {
        check_index("method", idx, self.header.method_ids_size)?;
        let mut cursor =
            self.cursor(self.header.method_ids_off as usize + idx as usize * MEMBER_ID_SIZE)?;
        let class = self.type_descriptor(u32::from(cursor.u16()?))?;
        let proto_idx = u32::from(cursor.u16()?);
        let name = self.string(cursor.u32()?)?;

        check_index("proto", proto_idx, self.header.proto_ids_size)?;
        let mut proto =
            self.cursor(self.header.proto_ids_off as usize + proto_idx as usize * PROTO_ID_SIZE)?;
        let _shorty_idx = proto.u32()?;
        let return_type = self.type_descriptor(proto.u32()?)?;
        let parameters = self.type_list(proto.u32()?)?;

        Ok(format!(
            "{}->{}({}){}",
            class,
            name,
            parameters.concat(),
            return_type
        ))
    }

    /// Hash every class defined in this file
    pub fn class_hashes(&self) -> Result<ClassHashes> {
        let mut hashes = ClassHashes::new();

        for i in 0..self.header.class_defs_size as usize {
            let off = self.header.class_defs_off as usize + i * CLASS_DEF_SIZE;
            let mut def = self.cursor(off)?;

            let class_idx = def.u32()?;
            let access_flags = def.u32()?;
            let superclass_idx = def.u32()?;
            let interfaces_off = def.u32()?;
            let _source_file_idx = def.u32()?;
            let annotations_off = def.u32()?;
            let class_data_off = def.u32()?;
            let static_values_off = def.u32()?;

            let descriptor = self.type_descriptor(class_idx)?;

            let mut hasher = Sha256::new();
            feed(&mut hasher, descriptor.as_bytes());
            hasher.update(access_flags.to_le_bytes());
            if superclass_idx != NO_INDEX {
                feed(&mut hasher, self.type_descriptor(superclass_idx)?.as_bytes());
            }

            let interfaces = self.type_list(interfaces_off)?;
            hasher.update((interfaces.len() as u32).to_le_bytes());
            for interface in &interfaces {
                feed(&mut hasher, interface.as_bytes());
            }

            hasher.update(b"data");
            if class_data_off != 0 {
                self.hash_class_data(class_data_off as usize, &mut hasher)?;
            }
            hasher.update(b"static");
            if static_values_off != 0 {
                let mut cursor = self.cursor(static_values_off as usize)?;
                self.hash_encoded_array(&mut cursor, &mut hasher, 0)?;
            }
            hasher.update(b"annotations");
            if annotations_off != 0 {
                self.hash_annotations_directory(annotations_off as usize, &mut hasher)?;
            }

            hashes.insert(descriptor, hex::encode(hasher.finalize()));
        }

        Ok(hashes)
    }

    /// Feed members and method bodies into `hasher`. File offsets are left
    /// out so that unrelated classes moving around do not change the hash.
    fn hash_class_data(&self, off: usize, hasher: &mut Sha256) -> Result<()> {
        let mut cursor = self.cursor(off)?;
        let static_fields = cursor.uleb128()?;
        let instance_fields = cursor.uleb128()?;
        let direct_methods = cursor.uleb128()?;
        let virtual_methods = cursor.uleb128()?;

        for count in [static_fields, instance_fields, direct_methods, virtual_methods] {
            hasher.update(count.to_le_bytes());
        }

        for count in [static_fields, instance_fields] {
            // indices are diff-encoded from the start of each list
            let mut field_idx = 0u32;
            for _ in 0..count {
                field_idx = field_idx.wrapping_add(cursor.uleb128()?);
                let access_flags = cursor.uleb128()?;
                feed(hasher, self.field_ref(field_idx)?.as_bytes());
                hasher.update(access_flags.to_le_bytes());
            }
        }

        for count in [direct_methods, virtual_methods] {
            let mut method_idx = 0u32;
            for _ in 0..count {
                method_idx = method_idx.wrapping_add(cursor.uleb128()?);
                let access_flags = cursor.uleb128()?;
                let code_off = cursor.uleb128()?;
                feed(hasher, self.method_ref(method_idx)?.as_bytes());
                hasher.update(access_flags.to_le_bytes());
                if code_off != 0 {
                    self.hash_code(code_off as usize, hasher)?;
                }
            }
        }

        Ok(())
    }

    fn hash_code(&self, off: usize, hasher: &mut Sha256) -> Result<()> {
        let mut cursor = self.cursor(off)?;
        let registers = cursor.u16()?;
        let ins = cursor.u16()?;
        let outs = cursor.u16()?;
        let tries = cursor.u16()?;
        let _debug_info_off = cursor.u32()?;
        let insns_size = cursor.u32()?;

        for value in [registers, ins, outs, tries] {
            hasher.update(value.to_le_bytes());
        }
        let insns_len = (insns_size as usize)
            .checked_mul(2)
            .ok_or_else(|| Error::malformed_dex("code item too large"))?;
        feed(hasher, cursor.bytes(insns_len)?);
        Ok(())
    }

    fn hash_encoded_array(
        &self,
        cursor: &mut DexCursor<'a>,
        hasher: &mut Sha256,
        depth: usize,
    ) -> Result<()> {
        let size = cursor.uleb128()?;
        hasher.update(size.to_le_bytes());
        for _ in 0..size {
            self.hash_encoded_value(cursor, hasher, depth)?;
        }
        Ok(())
    }

    fn hash_encoded_annotation(
        &self,
        cursor: &mut DexCursor<'a>,
        hasher: &mut Sha256,
        depth: usize,
    ) -> Result<()> {
        let type_idx = cursor.uleb128()?;
        feed(hasher, self.type_descriptor(type_idx)?.as_bytes());
        let size = cursor.uleb128()?;
        hasher.update(size.to_le_bytes());
        for _ in 0..size {
            let name_idx = cursor.uleb128()?;
            feed(hasher, self.string(name_idx)?.as_bytes());
            self.hash_encoded_value(cursor, hasher, depth)?;
        }
        Ok(())
    }

    fn hash_encoded_value(
        &self,
        cursor: &mut DexCursor<'a>,
        hasher: &mut Sha256,
        depth: usize,
    ) -> Result<()> {
        if depth > MAX_VALUE_DEPTH {
            return Err(Error::malformed_dex("encoded values nested too deeply"));
        }

        let header = cursor.u8()?;
        let value_type = header & 0x1f;
        let arg = usize::from(header >> 5);
        hasher.update([value_type]);

        match value_type {
            VALUE_STRING => {
                let idx = cursor.index(arg + 1)?;
                feed(hasher, self.string(idx)?.as_bytes());
            }
            VALUE_TYPE => {
                let idx = cursor.index(arg + 1)?;
                feed(hasher, self.type_descriptor(idx)?.as_bytes());
            }
            VALUE_FIELD | VALUE_ENUM => {
                let idx = cursor.index(arg + 1)?;
                feed(hasher, self.field_ref(idx)?.as_bytes());
            }
            VALUE_METHOD => {
                let idx = cursor.index(arg + 1)?;
                feed(hasher, self.method_ref(idx)?.as_bytes());
            }
            VALUE_ARRAY => self.hash_encoded_array(cursor, hasher, depth + 1)?,
            VALUE_ANNOTATION => self.hash_encoded_annotation(cursor, hasher, depth + 1)?,
            VALUE_NULL => {}
            VALUE_BOOLEAN => hasher.update([arg as u8]),
            // byte, short, char, int, long, float, double, method type, method handle
            VALUE_BYTE | 0x02 | 0x03 | VALUE_INT | 0x06 | 0x10 | 0x11 | 0x15 | 0x16 => {
                feed(hasher, cursor.bytes(arg + 1)?);
            }
            other => {
                return Err(Error::malformed_dex(format!(
                    "unknown encoded value type {:#x} at {:#x}",
                    other,
                    cursor.pos - 1
                )))
            }
        }
        Ok(())
    }

    fn hash_annotation_set(&self, off: u32, hasher: &mut Sha256) -> Result<()> {
        if off == 0 {
            hasher.update([0u8]);
            return Ok(());
        }
        let mut set = self.cursor(off as usize)?;
        let size = set.u32()?;
        hasher.update(size.to_le_bytes());
        for _ in 0..size {
            let item_off = set.u32()?;
            let mut item = self.cursor(item_off as usize)?;
            let visibility = item.u8()?;
            hasher.update([visibility]);
            self.hash_encoded_annotation(&mut item, hasher, 0)?;
        }
        Ok(())
    }

    fn hash_annotations_directory(&self, off: usize, hasher: &mut Sha256) -> Result<()> {
        let mut dir = self.cursor(off)?;
        let class_annotations_off = dir.u32()?;
        let fields_size = dir.u32()?;
        let methods_size = dir.u32()?;
        let parameters_size = dir.u32()?;

        self.hash_annotation_set(class_annotations_off, hasher)?;

        hasher.update(fields_size.to_le_bytes());
        for _ in 0..fields_size {
            let field_idx = dir.u32()?;
            let set_off = dir.u32()?;
            feed(hasher, self.field_ref(field_idx)?.as_bytes());
            self.hash_annotation_set(set_off, hasher)?;
        }

        hasher.update(methods_size.to_le_bytes());
        for _ in 0..methods_size {
            let method_idx = dir.u32()?;
            let set_off = dir.u32()?;
            feed(hasher, self.method_ref(method_idx)?.as_bytes());
            self.hash_annotation_set(set_off, hasher)?;
        }

        hasher.update(parameters_size.to_le_bytes());
        for _ in 0..parameters_size {
            let method_idx = dir.u32()?;
            let list_off = dir.u32()?;
            feed(hasher, self.method_ref(method_idx)?.as_bytes());
            if list_off == 0 {
                continue;
            }
            let mut list = self.cursor(list_off as usize)?;
            let size = list.u32()?;
            hasher.update(size.to_le_bytes());
            for _ in 0..size {
                let set_off = list.u32()?;
                self.hash_annotation_set(set_off, hasher)?;
            }
        }
        Ok(())
    }
}

/// Hash every class of a dex image
pub fn class_hashes(data: &[u8]) -> Result<ClassHashes> {
    DexFile::parse(data)?.class_hashes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::DexBuilder;

    #[test]
    fn test_hashes_every_class() {
        let dex = DexBuilder::new()
            .class("Lcom/example/MainActivity;", &[&[0x0e00]])
            .class("Lcom/example/Util;", &[&[0x1200, 0x0f00], &[0x0e00]])
            .build();

        let hashes = class_hashes(&dex).unwrap();
        assert_eq!(hashes.len(), 2);
        assert!(hashes.contains_key("Lcom/example/MainActivity;"));
        assert_eq!(hashes["Lcom/example/Util;"].len(), 64);
    }

    #[test]
    fn test_code_change_changes_only_that_class() {
        let before = DexBuilder::new()
            .class("Lcom/example/A;", &[&[0x0e00]])
            .class("Lcom/example/B;", &[&[0x0e00]])
            .build();
        let after = DexBuilder::new()
            .class("Lcom/example/A;", &[&[0x1210, 0x0f00]])
            .class("Lcom/example/B;", &[&[0x0e00]])
            .build();

        let before = class_hashes(&before).unwrap();
        let after = class_hashes(&after).unwrap();
        assert_ne!(before["Lcom/example/A;"], after["Lcom/example/A;"]);
        assert_eq!(before["Lcom/example/B;"], after["Lcom/example/B;"]);
    }

    fn config_class(value: u8) -> DexBuilder {
        DexBuilder::new()
            .class("Lcom/example/Config;", &[&[0x0e00]])
            .static_field("TIMEOUT", "I")
            .static_values(&[0x01, VALUE_INT, value])
            .class("Lcom/example/Other;", &[&[0x0e00]])
    }

    #[test]
    fn test_static_value_change_changes_class_hash() {
        let before = class_hashes(&config_class(1).build()).unwrap();
        let after = class_hashes(&config_class(2).build()).unwrap();

        assert_ne!(before["Lcom/example/Config;"], after["Lcom/example/Config;"]);
        assert_eq!(before["Lcom/example/Other;"], after["Lcom/example/Other;"]);
    }

    #[test]
    fn test_interfaces_and_annotations_are_hashed() {
        let plain = DexBuilder::new().class("Lcom/example/Task;", &[&[0x0e00]]);
        let runnable = plain.clone().interface("Ljava/lang/Runnable;");
        let annotated = plain.clone().annotation("Lkotlin/Metadata;");

        let plain = class_hashes(&plain.build()).unwrap();
        let runnable = class_hashes(&runnable.build()).unwrap();
        let annotated = class_hashes(&annotated.build()).unwrap();

        let key = "Lcom/example/Task;";
        assert_ne!(plain[key], runnable[key]);
        assert_ne!(plain[key], annotated[key]);
        assert_ne!(runnable[key], annotated[key]);
    }

    #[test]
    fn test_new_class_does_not_shift_other_hashes() {
        let before = DexBuilder::new()
            .class("Lcom/example/B;", &[&[0x0e00], &[0x1200, 0x0f00]])
            .static_field("NAME", "Ljava/lang/String;")
            .interface("Ljava/io/Serializable;");
        let after = DexBuilder::new()
            .class("Lcom/example/A;", &[&[0x0e00]])
            .static_field("COUNT", "I")
            .class("Lcom/example/B;", &[&[0x0e00], &[0x1200, 0x0f00]])
            .static_field("NAME", "Ljava/lang/String;")
            .interface("Ljava/io/Serializable;");

        let before = class_hashes(&before.build()).unwrap();
        let after = class_hashes(&after.build()).unwrap();
        assert_eq!(before["Lcom/example/B;"], after["Lcom/example/B;"]);
    }

    #[test]
    fn test_unknown_encoded_value_is_error() {
        let dex = DexBuilder::new()
            .class("Lcom/example/Config;", &[])
            .static_field("X", "I")
            .static_values(&[0x01, 0x07])
            .build();
        assert!(matches!(
            class_hashes(&dex).unwrap_err(),
            Error::MalformedDex { .. }
        ));
    }

    #[test]
    fn test_rejects_non_dex() {
        let err = class_hashes(b"PK\x03\x04 not a dex file at all").unwrap_err();
        assert!(matches!(err, Error::MalformedDex { .. }));
    }

    #[test]
    fn test_truncated_dex_is_error() {
        let dex = DexBuilder::new()
            .class("Lcom/example/A;", &[&[0x0e00]])
            .build();
        let truncated = &dex[..dex.len() - 8];
        assert!(class_hashes(truncated).is_err());
    }

    #[test]
    fn test_uleb128() {
        let data = [0xe5, 0x8e, 0x26];
        let mut cursor = DexCursor::at(&data, 0).unwrap();
        assert_eq!(cursor.uleb128().unwrap(), 624485);
    }
}
