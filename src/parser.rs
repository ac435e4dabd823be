// Declarative positional parser for pool account data
//
// DEX pool state is laid out like a C struct: every field sits at a fixed
// offset, so a decoder is just an ordered schema of (spec, name) entries
// walked over the raw bytes. All integers are little-endian; signed variants
// are two's complement; a pubkey is 32 bytes rendered as base58.
//
// A read past the end of the buffer fails the entire decode.

use std::collections::HashMap;

/// One schema entry: skip a fixed number of bytes, or decode a typed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSpec {
    /// Advance the cursor without decoding. The entry's name is ignored.
    Skip(usize),
    U8,
    Bool,
    U16,
    /// 3-byte unsigned integer, widened to u32.
    U24,
    U32,
    I32,
    U64,
    I64,
    U128,
    /// 32 bytes, base58-encoded.
    Pubkey,
}

/// A decoded field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    U8(u8),
    Bool(bool),
    U16(u16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    U128(u128),
    Pubkey(String),
}

impl FieldValue {
    pub fn as_u8(&self) -> Option<u8> {
        match self {
            FieldValue::U8(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        match self {
            FieldValue::U16(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            FieldValue::U32(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            FieldValue::I32(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::U64(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::I64(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_u128(&self) -> Option<u128> {
        match self {
            FieldValue::U128(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_pubkey(&self) -> Option<String> {
        match self {
            FieldValue::Pubkey(value) => Some(value.clone()),
            _ => None,
        }
    }
}

/// Cursor over a raw account buffer. Pure; owns no I/O.
pub struct AccountParser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> AccountParser<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Walk the schema in order, returning the decoded fields by name.
    ///
    /// Returns `None` if any entry would read past the buffer; a truncated
    /// account never yields a partial result.
    pub fn read(
        mut self,
        schema: &[(FieldSpec, &'static str)],
    ) -> Option<HashMap<&'static str, FieldValue>> {
        let mut fields = HashMap::with_capacity(schema.len());
        for (spec, name) in schema {
            match spec {
                FieldSpec::Skip(len) => {
                    self.take(*len)?;
                }
                FieldSpec::U8 => {
                    let bytes = self.take(1)?;
                    fields.insert(*name, FieldValue::U8(bytes[0]));
                }
                FieldSpec::Bool => {
                    let bytes = self.take(1)?;
                    fields.insert(*name, FieldValue::Bool(bytes[0] != 0));
                }
                FieldSpec::U16 => {
                    let bytes = self.take(2)?;
                    fields.insert(*name, FieldValue::U16(u16::from_le_bytes(bytes.try_into().ok()?)));
                }
                FieldSpec::U24 => {
                    let bytes = self.take(3)?;
                    let value = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]);
                    fields.insert(*name, FieldValue::U32(value));
                }
                FieldSpec::U32 => {
                    let bytes = self.take(4)?;
                    fields.insert(*name, FieldValue::U32(u32::from_le_bytes(bytes.try_into().ok()?)));
                }
                FieldSpec::I32 => {
                    let bytes = self.take(4)?;
                    fields.insert(*name, FieldValue::I32(i32::from_le_bytes(bytes.try_into().ok()?)));
                }
                FieldSpec::U64 => {
                    let bytes = self.take(8)?;
                    fields.insert(*name, FieldValue::U64(u64::from_le_bytes(bytes.try_into().ok()?)));
                }
                FieldSpec::I64 => {
                    let bytes = self.take(8)?;
                    fields.insert(*name, FieldValue::I64(i64::from_le_bytes(bytes.try_into().ok()?)));
                }
                FieldSpec::U128 => {
                    let bytes = self.take(16)?;
                    fields.insert(
                        *name,
                        FieldValue::U128(u128::from_le_bytes(bytes.try_into().ok()?)),
                    );
                }
                FieldSpec::Pubkey => {
                    let bytes = self.take(32)?;
                    fields.insert(*name, FieldValue::Pubkey(bs58::encode(bytes).into_string()));
                }
            }
        }
        Some(fields)
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        if end > self.data.len() {
            return None;
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Some(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsigned_round_trips() {
        let mut data = Vec::new();
        data.push(0xabu8);
        data.extend_from_slice(&0xbeefu16.to_le_bytes());
        data.extend_from_slice(&0xc0ffeeu32.to_le_bytes()[..3]);
        data.extend_from_slice(&0xdeadbeefu32.to_le_bytes());
        data.extend_from_slice(&0x0123456789abcdefu64.to_le_bytes());
        data.extend_from_slice(&0xfedcba9876543210_0123456789abcdefu128.to_le_bytes());

        let fields = AccountParser::new(&data)
            .read(&[
                (FieldSpec::U8, "a"),
                (FieldSpec::U16, "b"),
                (FieldSpec::U24, "c"),
                (FieldSpec::U32, "d"),
                (FieldSpec::U64, "e"),
                (FieldSpec::U128, "f"),
            ])
            .unwrap();

        assert_eq!(fields["a"].as_u8(), Some(0xab));
        assert_eq!(fields["b"].as_u16(), Some(0xbeef));
        assert_eq!(fields["c"].as_u32(), Some(0xc0ffee));
        assert_eq!(fields["d"].as_u32(), Some(0xdeadbeef));
        assert_eq!(fields["e"].as_u64(), Some(0x0123456789abcdef));
        assert_eq!(fields["f"].as_u128(), Some(0xfedcba9876543210_0123456789abcdefu128));
    }

    #[test]
    fn test_signed_round_trips() {
        let mut data = Vec::new();
        data.extend_from_slice(&(-1234567i32).to_le_bytes());
        data.extend_from_slice(&(-987654321i64).to_le_bytes());

        let fields = AccountParser::new(&data)
            .read(&[(FieldSpec::I32, "a"), (FieldSpec::I64, "b")])
            .unwrap();

        assert_eq!(fields["a"].as_i32(), Some(-1234567));
        assert_eq!(fields["b"].as_i64(), Some(-987654321));
    }

    #[test]
    fn test_bool_and_pubkey() {
        let mut data = vec![1u8, 0u8];
        data.extend_from_slice(&[7u8; 32]);

        let fields = AccountParser::new(&data)
            .read(&[
                (FieldSpec::Bool, "yes"),
                (FieldSpec::Bool, "no"),
                (FieldSpec::Pubkey, "key"),
            ])
            .unwrap();

        assert_eq!(fields["yes"].as_bool(), Some(true));
        assert_eq!(fields["no"].as_bool(), Some(false));
        assert_eq!(
            fields["key"].as_pubkey(),
            Some(bs58::encode([7u8; 32]).into_string())
        );
    }

    #[test]
    fn test_typed_accessor_mismatch_is_none() {
        let data = 42u64.to_le_bytes();
        let fields = AccountParser::new(&data).read(&[(FieldSpec::U64, "value")]).unwrap();

        assert_eq!(fields["value"].as_u64(), Some(42));
        assert_eq!(fields["value"].as_u32(), None);
        assert_eq!(fields["value"].as_pubkey(), None);
    }

    #[test]
    fn test_skip_advances_cursor() {
        let mut data = vec![0u8; 10];
        data.extend_from_slice(&42u64.to_le_bytes());

        let fields = AccountParser::new(&data)
            .read(&[(FieldSpec::Skip(10), "padding"), (FieldSpec::U64, "value")])
            .unwrap();

        assert_eq!(fields["value"].as_u64(), Some(42));
        assert!(!fields.contains_key("padding"));
    }

    #[test]
    fn test_overrun_fails_whole_decode() {
        let data = vec![0u8; 7];
        let result = AccountParser::new(&data).read(&[(FieldSpec::U64, "value")]);
        assert!(result.is_none());

        // A skip past the end fails too, even if nothing else would be read.
        let result = AccountParser::new(&data).read(&[(FieldSpec::Skip(8), "padding")]);
        assert!(result.is_none());

        // Earlier fields do not leak out of a failed decode.
        let result = AccountParser::new(&data).read(&[
            (FieldSpec::U32, "ok"),
            (FieldSpec::U64, "too_far"),
        ]);
        assert!(result.is_none());
    }

    #[test]
    fn test_empty_buffer_zero_length_schema() {
        let fields = AccountParser::new(&[]).read(&[]).unwrap();
        assert!(fields.is_empty());
    }
}
