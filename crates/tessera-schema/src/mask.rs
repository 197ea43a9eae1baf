use bitflags::bitflags;

bitflags! {
    /// Bitset describing the kinds of wire values a schema node accepts,
    /// plus format and result-envelope markers.
    ///
    /// The high byte (bits 24..32) carries a packed format id and is not a
    /// flag; use [`TypeMask::with_format`] and [`TypeMask::format_id`] to
    /// work with it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TypeMask: u32 {
        const STRING            = 1 << 0;
        const NUMBER            = 1 << 1;
        const BOOLEAN           = 1 << 2;
        const NULL              = 1 << 3;
        const UNDEFINED         = 1 << 4;
        const OBJECT            = 1 << 5;
        const ARRAY             = 1 << 6;
        const RECORD            = 1 << 7;
        const UNION             = 1 << 8;
        const ENTITY            = 1 << 9;
        const HAS_SUB_ENTITY    = 1 << 10;
        const ID                = 1 << 11;
        const HAS_STRING_FORMAT = 1 << 12;
        const HAS_NUMBER_FORMAT = 1 << 13;
        const PARSE_RESULT      = 1 << 14;
    }
}

/// Bits that identify a concrete value kind. Exactly one of these holds for
/// any given wire value.
pub const VALUE_KINDS: TypeMask = TypeMask::STRING
    .union(TypeMask::NUMBER)
    .union(TypeMask::BOOLEAN)
    .union(TypeMask::NULL)
    .union(TypeMask::UNDEFINED)
    .union(TypeMask::OBJECT)
    .union(TypeMask::ARRAY);

const FORMAT_SHIFT: u32 = 24;
const FORMAT_BITS: u32 = 0xFF << FORMAT_SHIFT;

impl TypeMask {
    /// Packs a format id into the high byte. The id must be non-zero
    /// (zero means "no format").
    pub fn with_format(self, id: u8) -> Self {
        Self::from_bits_retain((self.bits() & !FORMAT_BITS) | ((id as u32) << FORMAT_SHIFT))
    }

    /// Unpacks the format id from the high byte, if any.
    pub fn format_id(self) -> Option<u8> {
        match (self.bits() & FORMAT_BITS) >> FORMAT_SHIFT {
            0 => None,
            id => Some(id as u8),
        }
    }

    /// The mask with format and marker bits stripped, leaving only the
    /// accepted value kinds.
    pub fn kinds(self) -> Self {
        self.intersection(VALUE_KINDS)
    }

    /// True if `kind` (a single value-kind bit) is accepted by this mask.
    pub fn accepts(self, kind: TypeMask) -> bool {
        self.intersects(kind)
    }

    /// Renders the accepted kinds for error messages, e.g. `string | null`.
    pub fn describe(self) -> String {
        let mut parts = Vec::new();
        for (bit, name) in [
            (TypeMask::STRING, "string"),
            (TypeMask::NUMBER, "number"),
            (TypeMask::BOOLEAN, "boolean"),
            (TypeMask::NULL, "null"),
            (TypeMask::UNDEFINED, "undefined"),
            (TypeMask::OBJECT, "object"),
            (TypeMask::ARRAY, "array"),
        ] {
            if self.contains(bit) {
                parts.push(name);
            }
        }
        if parts.is_empty() {
            "never".to_string()
        } else {
            parts.join(" | ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_id_roundtrip() {
        let mask = TypeMask::STRING | TypeMask::HAS_STRING_FORMAT;
        assert_eq!(mask.format_id(), None);
        let with = mask.with_format(7);
        assert_eq!(with.format_id(), Some(7));
        assert!(with.contains(TypeMask::STRING));
        assert!(with.contains(TypeMask::HAS_STRING_FORMAT));
    }

    #[test]
    fn with_format_replaces_previous_id() {
        let mask = TypeMask::NUMBER.with_format(3).with_format(9);
        assert_eq!(mask.format_id(), Some(9));
        assert_eq!(mask.kinds(), TypeMask::NUMBER);
    }

    #[test]
    fn kinds_strips_markers() {
        let mask = TypeMask::OBJECT | TypeMask::ENTITY | TypeMask::ID | TypeMask::PARSE_RESULT;
        assert_eq!(mask.kinds(), TypeMask::OBJECT);
    }

    #[test]
    fn describe_lists_kinds() {
        let mask = TypeMask::STRING | TypeMask::NULL;
        assert_eq!(mask.describe(), "string | null");
        assert_eq!(TypeMask::empty().describe(), "never");
    }
}
