// Length-delimited size arithmetic for the subset of the protocol we batch by.

/// Number of bytes needed to encode `value` as a base-128 varint.
///
/// ```
/// use pubsub_wire::varint_len;
///
/// assert_eq!(varint_len(0), 1);
/// assert_eq!(varint_len(127), 1);
/// assert_eq!(varint_len(128), 2);
/// ```
pub fn varint_len(value: u64) -> usize {
    // Each byte carries seven payload bits.
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

fn tag_len(field: u32) -> usize {
    varint_len(u64::from(field) << 3)
}

/// Size of a length-delimited field (tag, length prefix and body).
///
/// Always emitted, even for an empty body, which is how repeated and map
/// entries behave.
pub fn length_delimited_len(field: u32, body_len: usize) -> usize {
    tag_len(field) + varint_len(body_len as u64) + body_len
}

/// Size of a singular string/bytes field; empty values are not encoded.
pub(crate) fn bytes_field_len(field: u32, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    length_delimited_len(field, len)
}

/// Size of a singular varint field; zero values are not encoded.
pub(crate) fn varint_field_len(field: u32, value: u64) -> usize {
    if value == 0 {
        return 0;
    }
    tag_len(field) + varint_len(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_boundaries() {
        assert_eq!(varint_len(16_383), 2);
        assert_eq!(varint_len(16_384), 3);
        assert_eq!(varint_len(u64::MAX), 10);
    }

    #[test]
    fn empty_singular_fields_are_free() {
        assert_eq!(bytes_field_len(1, 0), 0);
        assert_eq!(varint_field_len(2, 0), 0);
        assert_eq!(length_delimited_len(2, 0), 2);
    }

    #[test]
    fn large_field_numbers_need_wider_tags() {
        assert_eq!(tag_len(15), 1);
        assert_eq!(tag_len(16), 2);
    }
}
