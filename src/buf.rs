use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let bytes = try_get_bytes(buf)?;
    Ok(String::from_utf8(bytes)?)
}

pub fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_usize_varint(bytes.len());
    buf.put_slice(bytes);
}

pub fn try_get_bytes(buf: &mut impl Buf) -> anyhow::Result<Vec<u8>> {
    let len = buf.try_get_usize_varint()?;
    let mut result = Vec::with_capacity(len.min(4096));
    for _ in 0..len {
        result.push(buf.try_get_u8()?);
    }
    Ok(result)
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty("", vec![0])]
    #[case::hi("hi", vec![2, b'h', b'i'])]
    #[case::umlaut("zügig", vec![6, b'z', 0xc3, 0xbc, b'g', b'i', b'g'])]
    fn test_string_round_trip(#[case] s: &str, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s);
        assert_eq!(&buf, &expected);

        let mut deser_buf = &buf[..];
        let deser = try_get_string(&mut deser_buf).unwrap();
        assert!(deser_buf.is_empty());
        assert_eq!(&deser, s);
    }

    #[test]
    fn test_get_string_keeps_remainder() {
        let mut buf: &[u8] = b"\x03abcde";
        let s = try_get_string(&mut buf).unwrap();
        assert_eq!(&s, "abc");
        assert_eq!(buf, b"de");
    }

    #[test]
    fn test_get_string_truncated() {
        let mut buf: &[u8] = b"\x05ab";
        assert!(try_get_string(&mut buf).is_err());
    }

    #[test]
    fn test_get_string_invalid_utf8() {
        let mut buf: &[u8] = b"\x02\xc0\xaf";
        assert!(try_get_string(&mut buf).is_err());
    }

    #[rstest]
    #[case::empty(&[], vec![0])]
    #[case::some(&[1u8, 2, 255], vec![3, 1, 2, 255])]
    fn test_bytes_round_trip(#[case] bytes: &[u8], #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        put_bytes(&mut buf, bytes);
        assert_eq!(&buf, &expected);

        let mut deser_buf = &buf[..];
        let deser = try_get_bytes(&mut deser_buf).unwrap();
        assert!(deser_buf.is_empty());
        assert_eq!(&deser, bytes);
    }
}
