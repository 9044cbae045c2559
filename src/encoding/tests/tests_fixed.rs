//! Fixed-width integers, arrays and length-prefixed byte strings.

use crate::encoding::*;

#[test]
fn integers_are_little_endian() {
    assert_eq!(encode_to_vec(&0xDEAD_BEEFu32).unwrap(), [0xEF, 0xBE, 0xAD, 0xDE]);
    assert_eq!(
        encode_to_vec(&0x0102_0304_0506_0708u64).unwrap(),
        [0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
    );

    let (v, n) = decode_from_slice::<u64>(&[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01])
        .unwrap();
    assert_eq!(v, 0x0102_0304_0506_0708);
    assert_eq!(n, 8);
}

#[test]
fn fixed_array_has_no_length_prefix() {
    let magic: [u8; 4] = *b"TWAL";
    let bytes = encode_to_vec(&magic).unwrap();
    assert_eq!(bytes, b"TWAL");
    let (decoded, n) = decode_from_slice::<[u8; 4]>(&bytes).unwrap();
    assert_eq!(&decoded, b"TWAL");
    assert_eq!(n, 4);
}

#[test]
fn byte_string_is_length_prefixed() {
    let value = b"hello".to_vec();
    let bytes = encode_to_vec(&value).unwrap();
    assert_eq!(&bytes[..4], &5u32.to_le_bytes());
    assert_eq!(&bytes[4..], b"hello");

    let (decoded, n) = decode_from_slice::<Vec<u8>>(&bytes).unwrap();
    assert_eq!(decoded, value);
    assert_eq!(n, 9);
}

#[test]
fn slice_and_vec_encode_identically() {
    let data = [1u8, 2, 3];
    let from_slice = encode_to_vec(&&data[..]).unwrap();
    let from_vec = encode_to_vec(&data.to_vec()).unwrap();
    assert_eq!(from_slice, from_vec);
}

#[test]
fn empty_byte_string() {
    let bytes = encode_to_vec(&Vec::<u8>::new()).unwrap();
    assert_eq!(bytes, [0, 0, 0, 0]);
    let (decoded, n) = decode_from_slice::<Vec<u8>>(&bytes).unwrap();
    assert!(decoded.is_empty());
    assert_eq!(n, 4);
}

#[test]
fn sequential_decode_walks_buffer() {
    let mut buf = Vec::new();
    7u8.encode_to(&mut buf).unwrap();
    b"key".to_vec().encode_to(&mut buf).unwrap();
    42u64.encode_to(&mut buf).unwrap();

    let mut off = 0;
    let (tag, n) = u8::decode_from(&buf[off..]).unwrap();
    off += n;
    let (key, n) = Vec::<u8>::decode_from(&buf[off..]).unwrap();
    off += n;
    let (num, n) = u64::decode_from(&buf[off..]).unwrap();
    off += n;

    assert_eq!(tag, 7);
    assert_eq!(key, b"key");
    assert_eq!(num, 42);
    assert_eq!(off, buf.len());
}

#[test]
fn vec_of_structs() {
    let items: Vec<u64> = vec![3, 1, 4, 1, 5];
    let mut buf = Vec::new();
    encode_vec(&items, &mut buf).unwrap();
    assert_eq!(buf.len(), 4 + 5 * 8);

    let (decoded, n) = decode_vec::<u64>(&buf).unwrap();
    assert_eq!(decoded, items);
    assert_eq!(n, buf.len());
}
