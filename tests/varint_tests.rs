use mc_scan_rs::varint::{decode, encode, encoded, encoding_length, VarIntError};

#[test]
fn known_wire_encodings() {
    assert_eq!(encoded(300), vec![0xAC, 0x02]);
    assert_eq!(encoded(0), vec![0x00]);
    assert_eq!(encoded(2_147_483_647), vec![0xFF, 0xFF, 0xFF, 0xFF, 0x07]);
}

#[test]
fn round_trip_across_width_boundaries() {
    // every 7-bit width boundary plus neighbours
    let mut samples = vec![0i32, 1, i32::MAX];
    for shift in [7u32, 14, 21, 28] {
        let edge = 1i32 << shift;
        samples.extend([edge - 1, edge, edge + 1]);
    }
    for n in samples {
        let bytes = encoded(n);
        assert_eq!(bytes.len(), encoding_length(n), "length for {n}");
        assert_eq!(decode(&bytes, 0).unwrap(), (n, bytes.len()), "value {n}");
    }
}

#[test]
fn decode_mid_buffer() {
    let mut buf = Vec::new();
    encode(25565, &mut buf);
    let prefix = buf.len();
    encode(300, &mut buf);
    assert_eq!(decode(&buf, 0).unwrap(), (25565, prefix));
    assert_eq!(decode(&buf, prefix).unwrap(), (300, 2));
}

#[test]
fn truncated_input_is_incomplete() {
    let bytes = encoded(2_147_483_647);
    for cut in 0..bytes.len() {
        assert_eq!(decode(&bytes[..cut], 0), Err(VarIntError::Incomplete));
    }
}
