mod tests {
    use proptest::prelude::*;
    use std::io::Cursor;

    use crate::codec::{decode_from, encode};
    use crate::wire::{PacketFlags, PacketHeader, DEFAULT_MAX_PAYLOAD};

    proptest! {
        // decode(encode(h, p)) == (h, p) for every valid header and
        // payload within the limit.
        #[test]
        fn encode_decode_identity(
            packet_type in 1u16..=16,
            flags in 0u16..8,
            client_id in any::<u32>(),
            seq in any::<u64>(),
            payload in proptest::collection::vec(any::<u8>(), 0..2048)
        ) {
            let mut header = PacketHeader {
                packet_type,
                flags: PacketFlags(flags),
                client_id,
                seq,
                payload_len: payload.len() as u32,
                crc32: 0,
            };
            let bytes = encode(&header, &payload);
            let mut cur = Cursor::new(bytes);
            let pkt = decode_from(&mut cur, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();

            // The decoded header carries the computed CRC; compare the rest.
            header.crc32 = pkt.header.crc32;
            prop_assert_eq!(pkt.header, header);
            prop_assert_eq!(pkt.payload, payload);
        }

        // Any single-bit flip anywhere in the frame must fail CRC (or
        // header validation, if the flip lands in magic/version).
        #[test]
        fn bit_flip_never_decodes_clean(
            seq in any::<u64>(),
            payload in proptest::collection::vec(any::<u8>(), 1..512),
            flip_bit in 0usize..64
        ) {
            let header = PacketHeader {
                packet_type: 8,
                flags: PacketFlags::empty(),
                client_id: 1,
                seq,
                payload_len: payload.len() as u32,
                crc32: 0,
            };
            let mut bytes = encode(&header, &payload);
            let bit = flip_bit % (bytes.len() * 8);
            bytes[bit / 8] ^= 1 << (bit % 8);
            let mut cur = Cursor::new(bytes);
            match decode_from(&mut cur, DEFAULT_MAX_PAYLOAD).unwrap() {
                Ok(_) => prop_assert!(false, "corrupted frame decoded"),
                Err(_) => {}
            }
        }
    }
}
