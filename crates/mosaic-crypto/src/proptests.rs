mod tests {
    use proptest::prelude::*;

    use crate::identity::EphemeralKey;
    use crate::session::{derive_session, Direction, OpenKey, SealKey};
    use crate::transcript::Transcript;

    proptest! {
        // open(seal(p)) == p, and any bit flip in ciphertext or AAD
        // fails authentication.
        #[test]
        fn seal_open_round_trip(
            key in any::<[u8; 32]>(),
            seq in 1u64..u64::MAX,
            aad in proptest::collection::vec(any::<u8>(), 0..64),
            plaintext in proptest::collection::vec(any::<u8>(), 0..512)
        ) {
            let seal = SealKey::new(&key, Direction::ClientToServer);
            let mut open = OpenKey::new(&key, Direction::ClientToServer);
            let ct = seal.seal(seq, &aad, &plaintext).unwrap();
            let pt = open.open(seq, &aad, &ct).unwrap();
            prop_assert_eq!(&pt[..], plaintext.as_slice());
        }

        #[test]
        fn ciphertext_bit_flip_fails(
            key in any::<[u8; 32]>(),
            plaintext in proptest::collection::vec(any::<u8>(), 1..256),
            flip in any::<usize>()
        ) {
            let seal = SealKey::new(&key, Direction::ClientToServer);
            let mut open = OpenKey::new(&key, Direction::ClientToServer);
            let mut ct = seal.seal(7, b"aad", &plaintext).unwrap();
            let bit = flip % (ct.len() * 8);
            ct[bit / 8] ^= 1 << (bit % 8);
            prop_assert!(open.open(7, b"aad", &ct).is_err());
        }

        #[test]
        fn aad_change_fails(
            key in any::<[u8; 32]>(),
            aad in proptest::collection::vec(any::<u8>(), 1..64),
            flip in any::<usize>()
        ) {
            let seal = SealKey::new(&key, Direction::ClientToServer);
            let mut open = OpenKey::new(&key, Direction::ClientToServer);
            let ct = seal.seal(3, &aad, b"payload").unwrap();
            let mut bad = aad.clone();
            let bit = flip % (bad.len() * 8);
            bad[bit / 8] ^= 1 << (bit % 8);
            prop_assert!(open.open(3, &bad, &ct).is_err());
        }

        // Key agreement and derivation are symmetric between the peers.
        #[test]
        fn both_sides_derive_the_same_keys(
            seed_a in any::<[u8; 32]>(),
            seed_b in any::<[u8; 32]>(),
            transcript_data in proptest::collection::vec(any::<u8>(), 0..128)
        ) {
            let a = EphemeralKey::from_bytes(seed_a);
            let b = EphemeralKey::from_bytes(seed_b);
            let mut t = Transcript::new("mosaic hs v1");
            t.append_bytes(1, &transcript_data);
            let th = t.hash();

            let ka = derive_session(&a.diffie_hellman(&b.public_key()), &th);
            let kb = derive_session(&b.diffie_hellman(&a.public_key()), &th);
            prop_assert_eq!(ka.c2s, kb.c2s);
            prop_assert_eq!(ka.s2c, kb.s2c);
        }
    }
}
