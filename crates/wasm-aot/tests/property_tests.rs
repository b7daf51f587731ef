//! Decoder properties: LEB128 round trips against a reference encoder and
//! UTF-8 agreement with the standard library.

use proptest::prelude::*;

use wasm_aot::reader::{check_utf8, Reader};

fn encode_uleb(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out
}

fn encode_sleb(mut value: i64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let sign = byte & 0x40 != 0;
        if (value == 0 && !sign) || (value == -1 && sign) {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out
}

proptest! {
    #[test]
    fn uleb32_round_trips(value: u32) {
        let bytes = encode_uleb(u64::from(value));
        let mut r = Reader::new(&bytes);
        prop_assert_eq!(r.read_leb_u32().unwrap(), value);
        prop_assert!(r.is_empty());
    }

    #[test]
    fn uleb64_round_trips(value: u64) {
        let bytes = encode_uleb(value);
        let mut r = Reader::new(&bytes);
        prop_assert_eq!(r.read_leb_u64().unwrap(), value);
    }

    #[test]
    fn sleb32_round_trips(value: i32) {
        let bytes = encode_sleb(i64::from(value));
        let mut r = Reader::new(&bytes);
        prop_assert_eq!(r.read_leb_i32().unwrap(), value);
    }

    #[test]
    fn sleb64_round_trips(value: i64) {
        let bytes = encode_sleb(value);
        let mut r = Reader::new(&bytes);
        prop_assert_eq!(r.read_leb_i64().unwrap(), value);
    }

    #[test]
    fn uleb32_with_redundant_continuation_still_decodes(value: u32, padding in 0usize..2) {
        // Re-encode with redundant zero continuation bytes, staying within
        // the 5-byte cap.
        let mut bytes = encode_uleb(u64::from(value));
        for _ in 0..padding.min(5 - bytes.len()) {
            let last = bytes.len() - 1;
            bytes[last] |= 0x80;
            bytes.push(0x00);
        }
        let mut r = Reader::new(&bytes);
        prop_assert_eq!(r.read_leb_u32().unwrap(), value);
    }

    #[test]
    fn utf8_check_agrees_with_std(bytes: Vec<u8>) {
        let ours = check_utf8(&bytes).is_ok();
        let std_ok = std::str::from_utf8(&bytes).is_ok();
        let has_nul = bytes.contains(&0);
        if ours {
            // Anything we accept must be well-formed UTF-8 without NUL.
            prop_assert!(std_ok && !has_nul);
        }
        if std_ok && !has_nul {
            prop_assert!(ours);
        }
    }

    #[test]
    fn valid_strings_always_pass(s: String) {
        prop_assume!(!s.as_bytes().contains(&0));
        prop_assert!(check_utf8(s.as_bytes()).is_ok());
    }
}
