//! Short token codec.
//!
//! Maps a non-negative integer to a short, URL-safe, case-sensitive string
//! and back. The first path segment of every stored object (`token/filename`)
//! is produced here.
//!
//! Tokens are not unguessable by construction: guess resistance comes from
//! drawing the source integer from a wide random range, which [`generate`] does.

use rand::Rng;

/// Fixed symbol table, most significant symbol first when encoding.
///
/// Lowercase `t` and uppercase `W` are not part of the table.
pub const SYMBOLS: &str = "0123456789abcdefghijklmnopqrsuvwxyzABCDEFGHIJKLMNOPQRSTUVXYZ";

/// Number of symbols, the radix of the encoding.
pub const BASE: u64 = SYMBOLS.len() as u64;

/// Longest token whose value range still fits in a `u64`.
pub const MAX_GENERATED_LEN: u32 = 10;

/// Encodes `number` in the symbol alphabet, without leading-zero padding.
///
/// `0` encodes to the first symbol.
#[must_use]
pub fn encode(mut number: u64) -> String {
    let symbols = SYMBOLS.as_bytes();
    let mut digits = Vec::new();
    loop {
        // `number % BASE` is always below the table length.
        #[allow(clippy::cast_possible_truncation)]
        digits.push(symbols[(number % BASE) as usize]);
        number /= BASE;
        if number == 0 {
            break;
        }
    }
    digits.iter().rev().map(|&b| char::from(b)).collect()
}

/// Decodes a token back to its integer.
///
/// Does not validate: characters outside the alphabet contribute zero and
/// overflow wraps. Use [`is_valid`] first on untrusted input.
#[must_use]
pub fn decode(input: &str) -> u64 {
    input.bytes().fold(0u64, |sum, b| {
        sum.wrapping_mul(BASE).wrapping_add(position(b))
    })
}

fn position(b: u8) -> u64 {
    SYMBOLS
        .bytes()
        .position(|s| s == b)
        .map_or(0, |p| p as u64)
}

/// Returns true if `input` is non-empty and made only of alphabet symbols.
#[must_use]
pub fn is_valid(input: &str) -> bool {
    !input.is_empty() && input.bytes().all(|b| SYMBOLS.as_bytes().contains(&b))
}

/// Generates a random token of exactly `len` symbols.
///
/// `len` is clamped to `1..=MAX_GENERATED_LEN`.
#[must_use]
pub fn generate(len: u32) -> String {
    let len = len.clamp(1, MAX_GENERATED_LEN);
    let low = if len == 1 { 0 } else { BASE.pow(len - 1) };
    let high = BASE.pow(len);
    encode(rand::rng().random_range(low..high))
}

/// Generates a deletion token: two concatenated encodings of random integers.
#[must_use]
pub fn deletion_token() -> String {
    let mut rng = rand::rng();
    let first: u64 = 10_000_000 + rng.random_range(0..1_000_000_000);
    let second: u64 = 10_000_000 + rng.random_range(0..1_000_000_000);
    format!("{}{}", encode(first), encode(second))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[test]
    fn test_alphabet_has_no_duplicates() {
        let mut seen = std::collections::HashSet::new();
        assert!(SYMBOLS.bytes().all(|b| seen.insert(b)));
        assert_eq!(BASE, 60);
    }

    #[rstest]
    #[case(0, "0")]
    #[case(9, "9")]
    #[case(10, "a")]
    #[case(59, "Z")]
    #[case(60, "10")]
    #[case(3600, "100")]
    fn test_encode_known_values(#[case] number: u64, #[case] expected: &str) {
        assert_eq!(encode(number), expected);
        assert_eq!(decode(expected), number);
    }

    #[test]
    fn test_decode_is_case_sensitive() {
        assert_ne!(decode("a"), decode("A"));
    }

    #[rstest]
    #[case("abc123", true)]
    #[case("ZZZ", true)]
    #[case("", false)]
    #[case("has t", false)]
    #[case("W", false)]
    #[case("../etc", false)]
    fn test_is_valid(#[case] input: &str, #[case] expected: bool) {
        assert_eq!(is_valid(input), expected);
    }

    #[test]
    fn test_generate_has_requested_length() {
        for len in 1..=MAX_GENERATED_LEN {
            let token = generate(len);
            assert_eq!(token.len(), len as usize, "token {token}");
            assert!(is_valid(&token));
        }
        assert_eq!(generate(64).len(), MAX_GENERATED_LEN as usize);
    }

    #[test]
    fn test_deletion_token_is_valid() {
        let token = deletion_token();
        assert!(is_valid(&token));
        assert!(token.len() >= 8);
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(n in 0u64..10_000_000_000) {
            prop_assert_eq!(decode(&encode(n)), n);
        }

        #[test]
        fn prop_encoding_has_no_leading_zero(n in 1u64..u64::MAX) {
            prop_assert!(!encode(n).starts_with('0'));
        }
    }
}
