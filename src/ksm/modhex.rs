//! Modhex, the keyboard-layout independent hex alphabet of `YubiKey` tokens.

/// Modhex digits in value order, `c` is 0 and `v` is 15.
pub const ALPHABET: &str = "cbdefghijklnrtuv";

/// Same positions on a Dvorak keyboard.
pub const DVORAK_ALPHABET: &str = "jxe.uidchtnbpygk";

fn digit(c: u8) -> Option<u8> {
    ALPHABET
        .bytes()
        .position(|m| m == c)
        .and_then(|p| u8::try_from(p).ok())
}

/// Whether every character of `value` is a modhex digit.
#[must_use]
pub fn is_modhex(value: &str) -> bool {
    value.bytes().all(|c| digit(c).is_some())
}

/// Decode a modhex string into bytes.
///
/// Returns `None` on odd length or any character outside the alphabet.
#[must_use]
pub fn decode(value: &str) -> Option<Vec<u8>> {
    let bytes = value.as_bytes();
    if bytes.len() % 2 != 0 {
        return None;
    }
    bytes
        .chunks_exact(2)
        .map(|pair| Some((digit(pair[0])? << 4) | digit(pair[1])?))
        .collect()
}

/// Translate an OTP typed on a Dvorak layout back to modhex.
///
/// The input is returned unchanged unless it consists only of Dvorak-positioned
/// modhex characters.
#[must_use]
pub fn from_dvorak(value: &str) -> String {
    if value.is_empty() || !value.chars().all(|c| DVORAK_ALPHABET.contains(c)) {
        return value.to_string();
    }
    value
        .chars()
        .filter_map(|c| {
            DVORAK_ALPHABET
                .find(c)
                .and_then(|index| ALPHABET[index..].chars().next())
        })
        .collect()
}
