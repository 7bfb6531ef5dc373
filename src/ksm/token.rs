//! Local decoding of the 16-byte `YubiKey` token.

use crate::ksm::modhex;
use aes::{
    cipher::{BlockDecrypt, KeyInit},
    Aes128, Block,
};
use crc::{Crc, CRC_16_IBM_SDLC};
use thiserror::Error;

/// Length of the encrypted token in modhex characters.
pub const TOKEN_LEN: usize = 32;

/// Longest accepted OTP, public name included.
pub const OTP_MAX_LEN: usize = 48;

/// Token checksum, stored complemented and little-endian in the last two bytes.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

/// Checksum of a whole block whose trailing CRC is intact.
const CRC_OK_RESIDUE: u16 = 0x0f47;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("OTP must be 32 to 48 modhex characters")]
    Format,
    #[error("AES key must be 16 bytes, got {0}")]
    KeyLength(usize),
    #[error("token checksum mismatch")]
    Crc,
}

/// Decrypted token fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub private_id: [u8; 6],
    pub session_counter: u16,
    pub timestamp_low: u16,
    pub timestamp_high: u8,
    pub session_use: u8,
    pub random: u16,
    pub crc: u16,
}

/// Split an OTP into its public name and encrypted part.
///
/// # Errors
/// Returns [`TokenError::Format`] when the OTP is not modhex or its length is out of range.
pub fn split_otp(otp: &str) -> Result<(&str, &str), TokenError> {
    if !(TOKEN_LEN..=OTP_MAX_LEN).contains(&otp.len()) || !modhex::is_modhex(otp) {
        return Err(TokenError::Format);
    }
    Ok(otp.split_at(otp.len() - TOKEN_LEN))
}

/// Decrypt the modhex `token` with `key` and check its checksum.
///
/// # Errors
/// Returns an error on malformed input, a wrong key size or a checksum mismatch,
/// the latter being what a wrong key looks like.
pub fn decrypt(token: &str, key: &[u8]) -> Result<Token, TokenError> {
    if token.len() != TOKEN_LEN {
        return Err(TokenError::Format);
    }
    let ciphertext = modhex::decode(token).ok_or(TokenError::Format)?;
    let cipher = Aes128::new_from_slice(key).map_err(|_| TokenError::KeyLength(key.len()))?;

    let mut block = Block::clone_from_slice(&ciphertext);
    cipher.decrypt_block(&mut block);
    let plain = block.as_slice();

    if CRC16.checksum(plain) != CRC_OK_RESIDUE {
        return Err(TokenError::Crc);
    }

    let mut private_id = [0u8; 6];
    private_id.copy_from_slice(&plain[..6]);

    Ok(Token {
        private_id,
        session_counter: u16::from_le_bytes([plain[6], plain[7]]),
        timestamp_low: u16::from_le_bytes([plain[8], plain[9]]),
        timestamp_high: plain[10],
        session_use: plain[11],
        random: u16::from_le_bytes([plain[12], plain[13]]),
        crc: u16::from_le_bytes([plain[14], plain[15]]),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // token built with key 000102..0f over
    // uid 010203040506, ctr 1, low 0x86bf, high 0x83, use 4, rnd 0xbbaa
    const KEY: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];
    const TOKEN: &str = "gvifjgiitecdbvlckrbrgkgeudjcurji";

    #[test]
    fn decrypts_known_token() {
        let token = decrypt(TOKEN, &KEY).unwrap();
        assert_eq!(token.private_id, [1, 2, 3, 4, 5, 6]);
        assert_eq!(token.session_counter, 1);
        assert_eq!(token.timestamp_low, 0x86bf);
        assert_eq!(token.timestamp_high, 0x83);
        assert_eq!(token.session_use, 4);
        assert_eq!(token.random, 0xbbaa);
    }

    #[test]
    fn wrong_key_fails_checksum() {
        let mut key = KEY;
        key[0] ^= 0xff;
        assert_eq!(decrypt(TOKEN, &key), Err(TokenError::Crc));
    }

    #[test]
    fn short_key_is_rejected() {
        assert_eq!(decrypt(TOKEN, &KEY[..8]), Err(TokenError::KeyLength(8)));
    }

    #[test]
    fn malformed_token_is_rejected() {
        assert_eq!(decrypt(&TOKEN[..30], &KEY), Err(TokenError::Format));
        assert_eq!(
            decrypt("gvifjgiitecdbvlckrbrgkgeudjcurja", &KEY),
            Err(TokenError::Format)
        );
    }

    #[test]
    fn split_keeps_fixed_suffix() {
        let otp = format!("cccccccccccb{TOKEN}");
        assert_eq!(split_otp(&otp).unwrap(), ("cccccccccccb", TOKEN));
        assert_eq!(split_otp(TOKEN).unwrap(), ("", TOKEN));
    }

    #[test]
    fn split_rejects_length_and_alphabet() {
        assert_eq!(split_otp(&TOKEN[..31]), Err(TokenError::Format));
        let long = "c".repeat(OTP_MAX_LEN + 1);
        assert_eq!(split_otp(&long), Err(TokenError::Format));
        let bad = format!("cccccccccccx{TOKEN}");
        assert_eq!(split_otp(&bad), Err(TokenError::Format));
    }

    #[test]
    fn crc_residue_of_valid_block() {
        let mut block = vec![1, 2, 3, 4, 5, 6, 1, 0, 0xbf, 0x86, 0x83, 4, 0xaa, 0xbb];
        let crc = CRC16.checksum(&block);
        assert_eq!(crc, 0xc059);
        block.extend_from_slice(&crc.to_le_bytes());
        assert_eq!(CRC16.checksum(&block), CRC_OK_RESIDUE);

        block[3] ^= 0x01;
        assert_ne!(CRC16.checksum(&block), CRC_OK_RESIDUE);
    }

    #[test]
    fn crc_matches_check_value() {
        // CRC-16/X-25 check value
        assert_eq!(CRC16.checksum(b"123456789"), 0x906e);
    }

    #[test]
    fn decrypted_token_carries_stored_crc() {
        assert_eq!(decrypt(TOKEN, &KEY).unwrap().crc, 0xc059);
    }
}
