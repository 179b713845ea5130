#![forbid(unsafe_code)]

//! AES key wrapping as defined in [RFC 3394](https://datatracker.ietf.org/doc/html/rfc3394).
//!
//! Used to protect the vault master keys with the passphrase-derived KEK.
//! Only 256-bit KEKs are supported.

use aes::Aes256;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use generic_array::GenericArray;
use thiserror::Error;
use zeroize::Zeroizing;

/// Default initial value from RFC 3394 section 2.2.3.1.
const IV_3394: [u8; 8] = [0xA6; 8];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WrapError {
    #[error("plaintext length {0} is not a positive multiple of 64 bits")]
    InvalidPlaintextLength(usize),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum UnwrapError {
    #[error("ciphertext length is not a multiple of 64 bits")]
    InvalidCiphertextLength,
    #[error("ciphertext is shorter than the minimum of 24 bytes")]
    CiphertextTooShort,
    /// Wrong KEK (usually a wrong passphrase) or tampered ciphertext.
    #[error("integrity check failed")]
    InvalidIntegrityCheck,
}

/// Wrap `plaintext` with `kek`. Output is 8 bytes longer than the input.
pub fn wrap_key(plaintext: &[u8], kek: &[u8; 32]) -> Result<Vec<u8>, WrapError> {
    if plaintext.is_empty() || plaintext.len() % 8 != 0 {
        return Err(WrapError::InvalidPlaintextLength(plaintext.len()));
    }

    let cipher = Aes256::new(GenericArray::from_slice(kek));
    let n = (plaintext.len() / 8) as u64;
    let mut a = IV_3394;
    let mut registers = Zeroizing::new(plaintext.to_vec());

    for j in 0..6u64 {
        for (i, r) in registers.chunks_exact_mut(8).enumerate() {
            let mut block = aes::Block::clone_from_slice(&[a.as_slice(), &*r].concat());
            cipher.encrypt_block(&mut block);

            let t = n * j + (i as u64 + 1);
            a.copy_from_slice(&block[..8]);
            for (byte, t_byte) in a.iter_mut().zip(t.to_be_bytes()) {
                *byte ^= t_byte;
            }
            r.copy_from_slice(&block[8..]);
        }
    }

    let mut out = Vec::with_capacity(plaintext.len() + 8);
    out.extend_from_slice(&a);
    out.extend_from_slice(&registers);
    Ok(out)
}

/// Unwrap `ciphertext` with `kek`, verifying the integrity register.
pub fn unwrap_key(ciphertext: &[u8], kek: &[u8; 32]) -> Result<Zeroizing<Vec<u8>>, UnwrapError> {
    if ciphertext.len() % 8 != 0 {
        return Err(UnwrapError::InvalidCiphertextLength);
    }
    if ciphertext.len() < 24 {
        return Err(UnwrapError::CiphertextTooShort);
    }

    let cipher = Aes256::new(GenericArray::from_slice(kek));
    let n = (ciphertext.len() / 8 - 1) as u64;
    let mut a = [0u8; 8];
    a.copy_from_slice(&ciphertext[..8]);
    let mut registers = Zeroizing::new(ciphertext[8..].to_vec());

    for j in (0..6u64).rev() {
        for (i, r) in registers.chunks_exact_mut(8).enumerate().rev() {
            let t = n * j + (i as u64 + 1);
            for (byte, t_byte) in a.iter_mut().zip(t.to_be_bytes()) {
                *byte ^= t_byte;
            }
            let mut block = aes::Block::clone_from_slice(&[a.as_slice(), &*r].concat());
            cipher.decrypt_block(&mut block);

            a.copy_from_slice(&block[..8]);
            r.copy_from_slice(&block[8..]);
        }
    }

    if a != IV_3394 {
        return Err(UnwrapError::InvalidIntegrityCheck);
    }
    Ok(registers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    const KEK: [u8; 32] = hex!("000102030405060708090A0B0C0D0E0F101112131415161718191A1B1C1D1E1F");

    #[test]
    fn test_wrap_128_key_with_256_kek() {
        let key_data = hex!("00112233445566778899AABBCCDDEEFF");
        let expected = hex!("64E8C3F9CE0F5BA2 63E9777905818A2A 93C8191E7D6E8AE7");
        assert_eq!(wrap_key(&key_data, &KEK).unwrap(), expected);
        assert_eq!(unwrap_key(&expected, &KEK).unwrap().as_slice(), key_data);
    }

    #[test]
    fn test_wrap_256_key_with_256_kek() {
        let key_data = hex!("00112233445566778899AABBCCDDEEFF000102030405060708090A0B0C0D0E0F");
        let expected = hex!(
            "28C9F404C4B810F4 CBCCB35CFB87F826 3F5786E2D80ED326 CBC7F0E71A99F43B FB988B9B7A02DD21"
        );
        assert_eq!(wrap_key(&key_data, &KEK).unwrap(), expected);
        assert_eq!(unwrap_key(&expected, &KEK).unwrap().as_slice(), key_data);
    }

    #[test]
    fn test_wrong_kek_fails_integrity() {
        let wrong = hex!("36b0144a13d0b5c1950c435762ff47789ab64258763f6f980f66dc00c11697cd");
        let ciphertext = hex!("A8F9BC1612C68B3F F6E6F4FBE30E71E4 769C8B80A32CB895 8CD5D17D6B254DA1");
        assert_eq!(
            unwrap_key(&ciphertext, &wrong).unwrap_err(),
            UnwrapError::InvalidIntegrityCheck
        );
    }

    #[test]
    fn test_invalid_lengths() {
        assert_eq!(
            wrap_key(&[0u8; 18], &KEK).unwrap_err(),
            WrapError::InvalidPlaintextLength(18)
        );
        assert_eq!(
            unwrap_key(&[0u8; 14], &KEK).unwrap_err(),
            UnwrapError::InvalidCiphertextLength
        );
        assert_eq!(
            unwrap_key(&[0u8; 16], &KEK).unwrap_err(),
            UnwrapError::CiphertextTooShort
        );
    }
}
