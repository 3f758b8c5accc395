//! Cookie signing for the CSRF value.
//!
//! Kept separate from the token codec: the csrf cookie wraps a raw random
//! value in an HMAC-SHA256 signature made with its own secret.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Number of random bytes in a CSRF value.
const CSRF_VALUE_BYTES: usize = 32;

/// Generate a fresh random CSRF value (URL-safe base64, no separator dots).
pub fn generate_csrf_value() -> String {
    let mut bytes = [0u8; CSRF_VALUE_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Signs and unsigns cookie values as `<value>.<signature>`.
#[derive(Clone)]
pub struct CookieSigner {
    secret: Vec<u8>,
}

impl CookieSigner {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
        }
    }

    fn mac(&self) -> HmacSha256 {
        <HmacSha256 as Mac>::new_from_slice(&self.secret).expect("HMAC accepts any key length")
    }

    pub fn sign(&self, value: &str) -> String {
        let mut mac = self.mac();
        mac.update(value.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{}.{}", value, signature)
    }

    /// Return the original value if the signature is valid.
    pub fn unsign<'a>(&self, signed: &'a str) -> Option<&'a str> {
        let (value, signature) = signed.rsplit_once('.')?;
        let signature = URL_SAFE_NO_PAD.decode(signature).ok()?;
        let mut mac = self.mac();
        mac.update(value.as_bytes());
        mac.verify_slice(&signature).ok()?;
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_unsign() {
        let signer = CookieSigner::new(b"csrf-secret");
        let value = generate_csrf_value();

        let signed = signer.sign(&value);
        assert_ne!(signed, value);
        assert_eq!(signer.unsign(&signed), Some(value.as_str()));
    }

    #[test]
    fn test_tampered_value_rejected() {
        let signer = CookieSigner::new(b"csrf-secret");
        let signed = signer.sign("original");
        let (_, signature) = signed.rsplit_once('.').unwrap();

        assert_eq!(signer.unsign(&format!("forged.{}", signature)), None);
        assert_eq!(signer.unsign("original"), None);
        assert_eq!(signer.unsign("original.not-base64!"), None);
    }

    #[test]
    fn test_other_secret_rejected() {
        let signed = CookieSigner::new(b"secret-1").sign("value");
        assert_eq!(CookieSigner::new(b"secret-2").unsign(&signed), None);
    }

    #[test]
    fn test_csrf_values_are_unique() {
        assert_ne!(generate_csrf_value(), generate_csrf_value());
    }
}
