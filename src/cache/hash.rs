use hmac::{Hmac, Mac};
use md5::Md5;
use rand::RngCore;

use super::CacheError;

type HmacMd5 = Hmac<Md5>;

/// Derives cache keys from source URLs.
///
/// The key doubles as the anti-open-proxy token: without the salt nobody can
/// forge a valid `hash` for an arbitrary URL.
#[derive(Clone)]
pub struct Hasher {
    mac: HmacMd5,
}

impl Hasher {
    pub fn new(salt: &str) -> Result<Self, CacheError> {
        if salt.is_empty() {
            return Err(CacheError::InvalidSalt("salt must not be empty".to_string()));
        }

        let mac = HmacMd5::new_from_slice(salt.as_bytes())
            .map_err(|e| CacheError::InvalidSalt(e.to_string()))?;

        Ok(Self { mac })
    }

    // Lowercase hex, always 32 characters
    pub fn compute_key(&self, url: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(url.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Generates a fresh 128 bit salt, hex encoded.
pub fn generate_salt() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_stable_for_same_url_and_salt() {
        let hasher = Hasher::new("sauce").unwrap();
        let first = hasher.compute_key("http://example.com/a.png");
        let second = hasher.compute_key("http://example.com/a.png");

        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn key_differs_between_urls_and_salts() {
        let hasher = Hasher::new("sauce").unwrap();
        let other = Hasher::new("other sauce").unwrap();

        assert_ne!(
            hasher.compute_key("http://example.com/a.png"),
            hasher.compute_key("http://example.com/b.png")
        );
        assert_ne!(
            hasher.compute_key("http://example.com/a.png"),
            other.compute_key("http://example.com/a.png")
        );
    }

    #[test]
    fn matches_known_hmac_md5_vector() {
        // RFC 2104 test case 2
        let hasher = Hasher::new("Jefe").unwrap();
        assert_eq!(
            hasher.compute_key("what do ya want for nothing?"),
            "750c783e6ab0b503eaa86e310a5db738"
        );
    }

    #[test]
    fn empty_salt_is_rejected() {
        assert!(matches!(Hasher::new(""), Err(CacheError::InvalidSalt(_))));
    }

    #[test]
    fn generated_salts_are_long_and_distinct() {
        let a = generate_salt();
        let b = generate_salt();

        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
