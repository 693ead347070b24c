//! Ephemeral key cache.
//!
//! Keys are expensive to generate, so one process-wide [`KeyCache`] keeps a
//! key per requested size and regenerates it lazily once it is older than the
//! cache lifetime. Sizes up to [`TABLE_BITS`] get their own slot; any larger
//! size shares a single overflow slot.

use parking_lot::Mutex;
use rcgen::{CertificateParams, DnType, KeyPair};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Largest key size with a dedicated slot.
pub const TABLE_BITS: u32 = 2048;

pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(3600);

/// Produces keys of a requested bit length.
pub trait KeyGenerator: Send + Sync {
    type Key: Send + Sync;

    fn generate(&self, bits: u32) -> Result<Self::Key>;
}

struct Entry<K> {
    key: Arc<K>,
    created: Instant,
}

struct Slots<K> {
    table: Vec<Option<Entry<K>>>,
    overflow: Option<(u32, Entry<K>)>,
}

pub struct KeyCache<G: KeyGenerator> {
    generator: G,
    lifetime: Duration,
    slots: Mutex<Slots<G::Key>>,
}

impl<G: KeyGenerator> KeyCache<G> {
    pub fn new(generator: G) -> Self {
        Self::with_lifetime(generator, DEFAULT_LIFETIME)
    }

    pub fn with_lifetime(generator: G, lifetime: Duration) -> Self {
        let mut table = Vec::with_capacity(TABLE_BITS as usize + 1);
        table.resize_with(TABLE_BITS as usize + 1, || None);
        Self {
            generator,
            lifetime,
            slots: Mutex::new(Slots {
                table,
                overflow: None,
            }),
        }
    }

    /// Cached key of `bits` length, generated if missing or expired.
    pub fn get(&self, bits: u32) -> Result<Arc<G::Key>> {
        let (key, replaced) = {
            let mut slots = self.slots.lock();
            let now = Instant::now();

            if bits <= TABLE_BITS {
                let slot = &mut slots.table[bits as usize];
                match slot {
                    Some(entry) if now.duration_since(entry.created) < self.lifetime => {
                        return Ok(Arc::clone(&entry.key));
                    }
                    _ => {}
                }
                debug!("Generating {} bit ephemeral key", bits);
                let key = Arc::new(self.generator.generate(bits)?);
                let entry = Entry {
                    key: Arc::clone(&key),
                    created: now,
                };
                (key, slot.replace(entry))
            } else {
                match &slots.overflow {
                    Some((cached, entry))
                        if *cached == bits
                            && now.duration_since(entry.created) < self.lifetime =>
                    {
                        return Ok(Arc::clone(&entry.key));
                    }
                    _ => {}
                }
                debug!("Generating {} bit ephemeral key (overflow slot)", bits);
                let key = Arc::new(self.generator.generate(bits)?);
                let entry = Entry {
                    key: Arc::clone(&key),
                    created: now,
                };
                (key, slots.overflow.replace((bits, entry)).map(|(_, e)| e))
            }
        };

        // the previous key is released outside the lock
        drop(replaced);
        Ok(key)
    }
}

impl<G: KeyGenerator> fmt::Debug for KeyCache<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCache")
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

/// ECDSA keys: 256 bits is P-256, 384 bits is P-384.
#[derive(Debug, Default, Clone, Copy)]
pub struct EcdsaKeys;

impl KeyGenerator for EcdsaKeys {
    type Key = KeyPair;

    fn generate(&self, bits: u32) -> Result<KeyPair> {
        let alg = match bits {
            256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            384 => &rcgen::PKCS_ECDSA_P384_SHA384,
            other => {
                return Err(Error::Config(format!(
                    "Unsupported ephemeral key size: {} bits",
                    other
                )))
            }
        };
        KeyPair::generate_for(alg).map_err(|e| Error::Setup(format!("key generation: {}", e)))
    }
}

/// Self-signed server identity backed by the ephemeral key cache. The
/// certificate is re-issued whenever the cache hands out a new key.
pub struct EphemeralCertResolver {
    keys: Arc<KeyCache<EcdsaKeys>>,
    bits: u32,
    name: String,
    issued: Mutex<Option<(Arc<KeyPair>, Arc<CertifiedKey>)>>,
}

impl EphemeralCertResolver {
    pub fn new(keys: Arc<KeyCache<EcdsaKeys>>, bits: u32, name: impl Into<String>) -> Self {
        Self {
            keys,
            bits,
            name: name.into(),
            issued: Mutex::new(None),
        }
    }

    pub fn certified_key(&self) -> Result<Arc<CertifiedKey>> {
        let key = self.keys.get(self.bits)?;

        let mut issued = self.issued.lock();
        if let Some((current, certified)) = issued.as_ref() {
            if Arc::ptr_eq(current, &key) {
                return Ok(Arc::clone(certified));
            }
        }

        let certified = Arc::new(issue(&key, &self.name)?);
        debug!("Issued ephemeral certificate for {}", self.name);
        let old = issued.replace((key, Arc::clone(&certified)));
        drop(issued);
        drop(old);
        Ok(certified)
    }
}

fn issue(key: &KeyPair, name: &str) -> Result<CertifiedKey> {
    let setup = |e: rcgen::Error| Error::Setup(format!("ephemeral certificate: {}", e));

    let mut params = CertificateParams::new(vec![name.to_string()]).map_err(setup)?;
    params.distinguished_name.push(DnType::CommonName, name);
    let cert = params.self_signed(key).map_err(setup)?;

    let der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
    let signing = rustls::crypto::ring::sign::any_supported_type(&der)?;
    Ok(CertifiedKey::new(vec![cert.der().clone()], signing))
}

impl fmt::Debug for EphemeralCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralCertResolver")
            .field("bits", &self.bits)
            .field("name", &self.name)
            .finish()
    }
}

impl ResolvesServerCert for EphemeralCertResolver {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        match self.certified_key() {
            Ok(certified) => Some(certified),
            Err(e) => {
                warn!("No ephemeral identity: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tracked {
        bits: u32,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Counting {
        generated: AtomicUsize,
        drops: Arc<AtomicUsize>,
    }

    impl KeyGenerator for &'static Counting {
        type Key = Tracked;

        fn generate(&self, bits: u32) -> Result<Tracked> {
            self.generated.fetch_add(1, Ordering::SeqCst);
            Ok(Tracked {
                bits,
                drops: Arc::clone(&self.drops),
            })
        }
    }

    fn counting() -> &'static Counting {
        Box::leak(Box::<Counting>::default())
    }

    #[test]
    fn test_same_key_within_lifetime() {
        let gen = counting();
        let cache = KeyCache::new(gen);
        let a = cache.get(512).unwrap();
        let b = cache.get(512).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(gen.generated.load(Ordering::SeqCst), 1);

        let other = cache.get(1024).unwrap();
        assert_eq!(other.bits, 1024);
        assert_eq!(gen.generated.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_expired_key_released_once() {
        let gen = counting();
        let cache = KeyCache::with_lifetime(gen, Duration::ZERO);

        let first = cache.get(512).unwrap();
        let weak = Arc::downgrade(&first);
        drop(first);
        assert!(weak.upgrade().is_some(), "cache still holds the key");

        let second = cache.get(512).unwrap();
        assert!(weak.upgrade().is_none());
        assert_eq!(gen.drops.load(Ordering::SeqCst), 1);
        assert_eq!(second.bits, 512);
        assert_eq!(gen.generated.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_overflow_slot_follows_size() {
        let gen = counting();
        let cache = KeyCache::new(gen);

        let a = cache.get(4096).unwrap();
        let b = cache.get(4096).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = cache.get(8192).unwrap();
        assert_eq!(c.bits, 8192);
        drop((a, b));
        // 4096 was evicted from the overflow slot
        assert_eq!(gen.drops.load(Ordering::SeqCst), 1);
        let d = cache.get(4096).unwrap();
        assert!(!Arc::ptr_eq(&c, &d));
        assert_eq!(gen.generated.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_ecdsa_sizes() {
        assert!(EcdsaKeys.generate(256).is_ok());
        assert!(EcdsaKeys.generate(384).is_ok());
        assert!(matches!(EcdsaKeys.generate(1024), Err(Error::Config(_))));
    }

    #[test]
    fn test_resolver_reissues_on_rotation() {
        let keys = Arc::new(KeyCache::with_lifetime(EcdsaKeys, Duration::ZERO));
        let resolver = EphemeralCertResolver::new(Arc::clone(&keys), 256, "localhost");
        let first = resolver.certified_key().unwrap();
        let second = resolver.certified_key().unwrap();
        assert_ne!(first.cert[0], second.cert[0]);

        let stable = EphemeralCertResolver::new(Arc::new(KeyCache::new(EcdsaKeys)), 256, "localhost");
        let a = stable.certified_key().unwrap();
        let b = stable.certified_key().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
