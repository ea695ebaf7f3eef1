//! Key exchange state for the TO2 tunnel.
//!
//! The owner side starts the exchange in ProveOVHdr and finishes it when
//! ProveDevice arrives, so the private half must survive across requests.
//! State is serializable and scrubbed on drop.

use eyre::{bail, ensure, Context, OptionExt};
use openssl::bn::{BigNum, BigNumContext};
use openssl::derive::Deriver;
use openssl::ec::{EcGroup, EcKey, EcPoint};
use openssl::encrypt::{Decrypter, Encrypter};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Padding;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::protocol::v101::key_exchange::{XAKeyExchange, XBKeyExchange};

pub use crate::protocol::v101::key_exchange::KexSuiteName;

use super::CryptoService;

/// 2048-bit MODP group (RFC 3526, id 14), generator 2.
const DH_PRIME_ID14: &str = "\
    FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
    020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
    4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
    EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
    98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
    9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
    E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
    3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";

/// 3072-bit MODP group (RFC 3526, id 15), generator 2.
const DH_PRIME_ID15: &str = "\
    FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
    020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
    4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
    EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
    98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
    9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
    E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
    3995497CEA956AE515D2261898FA051015728E5A8AAC42DAD33170D04507A33A\
    85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7A\
    BF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864D\
    87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E20\
    8E24FA074E5AB3143DB5BFCE0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF";

/// The secrets that feed the tunnel KDF.
#[derive(Debug, PartialEq, Eq)]
pub struct KeyExchangeResult {
    pub shared_secret: Vec<u8>,
    pub context_rand: Vec<u8>,
}

impl Drop for KeyExchangeResult {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
        self.context_rand.zeroize();
    }
}

/// Owner half of the key exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyExchange {
    suite: KexSuiteName,
    state: State,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum State {
    Ecdh {
        #[serde(with = "serde_bytes")]
        private_der: Vec<u8>,
        #[serde(with = "serde_bytes")]
        our_random: Vec<u8>,
    },
    Dh {
        #[serde(with = "serde_bytes")]
        exponent: Vec<u8>,
    },
    Asymkex {
        #[serde(with = "serde_bytes")]
        our_random: Vec<u8>,
    },
}

impl Drop for State {
    fn drop(&mut self) {
        match self {
            State::Ecdh {
                private_der,
                our_random,
            } => {
                private_der.zeroize();
                our_random.zeroize();
            }
            State::Dh { exponent } => exponent.zeroize(),
            State::Asymkex { our_random } => our_random.zeroize(),
        }
    }
}

impl KeyExchange {
    /// Starts the exchange on the owner side, producing xAKeyExchange for
    /// TO2.ProveOVHdr.
    pub fn owner_begin(
        suite: KexSuiteName,
        crypto: &CryptoService,
    ) -> eyre::Result<(Self, XAKeyExchange<'static>)> {
        match suite {
            KexSuiteName::Ecdh256 | KexSuiteName::Ecdh384 => {
                let group = ec_group(suite)?;
                let key = EcKey::generate(&group)?;
                let our_random = crypto.random_bytes(ecdh_random_len(suite))?;

                let (x, y) = ec_coordinates(&key, suite)?;
                let xa = XAKeyExchange::create_ecdh(&x, &y, &our_random)?;

                let state = State::Ecdh {
                    private_der: key.private_key_to_der()?,
                    our_random,
                };

                Ok((Self { suite, state }, xa))
            }
            KexSuiteName::Dhkexid14 | KexSuiteName::Dhkexid15 => {
                let exponent = crypto.random_bytes(dh_exponent_len(suite))?;

                let public = dh_mod_exp(&dh_generator()?, &exponent, &dh_prime(suite)?)?;

                let state = State::Dh { exponent };

                Ok((Self { suite, state }, XAKeyExchange::from_bytes(public)))
            }
            KexSuiteName::Asymkex2048 | KexSuiteName::Asymkex3072 => {
                let our_random = crypto.random_bytes(asymkex_random_len(suite))?;

                let xa = XAKeyExchange::from_bytes(our_random.clone());

                let state = State::Asymkex { our_random };

                Ok((Self { suite, state }, xa))
            }
        }
    }

    /// Completes the exchange with the device's xBKeyExchange from
    /// TO2.ProveDevice.
    ///
    /// The ASYMKEX suites need the owner RSA key to unwrap the device
    /// random.
    pub fn owner_finish(
        &self,
        xb: &XBKeyExchange<'_>,
        owner_key: Option<&PKey<Private>>,
    ) -> eyre::Result<KeyExchangeResult> {
        match &self.state {
            State::Ecdh {
                private_der,
                our_random,
            } => {
                let (bx, by, device_random) = xb.parse_ecdh()?;
                ensure!(
                    device_random.len() == ecdh_random_len(self.suite),
                    "invalid device random size: {}",
                    device_random.len()
                );

                let key = EcKey::private_key_from_der(private_der)?;
                let secret = ecdh_derive(&key, self.suite, bx, by)?;

                Ok(shared_with_randoms(secret, our_random, device_random))
            }
            State::Dh { exponent } => {
                let shared_secret =
                    dh_mod_exp(&BigNum::from_slice(xb.as_ref())?, exponent, &dh_prime(self.suite)?)?;

                Ok(KeyExchangeResult {
                    shared_secret,
                    context_rand: Vec::new(),
                })
            }
            State::Asymkex { our_random } => {
                let owner_key = owner_key.ok_or_eyre("ASYMKEX requires the owner RSA key")?;

                let mut decrypter = Decrypter::new(owner_key)?;
                decrypter.set_rsa_padding(Padding::PKCS1_OAEP)?;
                decrypter.set_rsa_oaep_md(MessageDigest::sha256())?;
                decrypter.set_rsa_mgf1_md(MessageDigest::sha256())?;

                let mut shared_secret = vec![0; decrypter.decrypt_len(xb.as_ref())?];
                let len = decrypter
                    .decrypt(xb.as_ref(), &mut shared_secret)
                    .wrap_err("couldn't unwrap device random")?;
                shared_secret.truncate(len);

                ensure!(
                    shared_secret.len() == asymkex_random_len(self.suite),
                    "invalid device random size: {}",
                    shared_secret.len()
                );

                Ok(KeyExchangeResult {
                    shared_secret,
                    context_rand: our_random.clone(),
                })
            }
        }
    }

    /// Device half of the exchange, answering xA with xB.
    ///
    /// ASYMKEX wraps the device random with the owner public key taken
    /// from the voucher.
    pub fn device_respond(
        suite: KexSuiteName,
        crypto: &CryptoService,
        xa: &XAKeyExchange<'_>,
        owner_spki: Option<&[u8]>,
    ) -> eyre::Result<(XBKeyExchange<'static>, KeyExchangeResult)> {
        match suite {
            KexSuiteName::Ecdh256 | KexSuiteName::Ecdh384 => {
                let (ax, ay, owner_random) = xa.parse_ecdh()?;
                ensure!(
                    owner_random.len() == ecdh_random_len(suite),
                    "invalid owner random size: {}",
                    owner_random.len()
                );

                let group = ec_group(suite)?;
                let key = EcKey::generate(&group)?;
                let device_random = crypto.random_bytes(ecdh_random_len(suite))?;

                let (bx, by) = ec_coordinates(&key, suite)?;
                let xb = XBKeyExchange::create_ecdh(&bx, &by, &device_random)?;

                let secret = ecdh_derive(&key, suite, ax, ay)?;
                let result = shared_with_randoms(secret, owner_random, &device_random);

                Ok((xb, result))
            }
            KexSuiteName::Dhkexid14 | KexSuiteName::Dhkexid15 => {
                let prime = dh_prime(suite)?;
                let exponent = crypto.random_bytes(dh_exponent_len(suite))?;

                let public = dh_mod_exp(&dh_generator()?, &exponent, &prime)?;
                let shared_secret =
                    dh_mod_exp(&BigNum::from_slice(xa.as_ref())?, &exponent, &prime)?;

                Ok((
                    XBKeyExchange::from_bytes(public),
                    KeyExchangeResult {
                        shared_secret,
                        context_rand: Vec::new(),
                    },
                ))
            }
            KexSuiteName::Asymkex2048 | KexSuiteName::Asymkex3072 => {
                ensure!(
                    xa.as_ref().len() == asymkex_random_len(suite),
                    "invalid owner random size: {}",
                    xa.as_ref().len()
                );

                let owner_spki = owner_spki.ok_or_eyre("ASYMKEX requires the owner public key")?;
                let owner_key = PKey::public_key_from_der(owner_spki)?;

                let device_random = crypto.random_bytes(asymkex_random_len(suite))?;

                let mut encrypter = Encrypter::new(&owner_key)?;
                encrypter.set_rsa_padding(Padding::PKCS1_OAEP)?;
                encrypter.set_rsa_oaep_md(MessageDigest::sha256())?;
                encrypter.set_rsa_mgf1_md(MessageDigest::sha256())?;

                let mut wrapped = vec![0; encrypter.encrypt_len(&device_random)?];
                let len = encrypter.encrypt(&device_random, &mut wrapped)?;
                wrapped.truncate(len);

                Ok((
                    XBKeyExchange::from_bytes(wrapped),
                    KeyExchangeResult {
                        shared_secret: device_random,
                        context_rand: xa.as_ref().to_vec(),
                    },
                ))
            }
        }
    }
}

/// ShSe = ECDH secret || OwnerRandom || DeviceRandom
fn shared_with_randoms(
    mut secret: Vec<u8>,
    owner_random: &[u8],
    device_random: &[u8],
) -> KeyExchangeResult {
    secret.reserve(owner_random.len() + device_random.len());
    secret.extend_from_slice(owner_random);
    secret.extend_from_slice(device_random);

    KeyExchangeResult {
        shared_secret: secret,
        context_rand: Vec::new(),
    }
}

fn ec_group(suite: KexSuiteName) -> eyre::Result<EcGroup> {
    let nid = match suite {
        KexSuiteName::Ecdh256 => Nid::X9_62_PRIME256V1,
        KexSuiteName::Ecdh384 => Nid::SECP384R1,
        _ => bail!("not an ECDH suite: {}", suite.as_str()),
    };

    EcGroup::from_curve_name(nid).wrap_err("couldn't load EC group")
}

fn ec_field_len(suite: KexSuiteName) -> i32 {
    match suite {
        KexSuiteName::Ecdh384 => 48,
        _ => 32,
    }
}

fn ecdh_random_len(suite: KexSuiteName) -> usize {
    match suite {
        KexSuiteName::Ecdh384 => 48,
        _ => 16,
    }
}

fn dh_exponent_len(suite: KexSuiteName) -> usize {
    match suite {
        KexSuiteName::Dhkexid15 => 96,
        _ => 32,
    }
}

fn asymkex_random_len(suite: KexSuiteName) -> usize {
    match suite {
        KexSuiteName::Asymkex3072 => 96,
        _ => 32,
    }
}

fn ec_coordinates(key: &EcKey<Private>, suite: KexSuiteName) -> eyre::Result<(Vec<u8>, Vec<u8>)> {
    let group = ec_group(suite)?;
    let mut ctx = BigNumContext::new()?;

    let mut x = BigNum::new()?;
    let mut y = BigNum::new()?;
    key.public_key()
        .affine_coordinates(&group, &mut x, &mut y, &mut ctx)?;

    let len = ec_field_len(suite);

    Ok((x.to_vec_padded(len)?, y.to_vec_padded(len)?))
}

fn ecdh_derive(
    key: &EcKey<Private>,
    suite: KexSuiteName,
    peer_x: &[u8],
    peer_y: &[u8],
) -> eyre::Result<Vec<u8>> {
    let group = ec_group(suite)?;
    let mut ctx = BigNumContext::new()?;

    let x = BigNum::from_slice(peer_x)?;
    let y = BigNum::from_slice(peer_y)?;

    let mut point = EcPoint::new(&group)?;
    point.set_affine_coordinates_gfp(&group, &x, &y, &mut ctx)?;

    let peer = EcKey::from_public_key(&group, &point)?;
    // Rejects points off the curve
    peer.check_key()?;

    let ours = PKey::from_ec_key(key.clone())?;
    let peer = PKey::from_ec_key(peer)?;

    let mut deriver = Deriver::new(&ours)?;
    deriver.set_peer(&peer)?;

    deriver.derive_to_vec().wrap_err("ECDH derivation failed")
}

fn dh_generator() -> eyre::Result<BigNum> {
    BigNum::from_u32(2).wrap_err("couldn't create generator")
}

fn dh_prime(suite: KexSuiteName) -> eyre::Result<BigNum> {
    let hex = match suite {
        KexSuiteName::Dhkexid14 => DH_PRIME_ID14,
        KexSuiteName::Dhkexid15 => DH_PRIME_ID15,
        _ => bail!("not a DH suite: {}", suite.as_str()),
    };

    BigNum::from_hex_str(hex).wrap_err("couldn't load DH prime")
}

/// `base ^ exponent mod prime`, sign-prefixed big-endian
fn dh_mod_exp(base: &BigNum, exponent: &[u8], prime: &BigNum) -> eyre::Result<Vec<u8>> {
    let exponent = BigNum::from_slice(exponent)?;
    let mut ctx = BigNumContext::new()?;

    let mut result = BigNum::new()?;
    result.mod_exp(base, &exponent, prime, &mut ctx)?;

    Ok(signed_magnitude(&result))
}

/// Minimal big-endian bytes with a leading zero octet whenever the top bit
/// is set. The KDF is keyed on these exact bytes, and the peer derives them
/// from a signed big-integer encoding, so the prefix octet is significant.
fn signed_magnitude(value: &BigNum) -> Vec<u8> {
    let bytes = value.to_vec();
    match bytes.first() {
        Some(&first) if first & 0x80 != 0 => {
            let mut out = Vec::with_capacity(bytes.len() + 1);
            out.push(0);
            out.extend_from_slice(&bytes);
            out
        }
        _ => bytes,
    }
}
