//! Fixtures shared by unit tests.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

/// Self-signed certificate DER and PKCS#8 key DER with the given common name.
pub fn identity(common_name: &str) -> (Vec<u8>, Vec<u8>) {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    let cert = params.self_signed(&key).unwrap();
    (cert.der().to_vec(), key.serialize_der())
}

/// A password-protected PKCS#12 container holding a fresh identity.
pub fn p12_container(common_name: &str, password: &str) -> Vec<u8> {
    let (cert, key) = identity(common_name);
    p12::PFX::new(&cert, &key, None, password, "signer")
        .unwrap()
        .to_der()
}
