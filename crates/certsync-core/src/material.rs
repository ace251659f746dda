use zeroize::Zeroize;

/// Raw certificate material for one domain as returned by the issuing API.
/// Created fresh per fetch, converted to artifacts, then dropped; never
/// persisted outside the output directory.
pub struct CertificateMaterial {
    /// Full chain, leaf first, PEM.
    pub chain_pem: String,
    /// Leaf certificate on its own, PEM. May be empty when the issuer only
    /// returns the chain.
    pub leaf_pem: String,
    /// Private key, PEM.
    pub key_pem: String,
}

impl Drop for CertificateMaterial {
    fn drop(&mut self) {
        self.key_pem.zeroize();
    }
}
