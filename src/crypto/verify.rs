//! Manual peer verification: fingerprint pinning and DNS-name matching
//! (spec.md §4.1 "Peer verification (legacy mode only)").
//!
//! DESIGN NOTES (spec.md §9) call for modeling "legacy vs modern TLS
//! verification" as a strategy chosen once at construction rather than a
//! per-call branch; `PeerVerifier` is that strategy object.

use openssl::{
    hash::{hash, MessageDigest},
    x509::X509,
};

use crate::options::CryptoOptionsMap;

/// Strategy for verifying a peer's identity after a handshake completes.
///
/// `Native` defers entirely to the transport library's own verification
/// (e.g. `openssl`'s built-in hostname checking via
/// `SslConnector::builder` verify callbacks); `Manual` performs the
/// fingerprint/name checks spelled out in spec.md §4.1 itself.
pub enum PeerVerifier {
    Native,
    Manual,
}

impl PeerVerifier {
    pub fn is_legacy(&self) -> bool {
        matches!(self, PeerVerifier::Manual)
    }

    /// Runs manual verification against `options`. Only called when
    /// `self` is `Manual`; `Native` mode relies on the transport having
    /// already rejected a bad handshake.
    pub fn verify(&self, cert: &X509, options: &CryptoOptionsMap) -> Result<(), String> {
        if let Some(fp_opt) = options.get("peer_fingerprint") {
            let candidates = fp_opt.as_str_list();
            if !candidates.is_empty() && !verify_fingerprint(cert, &candidates) {
                return Err("peer certificate fingerprint did not match".to_string());
            }
        }

        if let Some(name_opt) = options.get("peer_name") {
            if let Some(expected) = name_opt.as_str() {
                if !verify_name(cert, expected) {
                    return Err(format!("peer certificate name did not match {expected}"));
                }
            }
        }

        Ok(())
    }
}

/// Computes the DER fingerprint of `cert` and checks it against any of
/// `candidates`. A 40-hex-character candidate is compared against SHA-1;
/// anything else against MD5 (spec.md §4.1 step 1).
fn verify_fingerprint(cert: &X509, candidates: &[String]) -> bool {
    let der = match cert.to_der() {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    candidates.iter().any(|candidate| {
        let digest = if candidate.len() == 40 {
            MessageDigest::sha1()
        } else {
            MessageDigest::md5()
        };
        match hash(digest, &der) {
            Ok(actual) => hex_encode(&actual) == candidate.as_str(),
            Err(_) => false,
        }
    })
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// Checks `expected` against the certificate's Common Name and any
/// `DNS:` subjectAltName entries, per spec.md §4.1 step 2.
fn verify_name(cert: &X509, expected: &str) -> bool {
    if let Some(cn) = common_name(cert) {
        if wildcard_match(&cn, expected) {
            return true;
        }
    }

    for san in subject_alt_names(cert) {
        if wildcard_match(&san, expected) {
            return true;
        }
    }

    false
}

fn common_name(cert: &X509) -> Option<String> {
    cert.subject_name()
        .entries_by_nid(openssl::nid::Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|s| s.to_string())
}

fn subject_alt_names(cert: &X509) -> Vec<String> {
    match cert.subject_alt_names() {
        Some(names) => names
            .iter()
            .filter_map(|n| n.dnsname().map(|s| s.to_string()))
            .collect(),
        None => Vec::new(),
    }
}

/// The wildcard law from spec.md §8:
///
///   - `matches("a.b.c", "*.b.c") == true`
///   - `matches("x.a.b.c", "*.b.c") == false`
///   - `matches("b.c", "*.b.c") == false`
///   - `matches("A.B.C", "a.b.c") == true` (case-insensitive exact match)
///
/// A cert name is matched against a peer name; exactly one label is
/// consumed by a leading `*.`.
pub fn wildcard_match(cert_name: &str, peer_name: &str) -> bool {
    if let Some(suffix) = cert_name.strip_prefix("*.") {
        match peer_name.split_once('.') {
            Some((first_label, rest)) => {
                !first_label.is_empty() && rest.eq_ignore_ascii_case(suffix)
            }
            None => false,
        }
    } else {
        cert_name.eq_ignore_ascii_case(peer_name)
    }
}

#[cfg(test)]
mod tests {
    use super::wildcard_match;

    #[test]
    fn wildcard_law_holds() {
        assert!(wildcard_match("*.b.c", "a.b.c"));
        assert!(!wildcard_match("*.b.c", "x.a.b.c"));
        assert!(!wildcard_match("*.b.c", "b.c"));
        assert!(wildcard_match("a.b.c", "A.B.C"));
    }

    #[test]
    fn wildcard_rejects_empty_first_label() {
        assert!(!wildcard_match("*.b.c", ".b.c"));
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        assert!(wildcard_match("Example.COM", "example.com"));
        assert!(!wildcard_match("example.com", "other.com"));
    }
}
