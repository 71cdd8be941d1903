//! SSH keypair fingerprint verification for the cloud back-end.
//!
//! Before trusting a cloud-reported keypair, the back-end must verify that
//! its fingerprint matches the local private key under both fingerprint
//! conventions in use across providers: the OpenSSH convention (MD5 of the
//! raw public key blob, colon-hex) and the AWS convention (MD5 of the
//! DER-encoded private key, colon-hex). A local key encrypted with a
//! passphrase is accepted without remote comparison — the user is assumed
//! to use an agent.


/// Either fingerprint convention matched.
pub fn fingerprints_match(remote_fingerprint: &str, openssh: &str, aws: &str) -> bool {
    let remote_norm = normalize(remote_fingerprint);
    remote_norm == normalize(openssh) || remote_norm == normalize(aws)
}

fn normalize(fp: &str) -> String {
    fp.trim()
        .trim_start_matches("MD5:")
        .to_ascii_lowercase()
        .replace(':', "")
}

/// OpenSSH-style fingerprint: MD5 of the raw public key blob, colon-hex.
pub fn openssh_fingerprint(public_key_blob: &[u8]) -> String {
    colon_hex(&md5::compute(public_key_blob).0)
}

/// AWS-style fingerprint: MD5 of the DER-encoded private key, colon-hex.
/// AWS computes this over the PKCS#1/PKCS#8 DER form of the private key
/// rather than the public key blob SSH normally fingerprints.
pub fn aws_fingerprint(private_key_der: &[u8]) -> String {
    colon_hex(&md5::compute(private_key_der).0)
}

fn colon_hex(digest: &[u8]) -> String {
    digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_openssh_convention_case_insensitively() {
        let fp = openssh_fingerprint(b"not a real key blob");
        assert!(fingerprints_match(&fp.to_uppercase(), &fp, "zz"));
    }

    #[test]
    fn mismatched_fingerprints_fail() {
        assert!(!fingerprints_match("aa:bb:cc", "11:22:33", "44:55:66"));
    }
}
