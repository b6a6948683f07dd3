//! Certificate verification via the system openssl CLI
//!
//! No crypto runs in-process. Chain verification, certificate dumps, and
//! public-key dumps all shell out to `openssl`, and assertions compare its
//! text output.

use std::path::Path;

use crate::error::TokenError;
use crate::exec::Invocation;

/// Verify `subject` against trust anchor `anchor`, accepting self-signed
/// signatures so a root can be checked against itself.
pub async fn verify_chain(anchor: &str, subject: &str, cwd: &Path) -> Result<(), TokenError> {
    Invocation::new("openssl")
        .args(["verify", "-check_ss_sig", "-CAfile", anchor, subject])
        .current_dir(cwd)
        .checked()
        .await?;
    Ok(())
}

/// Human-readable dump of a PEM certificate.
pub async fn certificate_text(cert: &str, cwd: &Path) -> Result<String, TokenError> {
    let output = Invocation::new("openssl")
        .args(["x509", "-noout", "-text", "-in", cert])
        .current_dir(cwd)
        .checked()
        .await?;
    Ok(output.stdout_text())
}

/// Human-readable dump of a DER-encoded EC public key, as read back from the
/// token.
pub async fn ec_public_key_text(der: Vec<u8>) -> Result<String, TokenError> {
    let output = Invocation::new("openssl")
        .args(["ec", "-inform", "der", "-pubin", "-text", "-noout"])
        .stdin(der)
        .checked()
        .await?;
    Ok(output.stdout_text())
}

/// Check that the key openssl dumped from the token appears verbatim in the
/// certificate dump, proving the certificate carries the token-held key.
///
/// Only the first line of the EC point is compared. Its leading octet is the
/// uncompressed-point tag, which describes the encoding rather than the key,
/// so it is excluded from the match.
pub fn cert_embeds_token_key(cert_text: &str, pubkey_text: &str) -> Result<(), TokenError> {
    let fragment = ec_point_first_line(pubkey_text)?;
    if cert_text.contains(&fragment) {
        Ok(())
    } else {
        Err(TokenError::AssertionFailed(format!(
            "public key fragment {fragment:?} not present in certificate text"
        )))
    }
}

fn ec_point_first_line(pubkey_text: &str) -> Result<String, TokenError> {
    let mut lines = pubkey_text.lines();
    for line in lines.by_ref() {
        if line.trim() == "pub:" {
            break;
        }
    }
    let first = lines
        .next()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .ok_or_else(|| {
            TokenError::AssertionFailed("no EC point found after pub: marker".to_string())
        })?;
    let fragment = first.strip_prefix("04:").ok_or_else(|| {
        TokenError::AssertionFailed(format!("EC point is not uncompressed: {first:?}"))
    })?;
    Ok(fragment.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUBKEY_DUMP: &str = "\
read EC key
Private-Key: (256 bit)
pub:
    04:1f:2e:3d:4c:5b:6a:79:88:97:a6:b5:c4:d3:e2:
    f1:00:0f:1e:2d:3c:4b:5a:69:78:87:96:a5:b4:c3:
    d2:e1:f0
ASN1 OID: prime256v1
";

    #[test]
    fn test_point_fragment_drops_encoding_tag() {
        let fragment = ec_point_first_line(PUBKEY_DUMP).unwrap();
        assert_eq!(
            fragment,
            "1f:2e:3d:4c:5b:6a:79:88:97:a6:b5:c4:d3:e2:"
        );
    }

    #[test]
    fn test_embedded_key_accepted() {
        let cert_text = "\
            Subject Public Key Info:\n\
                Public Key Algorithm: id-ecPublicKey\n\
                    pub:\n\
                        04:1f:2e:3d:4c:5b:6a:79:88:97:a6:b5:c4:d3:e2:\n\
                        f1:00:0f:1e:2d:3c:4b:5a:69:78:87:96:a5:b4:c3:\n\
                        d2:e1:f0\n";
        cert_embeds_token_key(cert_text, PUBKEY_DUMP).unwrap();
    }

    #[test]
    fn test_unrelated_key_rejected() {
        let cert_text = "pub:\n    04:aa:bb:cc:dd:ee:ff:00:11:22:33:44:55:66:77:\n";
        let err = cert_embeds_token_key(cert_text, PUBKEY_DUMP).unwrap_err();
        assert!(matches!(err, TokenError::AssertionFailed(_)));
    }

    #[test]
    fn test_compressed_point_rejected() {
        let dump = "pub:\n    03:1f:2e:3d:4c:5b:6a:79:88:97:a6:b5:c4:d3:e2:\n";
        let err = ec_point_first_line(dump).unwrap_err();
        assert!(matches!(err, TokenError::AssertionFailed(_)));
    }

    #[test]
    fn test_missing_marker_rejected() {
        let err = ec_point_first_line("read EC key\nASN1 OID: prime256v1\n").unwrap_err();
        assert!(matches!(err, TokenError::AssertionFailed(_)));
    }
}
