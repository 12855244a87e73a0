use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Generate a webhook signature.
///
/// Format: hex(HMAC-SHA256("{timestamp}.{body}", secret))
pub fn generate_signature(secret: &str, timestamp: i64, body: &str) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;

    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());

    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a webhook signature using constant-time comparison.
///
/// Signatures older (or newer) than `tolerance_secs` relative to `now` are
/// rejected to bound replay of captured deliveries.
pub fn verify_signature(
    secret: &str,
    timestamp: i64,
    body: &str,
    signature: &str,
    now: i64,
    tolerance_secs: i64,
) -> Result<bool, anyhow::Error> {
    if (now - timestamp).abs() > tolerance_secs {
        return Ok(false);
    }

    let expected_signature = generate_signature(secret, timestamp, body)?;

    let expected_bytes = expected_signature.as_bytes();
    let signature_bytes = signature.as_bytes();

    if expected_bytes.len() != signature_bytes.len() {
        return Ok(false);
    }

    Ok(expected_bytes.ct_eq(signature_bytes).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";
    const TIMESTAMP: i64 = 1_700_000_000;
    const BODY: &str = r#"{"event_id":"evt_1","success":true}"#;

    #[test]
    fn test_signature_generation_and_verification() {
        let signature = generate_signature(SECRET, TIMESTAMP, BODY).unwrap();
        assert_eq!(signature.len(), 64);

        let is_valid =
            verify_signature(SECRET, TIMESTAMP, BODY, &signature, TIMESTAMP + 5, 300).unwrap();
        assert!(is_valid);
    }

    #[test]
    fn test_invalid_signature() {
        let signature = generate_signature(SECRET, TIMESTAMP, BODY).unwrap();
        let replacement = if signature.starts_with('a') { "b" } else { "a" };
        let invalid_signature = format!("{}{}", replacement, &signature[1..]);

        let is_valid =
            verify_signature(SECRET, TIMESTAMP, BODY, &invalid_signature, TIMESTAMP, 300).unwrap();
        assert!(!is_valid);
    }

    #[test]
    fn test_tampered_body() {
        let signature = generate_signature(SECRET, TIMESTAMP, BODY).unwrap();

        let modified_body = r#"{"event_id":"evt_1","success":false}"#;
        let is_valid =
            verify_signature(SECRET, TIMESTAMP, modified_body, &signature, TIMESTAMP, 300)
                .unwrap();
        assert!(!is_valid);
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let signature = generate_signature(SECRET, TIMESTAMP, BODY).unwrap();

        let is_valid =
            verify_signature(SECRET, TIMESTAMP, BODY, &signature, TIMESTAMP + 301, 300).unwrap();
        assert!(!is_valid);
    }
}
