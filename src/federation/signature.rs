//! HTTP Signatures for outbound delivery
//!
//! Implements the draft-cavage scheme ActivityPub servers expect:
//! https://docs.joinmastodon.org/spec/security/

use crate::error::AppError;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha2::{Digest, Sha256};

/// Headers covered by every signature this module produces, in order.
pub const SIGNED_HEADERS: [&str; 4] = ["(request-target)", "host", "date", "digest"];

/// Maximum clock skew accepted by [`verify_signature`], in seconds.
const MAX_DATE_SKEW_SECS: i64 = 300;

/// The parts of an outbound request that go into the signing string
#[derive(Debug, Clone)]
pub struct RequestMetadata<'a> {
    /// HTTP method (e.g., "POST")
    pub method: &'a str,
    /// Full destination URL
    pub url: &'a url::Url,
    /// Value for the Date header
    pub date: DateTime<Utc>,
    /// Exact request body bytes
    pub body: &'a [u8],
}

impl RequestMetadata<'_> {
    /// Host header value; includes the port when it is not the scheme default.
    pub fn host(&self) -> Result<String, AppError> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;

        Ok(match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        })
    }

    pub fn request_target(&self) -> String {
        let path = self.url.path();
        let path_and_query = match self.url.query() {
            Some(q) => format!("{}?{}", path, q),
            None => path.to_string(),
        };
        format!("{} {}", self.method.to_lowercase(), path_and_query)
    }

    /// Date header value (RFC 7231 IMF-fixdate)
    pub fn http_date(&self) -> String {
        format_http_date(self.date)
    }
}

/// Headers to add for signed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value
    pub date: String,
    /// Digest header value
    pub digest: String,
    /// Host the signature was computed over
    pub host: String,
}

pub fn format_http_date(date: DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parse an RSA private key, PKCS#8 first and PKCS#1 as fallback.
pub fn parse_private_key(private_key_pem: &str) -> Result<RsaPrivateKey, AppError> {
    RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .or_else(|pkcs8_err| {
            RsaPrivateKey::from_pkcs1_pem(private_key_pem).map_err(|_| pkcs8_err.to_string())
        })
        .map_err(|e| AppError::InvalidKey(format!("Invalid private key: {}", e)))
}

/// Sign an outbound request
///
/// Deterministic for identical inputs: RSASSA-PKCS1-v1_5 over SHA-256 takes
/// no randomness, and the Date comes from `metadata` rather than the clock.
///
/// # Arguments
/// * `private_key_pem` - RSA private key in PEM format
/// * `key_id` - Full URL to the public key (actor#main-key)
/// * `metadata` - Method, URL, date and body of the request
///
/// # Errors
/// - `InvalidKey` if the key cannot be parsed
/// - `Signing` if the RSA backend fails
/// - `Validation` if the URL has no host
pub fn sign_request(
    private_key_pem: &str,
    key_id: &str,
    metadata: &RequestMetadata<'_>,
) -> Result<SignatureHeaders, AppError> {
    let private_key = parse_private_key(private_key_pem)?;

    let host = metadata.host()?;
    let date = metadata.http_date();
    let digest = generate_digest(metadata.body);

    let signing_string = [
        format!("(request-target): {}", metadata.request_target()),
        format!("host: {}", host),
        format!("date: {}", date),
        format!("digest: {}", digest),
    ]
    .join("\n");

    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(private_key);
    let signature = signing_key
        .try_sign(signing_string.as_bytes())
        .map_err(|e| AppError::Signing(e.to_string()))?;
    let signature_b64 = BASE64.encode(signature.to_bytes());

    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        SIGNED_HEADERS.join(" "),
        signature_b64
    );

    Ok(SignatureHeaders {
        signature: signature_header,
        date,
        digest,
        host,
    })
}

/// Verify an HTTP request signature
///
/// Checks a request as a receiving inbox would, against the sender's
/// advertised public key.
///
/// # Arguments
/// * `method` - HTTP method
/// * `path` - Request path and query
/// * `headers` - All request headers
/// * `body` - Request body (for digest verification)
/// * `public_key_pem` - RSA public key in PEM format
/// * `now` - Reference time for the Date freshness check
///
/// # Errors
/// `Validation` describing the first check that failed
pub fn verify_signature(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    // 1. Parse Signature header
    let signature_header = header_str(headers, "signature", "Signature")?;
    let parsed = parse_signature_header(signature_header)?;

    // 2. Validate algorithm and required signed headers.
    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(AppError::Validation(format!(
            "Unsupported signature algorithm: {}",
            parsed.algorithm
        )));
    }

    for required in ["(request-target)", "host", "date"] {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(AppError::Validation(format!(
                "Signed headers must include: {}",
                required
            )));
        }
    }

    if body.is_some() && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(AppError::Validation(
            "Signed headers must include: digest".to_string(),
        ));
    }

    // 3. Verify Date is recent.
    let date_str = header_str(headers, "date", "Date")?;
    let date = DateTime::parse_from_rfc2822(date_str)
        .map_err(|_| AppError::Validation("Invalid Date format".to_string()))?;

    if (now.timestamp() - date.timestamp()).abs() > MAX_DATE_SKEW_SECS {
        return Err(AppError::Validation(
            "Date header too old or in future".to_string(),
        ));
    }

    // 4. If body present, verify Digest.
    if let Some(body_data) = body {
        let digest_str = header_str(headers, "digest", "Digest")?;
        if digest_str != generate_digest(body_data) {
            return Err(AppError::Validation("Digest mismatch".to_string()));
        }
    }

    // 5. Reconstruct signing string.
    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path),
            "host" | "date" | "digest" => {
                header_str(headers, header_name, header_name)?.to_string()
            }
            _ => {
                return Err(AppError::Validation(format!(
                    "Unsupported header in signature: {}",
                    header_name
                )));
            }
        };

        signing_parts.push(format!("{}: {}", header_name, value));
    }
    let signing_string = signing_parts.join("\n");

    // 6. Verify RSA signature.
    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| AppError::Validation("Invalid signature encoding".to_string()))?;

    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| AppError::Validation(format!("Invalid public key: {}", e)))?;
    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(public_key);

    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| AppError::Validation(format!("Invalid signature format: {}", e)))?;

    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| AppError::Validation("Signature verification failed".to_string()))?;

    Ok(())
}

fn header_str<'h>(
    headers: &'h http::HeaderMap,
    name: &str,
    display: &str,
) -> Result<&'h str, AppError> {
    headers
        .get(name)
        .ok_or_else(|| AppError::Validation(format!("Missing {} header", display)))?
        .to_str()
        .map_err(|_| AppError::Validation(format!("Invalid {} header", display)))
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256)
    pub algorithm: String,
    /// Signed header names
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"');

            match key {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_string()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {}
            }
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| AppError::Validation("Missing keyId".to_string()))?,
        algorithm: algorithm
            .ok_or_else(|| AppError::Validation("Missing algorithm".to_string()))?,
        headers: headers.ok_or_else(|| AppError::Validation("Missing headers".to_string()))?,
        signature: signature
            .ok_or_else(|| AppError::Validation("Missing signature".to_string()))?,
    })
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}
