//! ActivityPub federation module
//!
//! Handles:
//! - HTTP Signatures (signing, verification helper)
//! - Activity dispatch to remote inboxes
//! - Actor signing key material

mod dispatcher;
pub(crate) mod keys;
mod signature;

pub use dispatcher::{
    ACTIVITY_CONTENT_TYPE, AttemptOutcome, Dispatch, DispatcherOptions, HttpDispatcher,
    classify_status, validate_destination,
};
pub use keys::{DEFAULT_KEY_BITS, generate_pem_keypair, key_id_for_actor};
pub use signature::{
    RequestMetadata, SIGNED_HEADERS, SignatureHeaders, format_http_date, generate_digest,
    parse_private_key, parse_signature_header, sign_request, verify_signature,
};
