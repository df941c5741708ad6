//! Nostr event model for the relay pool.
//!
//! This crate provides:
//! - NIP-01: Basic protocol (events, id hashing, signing, verification)
//! - NIP-65: Relay List Metadata (read/write relay preferences)
//! - NIP-92: Media attachments (`imeta` tags) and media classification
//! - Typed kind dispatch for notes, reactions, picture/video posts, comments,
//!   zap receipts and relay lists
//! - Signer and clock capabilities supplied by the embedding application
//!
//! Nothing here performs I/O.

mod kinds;
mod media;
mod nip01;
mod nip65;
mod signer;

pub use kinds::{
    COMMENT_KIND, Comment, KindError, KindedEvent, MediaPost, PICTURE_KIND, REACTION_KIND,
    Reaction, ReactionType, SHORT_VIDEO_KIND, TEXT_NOTE_KIND, TextNote, VIDEO_KIND,
    ZAP_RECEIPT_KIND, ZapReceipt,
};
pub use media::{MediaAttachment, MediaClass, class_from_mime, class_from_url, media_attachments};
pub use nip01::{
    Event, EventTemplate, KIND_CONTACTS, KIND_METADATA, KIND_SHORT_TEXT_NOTE, KindClassification,
    Nip01Error, UnsignedEvent, classify_kind, get_event_hash, get_public_key_hex,
    serialize_event, sign_event, sort_events, validate_event, verify_event,
};
pub use nip65::{
    Nip65Error, RELAY_LIST_METADATA_KIND, RELAY_TAG, RelayEntry, RelayListMetadata, RelayMarker,
};
pub use signer::{Clock, FixedClock, Keys, NoSigner, Signer, SignerError, SystemClock, sign_template};
