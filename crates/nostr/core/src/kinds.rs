//! Typed views over the event kinds the client understands.
//!
//! [`KindedEvent::parse`] looks the wire kind up in a static dispatch table and
//! runs that kind's parser. Kinds missing from the table become
//! [`KindedEvent::Unrecognized`]; only a known kind with a broken shape is an
//! error.

use crate::media::{MediaAttachment, MediaClass, media_attachments};
use crate::nip01::Event;
use crate::nip65::{Nip65Error, RELAY_LIST_METADATA_KIND, RelayListMetadata};
use thiserror::Error;

pub const TEXT_NOTE_KIND: u16 = 1;
pub const REACTION_KIND: u16 = 7;
pub const PICTURE_KIND: u16 = 20;
pub const VIDEO_KIND: u16 = 21;
pub const SHORT_VIDEO_KIND: u16 = 22;
pub const COMMENT_KIND: u16 = 1111;
pub const ZAP_RECEIPT_KIND: u16 = 9735;

#[derive(Debug, Error)]
pub enum KindError {
    #[error("kind {kind}: missing required tag {tag}")]
    MissingTag { kind: u16, tag: &'static str },

    #[error("kind {kind}: no {expected:?} media attachment")]
    MissingMedia { kind: u16, expected: MediaClass },

    #[error("invalid zap request description: {0}")]
    InvalidZapRequest(String),

    #[error(transparent)]
    RelayList(#[from] Nip65Error),
}

/// Kind 1 note with its NIP-10 thread references.
#[derive(Debug, Clone, PartialEq)]
pub struct TextNote {
    pub event: Event,
    pub root: Option<String>,
    pub reply_to: Option<String>,
    pub mentioned_pubkeys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionType {
    Like,
    Dislike,
    Emoji(String),
}

/// Kind 7 reaction to another event.
#[derive(Debug, Clone, PartialEq)]
pub struct Reaction {
    pub event: Event,
    pub target_event: String,
    pub target_author: Option<String>,
    pub reaction: ReactionType,
}

/// Kind 20 picture post or kind 21/22 video post.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPost {
    pub event: Event,
    pub title: Option<String>,
    pub media: Vec<MediaAttachment>,
}

/// Kind 1111 comment scoped to a root and a parent.
#[derive(Debug, Clone, PartialEq)]
pub struct Comment {
    pub event: Event,
    pub root: String,
    pub root_kind: Option<String>,
    pub parent: String,
    pub parent_kind: Option<String>,
}

/// Kind 9735 zap receipt.
#[derive(Debug, Clone, PartialEq)]
pub struct ZapReceipt {
    pub event: Event,
    pub recipient: String,
    pub sender: Option<String>,
    pub target_event: Option<String>,
    pub bolt11: String,
    pub amount_msats: Option<u64>,
}

/// An event parsed according to its kind.
#[derive(Debug, Clone, PartialEq)]
pub enum KindedEvent {
    TextNote(TextNote),
    Reaction(Reaction),
    ImagePost(MediaPost),
    VideoPost(MediaPost),
    Comment(Comment),
    ZapReceipt(ZapReceipt),
    RelayList(RelayListMetadata),
    Unrecognized(Event),
}

type KindParser = fn(Event) -> Result<KindedEvent, KindError>;

static KIND_PARSERS: &[(u16, KindParser)] = &[
    (TEXT_NOTE_KIND, parse_text_note as KindParser),
    (REACTION_KIND, parse_reaction as KindParser),
    (PICTURE_KIND, parse_image_post as KindParser),
    (VIDEO_KIND, parse_video_post as KindParser),
    (SHORT_VIDEO_KIND, parse_video_post as KindParser),
    (COMMENT_KIND, parse_comment as KindParser),
    (ZAP_RECEIPT_KIND, parse_zap_receipt as KindParser),
    (RELAY_LIST_METADATA_KIND, parse_relay_list as KindParser),
];

impl KindedEvent {
    pub fn parse(event: Event) -> Result<Self, KindError> {
        match KIND_PARSERS.iter().find(|(kind, _)| *kind == event.kind) {
            Some((_, parser)) => parser(event),
            None => Ok(KindedEvent::Unrecognized(event)),
        }
    }

    /// Whether `kind` has a typed parser.
    pub fn is_known_kind(kind: u16) -> bool {
        KIND_PARSERS.iter().any(|(k, _)| *k == kind)
    }
}

fn required_tag(event: &Event, tag: &'static str) -> Result<String, KindError> {
    event
        .tag_value(tag)
        .map(str::to_string)
        .ok_or(KindError::MissingTag {
            kind: event.kind,
            tag,
        })
}

fn parse_text_note(event: Event) -> Result<KindedEvent, KindError> {
    let mut root = None;
    let mut reply_to = None;
    let mut unmarked = Vec::new();

    for tag in event.tags.iter().filter(|t| t.len() >= 2 && t[0] == "e") {
        match tag.get(3).map(String::as_str) {
            Some("root") => root = Some(tag[1].clone()),
            Some("reply") => reply_to = Some(tag[1].clone()),
            Some("mention") => {}
            _ => unmarked.push(tag[1].clone()),
        }
    }

    // Deprecated positional scheme: first e is root, last e is the reply target.
    if root.is_none() && reply_to.is_none() && !unmarked.is_empty() {
        root = unmarked.first().cloned();
        reply_to = unmarked.last().cloned();
    }
    if reply_to.is_none() {
        reply_to = root.clone();
    }

    let mentioned_pubkeys = event.tag_values("p").map(str::to_string).collect();
    Ok(KindedEvent::TextNote(TextNote {
        event,
        root,
        reply_to,
        mentioned_pubkeys,
    }))
}

fn parse_reaction(event: Event) -> Result<KindedEvent, KindError> {
    let target_event = event
        .tag_values("e")
        .last()
        .map(str::to_string)
        .ok_or(KindError::MissingTag {
            kind: event.kind,
            tag: "e",
        })?;
    let target_author = event.tag_values("p").last().map(str::to_string);
    let reaction = match event.content.as_str() {
        "" | "+" => ReactionType::Like,
        "-" => ReactionType::Dislike,
        other => ReactionType::Emoji(other.to_string()),
    };

    Ok(KindedEvent::Reaction(Reaction {
        event,
        target_event,
        target_author,
        reaction,
    }))
}

fn media_post(event: Event, expected: MediaClass) -> Result<MediaPost, KindError> {
    let media: Vec<MediaAttachment> = media_attachments(&event.tags)
        .into_iter()
        .filter(|m| m.class() == expected)
        .collect();
    if media.is_empty() {
        return Err(KindError::MissingMedia {
            kind: event.kind,
            expected,
        });
    }

    let title = event.tag_value("title").map(str::to_string);
    Ok(MediaPost {
        event,
        title,
        media,
    })
}

fn parse_image_post(event: Event) -> Result<KindedEvent, KindError> {
    media_post(event, MediaClass::Image).map(KindedEvent::ImagePost)
}

fn parse_video_post(event: Event) -> Result<KindedEvent, KindError> {
    media_post(event, MediaClass::Video).map(KindedEvent::VideoPost)
}

fn parse_comment(event: Event) -> Result<KindedEvent, KindError> {
    let scoped = |names: [&'static str; 3]| {
        names
            .iter()
            .find_map(|name| event.tag_value(name).map(str::to_string))
    };

    let root = scoped(["E", "A", "I"]).ok_or(KindError::MissingTag {
        kind: event.kind,
        tag: "E",
    })?;
    let parent = scoped(["e", "a", "i"]).ok_or(KindError::MissingTag {
        kind: event.kind,
        tag: "e",
    })?;
    let root_kind = event.tag_value("K").map(str::to_string);
    let parent_kind = event.tag_value("k").map(str::to_string);

    Ok(KindedEvent::Comment(Comment {
        event,
        root,
        root_kind,
        parent,
        parent_kind,
    }))
}

fn parse_zap_receipt(event: Event) -> Result<KindedEvent, KindError> {
    let recipient = required_tag(&event, "p")?;
    let bolt11 = required_tag(&event, "bolt11")?;
    let description = required_tag(&event, "description")?;

    let zap_request: Event = serde_json::from_str(&description)
        .map_err(|e| KindError::InvalidZapRequest(e.to_string()))?;
    let amount_msats = zap_request
        .tag_value("amount")
        .and_then(|amount| amount.parse().ok());
    let sender = event
        .tag_value("P")
        .map(str::to_string)
        .or_else(|| Some(zap_request.pubkey.clone()));
    let target_event = event.tag_value("e").map(str::to_string);

    Ok(KindedEvent::ZapReceipt(ZapReceipt {
        event,
        recipient,
        sender,
        target_event,
        bolt11,
        amount_msats,
    }))
}

fn parse_relay_list(event: Event) -> Result<KindedEvent, KindError> {
    Ok(KindedEvent::RelayList(RelayListMetadata::from_event(&event)?))
}
