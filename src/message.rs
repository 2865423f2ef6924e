//! Message Pipeline data types and RFC 5322 parsing
//!
//! A backend's raw `BODY[]` bytes become a [`Message`] here: headers and
//! text bodies are decoded eagerly, attachment payloads are not — only
//! their [`AttachmentMeta`] is kept until a caller asks for one
//! specifically (spec.md §4.8, §3).

use crate::account::Provider;
use crate::error::{Error, Result};
use crate::flag::Flag;
use chrono::{DateTime, Utc};
use mailparse::{MailAddr, MailHeaderMap, ParsedMail, addrparse};

/// Metadata for one attachment part, without its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentMeta {
    /// Position of this part in a depth-first walk of the MIME tree.
    /// Stable for a given raw message, used to fetch the part later.
    pub index: usize,
    pub filename: Option<String>,
    pub content_type: String,
    pub size_bytes: usize,
}

/// A single attachment's metadata plus its decoded bytes.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub meta: AttachmentMeta,
    pub data: Vec<u8>,
}

/// A parsed message as held in the Cache Layer (spec.md §3, §4.7).
#[derive(Debug, Clone)]
pub struct Message {
    /// Stable identity: the RFC 5322 `Message-Id` if present, else
    /// `uid-<backend>-<uid>`. Unique within the global store.
    pub id: String,
    pub uid: u32,
    pub backend: String,
    pub from: String,
    pub from_name: Option<String>,
    pub to: Vec<String>,
    pub subject: String,
    pub date: DateTime<Utc>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub attachments: Vec<AttachmentMeta>,
    pub flags: Vec<Flag>,
    pub provider: Provider,
    /// True when `to` is not exactly the backend's own address. Drives
    /// the anonymous-viewer visibility filter (spec.md §4.9, §8).
    pub is_alias: bool,
}

/// Parse one backend's raw `BODY[]` bytes into a [`Message`].
///
/// # Errors
///
/// Returns `Error::Parse` if the bytes aren't valid RFC 5322.
pub fn parse_message(
    uid: u32,
    backend: &str,
    provider: Provider,
    raw: &[u8],
    flags: Vec<Flag>,
) -> Result<Message> {
    let parsed = mailparse::parse_mail(raw).map_err(|e| Error::Parse(e.to_string()))?;

    let (from, from_name) = first_address(&parsed, "From");
    let to = parse_address_list(&parsed, "To");
    let subject = header(&parsed, "Subject").unwrap_or_default();
    let date = header(&parsed, "Date")
        .and_then(|d| mailparse::dateparse(&d).ok())
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .unwrap_or_else(Utc::now);
    let id = header(&parsed, "Message-Id")
        .map(|v| v.trim_matches(['<', '>']).to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| format!("uid-{backend}-{uid}"));

    let mut body_text = None;
    let mut body_html = None;
    let mut attachments = Vec::new();
    let mut next_index = 0;
    walk_parts(
        &parsed,
        &mut next_index,
        &mut body_text,
        &mut body_html,
        &mut attachments,
    );

    let is_alias = !to.iter().any(|t| t.eq_ignore_ascii_case(backend));

    Ok(Message {
        id,
        uid,
        backend: backend.to_string(),
        from,
        from_name,
        to,
        subject,
        date,
        body_text,
        body_html,
        attachments,
        flags,
        provider,
        is_alias,
    })
}

/// Re-parse raw message bytes and decode a single attachment by its
/// stable part index (spec.md §4.9, `getAttachment`).
///
/// # Errors
///
/// `Error::Parse` if the bytes don't parse, or `Error::NotFound` if no
/// part exists at `index`.
pub fn extract_attachment(raw: &[u8], index: usize) -> Result<Attachment> {
    let parsed = mailparse::parse_mail(raw).map_err(|e| Error::Parse(e.to_string()))?;
    let mut cursor = 0;
    find_attachment(&parsed, &mut cursor, index)
        .ok_or(Error::NotFound)
        .and_then(|part| {
            let data = part.get_body_raw().map_err(|e| Error::Parse(e.to_string()))?;
            Ok(Attachment {
                meta: attachment_meta(part, index),
                data,
            })
        })
}

fn header(mail: &ParsedMail<'_>, name: &str) -> Option<String> {
    mail.headers.get_first_value(name)
}

/// The first address and display name out of a header (e.g. the sender
/// of `From`). Falls back to the raw header value with no name if it
/// doesn't parse as an address list.
fn first_address(mail: &ParsedMail<'_>, name: &str) -> (String, Option<String>) {
    let Some(raw) = mail.headers.get_first_value(name) else {
        return (String::new(), None);
    };
    let Ok(list) = addrparse(&raw) else {
        return (raw, None);
    };
    match list.into_iter().next() {
        Some(MailAddr::Single(info)) => (info.addr, info.display_name),
        Some(MailAddr::Group(group)) => group
            .addrs
            .into_iter()
            .next()
            .map_or((String::new(), None), |info| (info.addr, info.display_name)),
        None => (raw, None),
    }
}

fn parse_address_list(mail: &ParsedMail<'_>, name: &str) -> Vec<String> {
    let Some(raw) = mail.headers.get_first_value(name) else {
        return Vec::new();
    };
    let Ok(list) = addrparse(&raw) else {
        return vec![raw];
    };
    list.into_iter()
        .flat_map(|addr| match addr {
            mailparse::MailAddr::Single(info) => vec![info.addr],
            mailparse::MailAddr::Group(group) => {
                group.addrs.into_iter().map(|i| i.addr).collect()
            }
        })
        .collect()
}

fn is_attachment_part(part: &ParsedMail<'_>) -> bool {
    part.get_content_disposition().disposition == mailparse::DispositionType::Attachment
        || part.ctype.params.get("name").is_some()
        || part
            .get_content_disposition()
            .params
            .get("filename")
            .is_some()
}

fn part_filename(part: &ParsedMail<'_>) -> Option<String> {
    part.get_content_disposition()
        .params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned())
}

/// Depth-first walk over the MIME tree, assigning each leaf a stable
/// index and routing it to a body slot or the attachment list.
fn walk_parts(
    part: &ParsedMail<'_>,
    next_index: &mut usize,
    body_text: &mut Option<String>,
    body_html: &mut Option<String>,
    attachments: &mut Vec<AttachmentMeta>,
) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            walk_parts(sub, next_index, body_text, body_html, attachments);
        }
        return;
    }

    let index = *next_index;
    *next_index += 1;

    if is_attachment_part(part) {
        attachments.push(attachment_meta(part, index));
        return;
    }

    match part.ctype.mimetype.as_str() {
        "text/plain" if body_text.is_none() => {
            *body_text = part.get_body().ok();
        }
        "text/html" if body_html.is_none() => {
            *body_html = part.get_body().ok();
        }
        _ => {
            if !part.ctype.mimetype.starts_with("multipart/") {
                attachments.push(attachment_meta(part, index));
            }
        }
    }
}

fn attachment_meta(part: &ParsedMail<'_>, index: usize) -> AttachmentMeta {
    let size_bytes = part.get_body_raw().map(|b| b.len()).unwrap_or(0);
    AttachmentMeta {
        index,
        filename: part_filename(part),
        content_type: part.ctype.mimetype.clone(),
        size_bytes,
    }
}

fn find_attachment<'a>(
    part: &'a ParsedMail<'a>,
    cursor: &mut usize,
    target: usize,
) -> Option<&'a ParsedMail<'a>> {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            if let Some(found) = find_attachment(sub, cursor, target) {
                return Some(found);
            }
        }
        return None;
    }

    let index = *cursor;
    *cursor += 1;
    if index == target { Some(part) } else { None }
}
