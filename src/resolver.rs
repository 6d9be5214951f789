//! Identifier resolution.
//!
//! Parses free-form user input — comma/`vs`-separated text, store URLs, bare
//! ids — into a normalized, deduplicated list of [`AppIdentifier`]s. This
//! layer never fails: malformed input degrades to a best-effort identifier so
//! the rest of the pipeline can report a per-app fetch error instead of the
//! whole request dying on parse.

use url::Url;

use crate::models::{AppIdentifier, Platform};

/// Comparison keywords recognized between identifiers (case-sensitive).
const DELIMITERS: [&str; 2] = [" vs ", " versus "];

/// Extract bare app ids from free-form input, in first-seen order.
pub fn extract_app_ids(input: &str) -> Vec<String> {
    resolve_identifiers(input)
        .into_iter()
        .map(|ident| ident.app_id)
        .collect()
}

/// Resolve free-form input into deduplicated identifiers.
///
/// Splits on `,` and the `vs`/`versus` keywords when present, otherwise the
/// whole input is one identifier. Duplicate app ids keep their first-seen
/// position.
pub fn resolve_identifiers(input: &str) -> Vec<AppIdentifier> {
    let mut out: Vec<AppIdentifier> = Vec::new();
    for piece in split_pieces(input) {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let ident = resolve_one(piece);
        if !out.iter().any(|existing| existing.app_id == ident.app_id) {
            out.push(ident);
        }
    }
    out
}

/// Resolve a pre-split list of segments (e.g. URL path parts), deduplicated.
pub fn resolve_segments(segments: &[String]) -> Vec<AppIdentifier> {
    let mut out: Vec<AppIdentifier> = Vec::new();
    for segment in segments {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let ident = resolve_one(segment);
        if !out.iter().any(|existing| existing.app_id == ident.app_id) {
            out.push(ident);
        }
    }
    out
}

/// Union of identifiers across every user turn of a conversation, oldest
/// first, so previously-analyzed apps stay in scope when the user asks a
/// follow-up comparison.
pub fn resolve_conversation(turns: &[String]) -> Vec<AppIdentifier> {
    let mut out: Vec<AppIdentifier> = Vec::new();
    for turn in turns {
        for ident in resolve_identifiers(turn) {
            if !out.iter().any(|existing| existing.app_id == ident.app_id) {
                out.push(ident);
            }
        }
    }
    out
}

fn split_pieces(input: &str) -> Vec<String> {
    let has_delimiter =
        input.contains(',') || DELIMITERS.iter().any(|keyword| input.contains(keyword));
    if !has_delimiter {
        return vec![input.to_string()];
    }

    let mut pieces: Vec<String> = input.split(',').map(|s| s.to_string()).collect();
    for keyword in DELIMITERS {
        pieces = pieces
            .into_iter()
            .flat_map(|piece| {
                piece
                    .split(keyword)
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
            })
            .collect();
    }
    pieces
}

/// Resolve one trimmed piece. Never fails: URL parse errors and unrecognized
/// hosts fall back to the raw input with a best-guess platform.
fn resolve_one(piece: &str) -> AppIdentifier {
    if !piece.contains('/') && !piece.contains("https") {
        // Already a bare id.
        return AppIdentifier {
            raw_input: piece.to_string(),
            app_id: piece.to_string(),
            platform: platform_from_id(piece),
        };
    }

    if let Some((app_id, platform)) = parse_store_url(piece) {
        return AppIdentifier {
            raw_input: piece.to_string(),
            app_id,
            platform,
        };
    }

    AppIdentifier {
        raw_input: piece.to_string(),
        app_id: piece.to_string(),
        platform: platform_from_id(piece),
    }
}

fn parse_store_url(piece: &str) -> Option<(String, Platform)> {
    let url = Url::parse(piece).ok()?;
    let host = url.host_str()?;

    if host.ends_with("play.google.com") {
        let id = url
            .query_pairs()
            .find(|(key, _)| key == "id")
            .map(|(_, value)| value.into_owned())?;
        return Some((id, Platform::GooglePlay));
    }

    if host.ends_with("apps.apple.com") || host.ends_with("itunes.apple.com") {
        if let Some(id) = url
            .query_pairs()
            .find(|(key, _)| key == "id")
            .map(|(_, value)| value.into_owned())
        {
            return Some((id, Platform::AppStore));
        }
        // Path form: /us/app/some-name/id553834731
        for segment in url.path_segments()? {
            if let Some(digits) = segment.strip_prefix("id") {
                if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                    return Some((digits.to_string(), Platform::AppStore));
                }
            }
        }
    }

    None
}

/// Guess the platform from the shape of a bare id: all digits is an App Store
/// numeric id, dotted lowercase is an Android package name. Anything else
/// defaults to Google Play.
fn platform_from_id(id: &str) -> Platform {
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
        return Platform::AppStore;
    }
    Platform::GooglePlay
}
