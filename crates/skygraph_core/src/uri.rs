/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Canonical resource uris look like `at://did:plc:xyz/<collection>/<rkey>`.
//! Storage keeps a dehydrated form that drops the redundant `did:` prefix
//! and the collection; the collection is restored from the owning table's
//! record type at read time.

/// `at://did:plc:xyz/app.bsky.feed.post/rkey` -> `plc:xyz/rkey`.
/// Uris that do not match the canonical shape pass through unchanged.
pub fn dehydrate_uri(uri: &str) -> String {
    if uri.len() < 9 {
        return uri.to_string();
    }
    let tail = &uri[9..];
    let mut slashes = tail.match_indices('/').map(|(i, _)| i);
    let (Some(first), Some(second)) = (slashes.next(), slashes.next()) else {
        return uri.to_string();
    };
    if slashes.next().is_some() {
        return uri.to_string();
    }
    format!("{}/{}", &tail[..first], &tail[second + 1..])
}

/// Reverse of [`dehydrate_uri`], given the collection from context.
pub fn hydrate_uri(dehydrated: &str, collection: &str) -> String {
    let mut slashes = dehydrated.match_indices('/').map(|(i, _)| i);
    let Some(first) = slashes.next() else {
        return dehydrated.to_string();
    };
    if slashes.next().is_some() || first == 0 || first == dehydrated.len() - 1 {
        return dehydrated.to_string();
    }
    format!(
        "at://did:{}/{}/{}",
        &dehydrated[..first],
        collection,
        &dehydrated[first + 1..]
    )
}

/// Actor identifier slice of a canonical uri, or `""`.
pub fn parse_did(uri: &str) -> String {
    if uri.len() <= 5 {
        return String::new();
    }
    let parts: Vec<&str> = uri[5..].splitn(3, '/').collect();
    if parts.len() != 3 {
        return String::new();
    }
    parts[0].to_string()
}

/// Record-key slice of a canonical uri, or `""`.
pub fn parse_rkey(uri: &str) -> String {
    if uri.len() < 5 {
        return String::new();
    }
    let tail = &uri[5..];
    let mut slashes = tail.match_indices('/').map(|(i, _)| i);
    let (Some(_), Some(second)) = (slashes.next(), slashes.next()) else {
        return String::new();
    };
    if slashes.next().is_some() {
        return String::new();
    }
    tail[second + 1..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const URI: &str = "at://did:plc:wzsilnxf24ehtmmc3gssy5bu/app.bsky.feed.post/3kexw5q5mix22";

    #[test]
    fn dehydrate_strips_prefix_and_collection() {
        assert_eq!(
            dehydrate_uri(URI),
            "plc:wzsilnxf24ehtmmc3gssy5bu/3kexw5q5mix22"
        );
    }

    #[test]
    fn hydrate_reverses_dehydrate() {
        let dehydrated = dehydrate_uri(URI);
        assert_eq!(hydrate_uri(&dehydrated, "app.bsky.feed.post"), URI);
    }

    #[test]
    fn malformed_input_passes_through() {
        assert_eq!(dehydrate_uri("short"), "short");
        assert_eq!(dehydrate_uri("did:plc:abc"), "did:plc:abc");
        assert_eq!(hydrate_uri("no-slash-here", "app.bsky.feed.post"), "no-slash-here");
        assert_eq!(hydrate_uri("/leading", "app.bsky.feed.post"), "/leading");
    }

    #[test]
    fn parse_did_and_rkey() {
        assert_eq!(parse_did(URI), "did:plc:wzsilnxf24ehtmmc3gssy5bu");
        assert_eq!(parse_rkey(URI), "3kexw5q5mix22");
        assert_eq!(parse_did("at://x"), "");
        assert_eq!(parse_rkey("at://x"), "");
    }

    #[test]
    fn did_web_uris_work_too() {
        let uri = "at://did:web:example.com/app.bsky.feed.generator/firehose";
        assert_eq!(dehydrate_uri(uri), "web:example.com/firehose");
        assert_eq!(
            hydrate_uri("web:example.com/firehose", "app.bsky.feed.generator"),
            uri
        );
    }
}
