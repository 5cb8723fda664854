//! Minimal XML scanning for object-store list responses.
//!
//! S3 ListObjectsV2 and Azure List Blobs both answer with flat, known-shape
//! XML; scanning for named tags is all the engine needs from either.

/// All text blocks enclosed by `<tag>...</tag>`, in document order.
pub(crate) fn tag_blocks<'a>(body: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut blocks = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        match after.find(&close) {
            Some(end) => {
                blocks.push(&after[..end]);
                rest = &after[end + close.len()..];
            }
            None => break,
        }
    }
    blocks
}

/// First `<tag>...</tag>` value inside a block, unescaped.
pub(crate) fn tag_value(block: &str, tag: &str) -> Option<String> {
    tag_blocks(block, tag).first().map(|v| unescape(v))
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_blocks_in_order() {
        let body = "<R><Contents><Key>a</Key></Contents><Contents><Key>b</Key></Contents></R>";
        let blocks = tag_blocks(body, "Contents");
        assert_eq!(blocks.len(), 2);
        assert_eq!(tag_value(blocks[0], "Key").as_deref(), Some("a"));
        assert_eq!(tag_value(blocks[1], "Key").as_deref(), Some("b"));
    }

    #[test]
    fn test_unescapes_entities() {
        let body = "<Key>a&amp;b&lt;c&gt;.bin</Key>";
        assert_eq!(tag_value(body, "Key").as_deref(), Some("a&b<c>.bin"));
    }

    #[test]
    fn test_missing_tag() {
        assert!(tag_value("<R></R>", "Key").is_none());
        assert!(tag_blocks("<R><Open>", "Open").is_empty());
    }
}
