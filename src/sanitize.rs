/// Inline formatting markers that survive sanitization. Everything else
/// that looks like markup is stripped.
const ALLOWED_TAGS: [&str; 5] = ["b", "i", "em", "strong", "u"];

/// Strips markup from a message body, keeping only the whitelisted inline
/// tags. A `<` that does not open a tag (no closing `>`, or not followed by
/// a tag name) is literal text.
pub fn sanitize_body(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;

    while let Some(start) = rest.find('<') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let tag_end = after.find('>');
        match tag_end {
            Some(end) if looks_like_tag(&after[..end]) => {
                if let Some(name) = allowed_tag(&after[..end]) {
                    out.push('<');
                    out.push_str(&name);
                    out.push('>');
                }
                rest = &after[end + 1..];
            }
            _ => {
                // Not markup: keep the `<` and keep scanning.
                out.push('<');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// A tag body starts with an optional `/` followed by a letter.
fn looks_like_tag(tag: &str) -> bool {
    tag.strip_prefix('/')
        .unwrap_or(tag)
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic())
}

/// Returns the normalized tag (`b`, `/b`, ...) when it is exactly a
/// whitelisted inline marker with no attributes.
fn allowed_tag(tag: &str) -> Option<String> {
    let (slash, name) = match tag.strip_prefix('/') {
        Some(name) => ("/", name),
        None => ("", tag),
    };
    let name = name.trim().to_ascii_lowercase();
    if ALLOWED_TAGS.contains(&name.as_str()) {
        Some(format!("{slash}{name}"))
    } else {
        None
    }
}
