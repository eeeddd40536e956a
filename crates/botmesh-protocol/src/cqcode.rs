//! String dialect: segments flattened into one string with inline
//! `[CQ:type,key=value,...]` directives.
//!
//! `&`, `[`, `]` and `,` are escaped as `&amp;`, `&#91;`, `&#93;` and `&#44;`
//! in both plain text and directive values, so [`unescape`] always inverts
//! [`escape`]. Decoding is lenient: an unterminated directive is kept as text.

use serde_json::Value;

use crate::message::{value_to_string, Segment};

const ESCAPES: [(char, &str); 4] = [('&', "&amp;"), ('[', "&#91;"), (']', "&#93;"), (',', "&#44;")];

pub fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match ESCAPES.iter().find(|(ch, _)| *ch == c) {
            Some((_, entity)) => out.push_str(entity),
            None => out.push(c),
        }
    }
    out
}

/// Single pass, so `&amp;#91;` decodes to the literal `&#91;`.
pub fn unescape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        match ESCAPES.iter().find(|(_, entity)| tail.starts_with(entity)) {
            Some((ch, entity)) => {
                out.push(*ch);
                rest = &tail[entity.len()..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Flatten segments into the string dialect.
pub fn encode(segments: &[Segment]) -> String {
    let mut out = String::new();
    for segment in segments {
        if let Some(text) = segment.as_text() {
            out.push_str(&escape(text));
            continue;
        }
        out.push_str("[CQ:");
        out.push_str(&segment.kind);
        let mut fields: Vec<_> = segment.data.iter().collect();
        fields.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in fields {
            out.push(',');
            out.push_str(key);
            out.push('=');
            out.push_str(&escape(&value_to_string(value)));
        }
        out.push(']');
    }
    out
}

/// Parse a string-dialect message back into segments.
pub fn decode(input: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut rest = input;

    while let Some(start) = rest.find("[CQ:") {
        if start > 0 {
            segments.push(Segment::text(unescape(&rest[..start])));
        }
        let directive = &rest[start..];
        let Some(end) = directive.find(']') else {
            segments.push(Segment::text(unescape(directive)));
            rest = "";
            break;
        };
        match parse_directive(&directive[4..end]) {
            Some(segment) => segments.push(segment),
            None => segments.push(Segment::text(unescape(&directive[..=end]))),
        }
        rest = &directive[end + 1..];
    }

    if !rest.is_empty() {
        segments.push(Segment::text(unescape(rest)));
    }
    segments
}

fn parse_directive(body: &str) -> Option<Segment> {
    let mut parts = body.split(',');
    let kind = parts.next().map(str::trim).filter(|k| !k.is_empty())?;
    let mut segment = Segment::new(kind);
    for part in parts {
        // A pair without '=' cannot be produced by `encode`; skip it.
        if let Some((key, value)) = part.split_once('=') {
            segment
                .data
                .insert(key.trim().to_string(), Value::from(unescape(value)));
        }
    }
    Some(segment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_covers_all_reserved_chars() {
        assert_eq!(escape("a&b[c]d,e"), "a&amp;b&#91;c&#93;d&#44;e");
    }

    #[test]
    fn unescape_leaves_unknown_entities_alone() {
        assert_eq!(unescape("&lt;&amp;"), "&lt;&");
        assert_eq!(unescape("trailing &"), "trailing &");
    }

    #[test]
    fn unescape_of_escaped_entity_text_is_literal() {
        let original = "&#91;not a bracket&#93;";
        assert_eq!(unescape(&escape(original)), original);
    }

    #[test]
    fn decode_mixed_message() {
        let segs = decode("hi [CQ:at,qq=10001] look [CQ:image,file=a&#44;b.png]!");
        assert_eq!(segs.len(), 5);
        assert_eq!(segs[0].as_text(), Some("hi "));
        assert_eq!(segs[1].kind, "at");
        assert_eq!(segs[1].get("qq").as_deref(), Some("10001"));
        assert_eq!(segs[3].get("file").as_deref(), Some("a,b.png"));
        assert_eq!(segs[4].as_text(), Some("!"));
    }

    #[test]
    fn unterminated_directive_is_text() {
        let segs = decode("oops [CQ:face,id=1");
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[1].as_text(), Some("[CQ:face,id=1"));
    }

    #[test]
    fn encode_orders_directive_fields() {
        let seg = Segment::new("image").with("file", "x.png").with("cache", 0);
        assert_eq!(encode(&[seg]), "[CQ:image,cache=0,file=x.png]");
    }
}
