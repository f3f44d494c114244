//! Forgiving markup reader.
//!
//! Rendered template output is parsed into a fragment. The reader never
//! fails: stray close tags are dropped, unclosed elements are closed at the
//! end of input, and an unterminated `<` is kept as text.

use crate::dom::{NodeRef, VOID_ELEMENTS};

const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style", "template", "textarea", "title"];

/// Raw-text elements whose body is kept verbatim, entities included.
pub(crate) const VERBATIM_ELEMENTS: &[&str] = &["script", "style", "template"];

pub(crate) struct ParsedAttr {
    pub(crate) name: String,
    pub(crate) value: Option<String>,
}

/// Parse `markup` into a new fragment node.
pub fn parse_fragment(markup: &str) -> NodeRef {
    let root = NodeRef::fragment();
    let mut stack: Vec<NodeRef> = vec![root.clone()];
    let mut text = String::new();
    let mut i = 0usize;

    while i < markup.len() {
        let Some(rel_lt) = markup[i..].find('<') else {
            text.push_str(&markup[i..]);
            break;
        };
        let lt = i + rel_lt;
        text.push_str(&markup[i..lt]);
        let rest = &markup[lt..];

        if rest.starts_with("<!--") {
            flush_text(&mut text, &stack);
            let end = rest[4..].find("-->").map(|e| lt + 4 + e);
            let body = match end {
                Some(e) => &markup[lt + 4..e],
                None => &markup[lt + 4..],
            };
            append(&stack, &NodeRef::comment(body));
            i = end.map(|e| e + 3).unwrap_or(markup.len());
            continue;
        }

        if rest.starts_with("</") {
            let Some(gt) = find_tag_end(markup, lt) else {
                text.push_str(rest);
                break;
            };
            flush_text(&mut text, &stack);
            let name = markup[lt + 2..gt].trim().to_ascii_lowercase();
            if let Some(pos) = stack
                .iter()
                .rposition(|n| n.tag_name().as_deref() == Some(name.as_str()))
            {
                if pos > 0 {
                    stack.truncate(pos);
                }
            }
            i = gt + 1;
            continue;
        }

        if rest.starts_with("<!") || rest.starts_with("<?") {
            // doctype / processing instruction
            let gt = find_tag_end(markup, lt).unwrap_or(markup.len() - 1);
            i = gt + 1;
            continue;
        }

        let starts_tag = rest[1..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic());
        if !starts_tag {
            text.push('<');
            i = lt + 1;
            continue;
        }
        let Some(gt) = find_tag_end(markup, lt) else {
            text.push_str(rest);
            break;
        };
        flush_text(&mut text, &stack);

        let (name, attrs_text, self_closing) = split_start_tag(&markup[lt + 1..gt]);
        let tag = name.to_ascii_lowercase();
        let el = NodeRef::element(&tag);
        for attr in parse_attributes(attrs_text) {
            let value = attr.value.map(|v| decode_entities(&v)).unwrap_or_default();
            el.set_attr(&attr.name, value);
        }
        append(&stack, &el);
        i = gt + 1;

        if self_closing || VOID_ELEMENTS.contains(&tag.as_str()) {
            continue;
        }
        if RAW_TEXT_ELEMENTS.contains(&tag.as_str()) {
            let close = find_close_tag(markup, i, &tag);
            let body_end = close.unwrap_or(markup.len());
            let body = &markup[i..body_end];
            if !body.is_empty() {
                let content = if VERBATIM_ELEMENTS.contains(&tag.as_str()) {
                    body.to_string()
                } else {
                    decode_entities(body)
                };
                append_to(&el, &NodeRef::text(content));
            }
            i = close
                .map(|c| c + tag.len() + 3)
                .unwrap_or(markup.len());
            continue;
        }
        stack.push(el);
    }
    flush_text(&mut text, &stack);
    root
}

fn append_to(parent: &NodeRef, node: &NodeRef) {
    // Fresh nodes into an element or fragment never fail.
    let _ = parent.append_child(node);
}

fn append(stack: &[NodeRef], node: &NodeRef) {
    if let Some(top) = stack.last() {
        append_to(top, node);
    }
}

fn flush_text(text: &mut String, stack: &[NodeRef]) {
    if text.is_empty() {
        return;
    }
    append(stack, &NodeRef::text(decode_entities(text)));
    text.clear();
}

pub(crate) fn decode_entities(input: &str) -> String {
    if !input.contains('&') {
        return input.to_string();
    }
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let semi = tail
            .char_indices()
            .take(12)
            .find(|(_, c)| *c == ';')
            .map(|(idx, _)| idx);
        let Some(semi) = semi else {
            out.push('&');
            rest = &tail[1..];
            continue;
        };
        let entity = &tail[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some('\u{a0}'),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse::<u32>().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &tail[semi + 1..];
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

pub(crate) fn split_start_tag(inside: &str) -> (&str, &str, bool) {
    let trimmed = inside.trim();
    let self_closing = trimmed.ends_with('/');
    let core = if self_closing {
        trimmed[..trimmed.len().saturating_sub(1)].trim_end()
    } else {
        trimmed
    };

    let mut name_end = core.len();
    for (idx, ch) in core.char_indices() {
        if ch.is_whitespace() {
            name_end = idx;
            break;
        }
    }

    let name = core[..name_end].trim();
    let attrs = core[name_end..].trim_start();
    (name, attrs, self_closing)
}

pub(crate) fn parse_attributes(input: &str) -> Vec<ParsedAttr> {
    let mut out = Vec::new();
    let mut i = 0usize;
    let bytes = input.as_bytes();

    while i < bytes.len() {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }

        let name_start = i;
        while i < bytes.len()
            && !bytes[i].is_ascii_whitespace()
            && bytes[i] != b'='
            && bytes[i] != b'/'
        {
            i += 1;
        }
        if i == name_start {
            i += 1;
            continue;
        }
        let name = input[name_start..i].to_string();

        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }

        if i >= bytes.len() || bytes[i] != b'=' {
            out.push(ParsedAttr { name, value: None });
            continue;
        }

        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }

        if i >= bytes.len() {
            out.push(ParsedAttr {
                name,
                value: Some(String::new()),
            });
            break;
        }

        let value = if bytes[i] == b'"' || bytes[i] == b'\'' {
            let quote = bytes[i];
            i += 1;
            let val_start = i;
            while i < bytes.len() && bytes[i] != quote {
                i += 1;
            }
            let v = input[val_start..i].to_string();
            if i < bytes.len() {
                i += 1;
            }
            v
        } else {
            let val_start = i;
            while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            input[val_start..i].to_string()
        };

        out.push(ParsedAttr {
            name,
            value: Some(value),
        });
    }

    out
}

pub(crate) fn find_tag_end(input: &str, lt_idx: usize) -> Option<usize> {
    let bytes = input.as_bytes();
    let mut i = lt_idx + 1;
    let mut quote: Option<u8> = None;

    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }

        if b == b'"' || b == b'\'' {
            quote = Some(b);
            i += 1;
            continue;
        }

        if b == b'>' {
            return Some(i);
        }
        i += 1;
    }

    None
}

pub(crate) fn find_close_tag(input: &str, start: usize, tag: &str) -> Option<usize> {
    let needle = format!("</{}>", tag.to_ascii_lowercase());
    let lower = input[start..].to_ascii_lowercase();
    lower.find(&needle).map(|idx| start + idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_round_trips_simple_markup() {
        let frag = parse_fragment(r#"<div class="a" id=x><span>Hi</span><br><img src="i.png"/></div>"#);
        assert_eq!(
            frag.inner_html(),
            r#"<div class="a" id="x"><span>Hi</span><br><img src="i.png"></div>"#
        );
    }

    #[test]
    fn test_entities_decoded_in_text_and_attrs() {
        let frag = parse_fragment(r#"<p title="a &quot;b&quot;">&lt;b&gt;x&#33;</p>"#);
        let p = frag.first_child().expect("p");
        assert_eq!(p.attr("title").as_deref(), Some("a \"b\""));
        assert_eq!(p.text_content(), "<b>x!");
        assert!(p.element_children().is_empty());
    }

    #[test]
    fn test_comments_and_multiple_roots() {
        let frag = parse_fragment("<!--c--><a></a>text<b></b>");
        assert_eq!(frag.child_count(), 4);
        assert!(frag.first_child().is_some_and(|c| c.is_comment()));
        assert_eq!(frag.element_children().len(), 2);
    }

    #[test]
    fn test_unclosed_and_stray_tags() {
        let frag = parse_fragment("<ul><li>a<li>b</p></ul>");
        assert_eq!(frag.inner_html(), "<ul><li>a<li>b</li></li></ul>");
    }

    #[test]
    fn test_script_body_is_raw() {
        let frag = parse_fragment("<script>if (a < b) { x(); }</script>");
        let script = frag.first_child().expect("script");
        assert_eq!(script.text_content(), "if (a < b) { x(); }");
        assert!(script.element_children().is_empty());
    }

    #[test]
    fn test_template_body_is_verbatim() {
        let frag = parse_fragment(r#"<template id="t"><i>##= a &lt; b ##</i></template>"#);
        let tmpl = frag.first_child().expect("template");
        assert_eq!(tmpl.text_content(), "<i>##= a &lt; b ##</i>");
        assert_eq!(frag.inner_html(), r#"<template id="t"><i>##= a &lt; b ##</i></template>"#);
    }

    #[test]
    fn test_lone_lt_is_text() {
        let frag = parse_fragment("1 < 2");
        assert_eq!(frag.text_content(), "1 < 2");
    }
}
