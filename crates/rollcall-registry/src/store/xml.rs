//! Minimal XML writer and reader for the record and index files.
//!
//! Only the subset the store produces is supported on write: elements,
//! attributes and text, indented two spaces per level. The reader accepts a
//! little more so hand-edited files still load: an XML declaration,
//! comments, a doctype, CDATA sections, single-quoted attributes, and
//! numeric character references.

use std::fmt;

/// Declaration written at the top of every file.
pub const XML_DECLARATION: &str = "<?xml version='1.0' encoding='utf-8' standalone='yes' ?>";

/// Parse failure with the byte offset it was detected at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlError {
    /// Byte offset into the input
    pub offset: usize,
    /// What went wrong
    pub message: String,
}

impl fmt::Display for XmlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at byte {}", self.message, self.offset)
    }
}

impl std::error::Error for XmlError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Content {
    /// Start tag written, `>` not yet emitted.
    Pending,
    Text,
    Children,
}

/// Streaming writer producing indented XML.
#[derive(Debug)]
pub struct XmlWriter {
    buf: String,
    stack: Vec<(&'static str, Content)>,
}

impl Default for XmlWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl XmlWriter {
    /// Create a writer that has already emitted the XML declaration.
    pub fn new() -> Self {
        let mut buf = String::with_capacity(256);
        buf.push_str(XML_DECLARATION);
        Self {
            buf,
            stack: Vec::new(),
        }
    }

    fn close_pending(&mut self) {
        if let Some((_, content)) = self.stack.last_mut()
            && *content == Content::Pending
        {
            self.buf.push('>');
            *content = Content::Text;
        }
    }

    fn newline_indent(&mut self, depth: usize) {
        self.buf.push('\n');
        for _ in 0..depth {
            self.buf.push_str("  ");
        }
    }

    /// Open an element.
    pub fn start_tag(&mut self, name: &'static str) -> &mut Self {
        self.close_pending();
        if let Some((_, content)) = self.stack.last_mut() {
            *content = Content::Children;
        }
        self.newline_indent(self.stack.len());
        self.buf.push('<');
        self.buf.push_str(name);
        self.stack.push((name, Content::Pending));
        self
    }

    /// Add an attribute to the element just opened.
    pub fn attribute(&mut self, name: &str, value: &str) -> &mut Self {
        debug_assert!(matches!(self.stack.last(), Some((_, Content::Pending))));
        self.buf.push(' ');
        self.buf.push_str(name);
        self.buf.push_str("=\"");
        escape_into(&mut self.buf, value, true);
        self.buf.push('"');
        self
    }

    /// Write text content for the current element.
    pub fn text(&mut self, text: &str) -> &mut Self {
        self.close_pending();
        escape_into(&mut self.buf, text, false);
        self
    }

    /// Close the most recently opened element.
    pub fn end_tag(&mut self) -> &mut Self {
        if let Some((name, content)) = self.stack.pop() {
            match content {
                Content::Pending => self.buf.push_str(" />"),
                Content::Text => {
                    self.buf.push_str("</");
                    self.buf.push_str(name);
                    self.buf.push('>');
                }
                Content::Children => {
                    self.newline_indent(self.stack.len());
                    self.buf.push_str("</");
                    self.buf.push_str(name);
                    self.buf.push('>');
                }
            }
        }
        self
    }

    /// Close any open elements and return the document.
    pub fn finish(mut self) -> String {
        while !self.stack.is_empty() {
            self.end_tag();
        }
        self.buf.push('\n');
        self.buf
    }
}

fn escape_into(out: &mut String, value: &str, attribute: bool) {
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            '\n' if attribute => out.push_str("&#10;"),
            _ => out.push(ch),
        }
    }
}

/// Parsed element with its attributes, child elements and concatenated text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    /// Tag name
    pub name: String,
    /// Attributes in document order
    pub attributes: Vec<(String, String)>,
    /// Child elements in document order
    pub children: Vec<Self>,
    /// Text directly inside this element, unescaped
    pub text: String,
}

impl Element {
    /// Get an attribute value by name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Get the first child element with this name.
    pub fn child(&self, name: &str) -> Option<&Self> {
        self.children.iter().find(|child| child.name == name)
    }

    /// Iterate over child elements with this name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Self> + 'a {
        self.children.iter().filter(move |child| child.name == name)
    }
}

/// Parse a document and return its root element.
pub fn parse_document(input: &str) -> Result<Element, XmlError> {
    let mut parser = Parser { src: input, pos: 0 };
    parser.skip_misc()?;
    if parser.rest().is_empty() {
        return Err(parser.error("no root element"));
    }
    let root = parser.parse_element(1)?;
    parser.skip_misc()?;
    Ok(root)
}

/// Deepest element nesting the reader accepts. Registry files nest two deep.
const MAX_DEPTH: usize = 16;

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn error(&self, message: impl Into<String>) -> XmlError {
        XmlError {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn skip_ws(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn skip_past(&mut self, terminator: &str) -> Result<&'a str, XmlError> {
        let rest = self.rest();
        match rest.find(terminator) {
            Some(end) => {
                self.pos += end + terminator.len();
                Ok(&rest[..end])
            }
            None => Err(self.error(format!("unterminated construct, expected {terminator:?}"))),
        }
    }

    fn expect(&mut self, token: char) -> Result<(), XmlError> {
        if self.rest().starts_with(token) {
            self.pos += token.len_utf8();
            Ok(())
        } else {
            Err(self.error(format!("expected {token:?}")))
        }
    }

    /// Skip whitespace, declarations, comments and doctypes between elements.
    fn skip_misc(&mut self) -> Result<(), XmlError> {
        loop {
            self.skip_ws();
            let rest = self.rest();
            if rest.starts_with("<?") {
                self.skip_past("?>")?;
            } else if rest.starts_with("<!--") {
                self.skip_past("-->")?;
            } else if rest.starts_with("<!") {
                self.skip_past(">")?;
            } else {
                return Ok(());
            }
        }
    }

    fn read_name(&mut self) -> Result<&'a str, XmlError> {
        let rest = self.rest();
        let len = rest
            .find(|c: char| !(c.is_alphanumeric() || matches!(c, '_' | '-' | ':' | '.')))
            .unwrap_or(rest.len());
        if len == 0 {
            return Err(self.error("expected a name"));
        }
        self.pos += len;
        Ok(&rest[..len])
    }

    fn parse_element(&mut self, depth: usize) -> Result<Element, XmlError> {
        if depth > MAX_DEPTH {
            return Err(self.error(format!("elements nested deeper than {MAX_DEPTH}")));
        }
        self.expect('<')?;
        let mut element = Element {
            name: self.read_name()?.to_string(),
            ..Element::default()
        };

        loop {
            self.skip_ws();
            let rest = self.rest();
            if rest.starts_with("/>") {
                self.pos += 2;
                return Ok(element);
            }
            if rest.starts_with('>') {
                self.pos += 1;
                break;
            }

            let key = self.read_name()?.to_string();
            self.skip_ws();
            self.expect('=')?;
            self.skip_ws();
            let quote = match self.rest().chars().next() {
                Some(q @ ('"' | '\'')) => q,
                _ => return Err(self.error("expected quoted attribute value")),
            };
            self.pos += 1;
            let raw = self.skip_past(if quote == '"' { "\"" } else { "'" })?;
            let value = unescape(raw).map_err(|m| self.error(m))?;
            element.attributes.push((key, value));
        }

        loop {
            let rest = self.rest();
            if rest.is_empty() {
                return Err(self.error(format!("unterminated element <{}>", element.name)));
            }
            if rest.starts_with("</") {
                self.pos += 2;
                let closing = self.read_name()?;
                if closing != element.name {
                    return Err(self.error(format!(
                        "mismatched end tag </{closing}> for <{}>",
                        element.name
                    )));
                }
                self.skip_ws();
                self.expect('>')?;
                return Ok(element);
            } else if rest.starts_with("<!--") {
                self.skip_past("-->")?;
            } else if rest.starts_with("<![CDATA[") {
                self.pos += "<![CDATA[".len();
                let data = self.skip_past("]]>")?;
                element.text.push_str(data);
            } else if rest.starts_with("<?") {
                self.skip_past("?>")?;
            } else if rest.starts_with('<') {
                let child = self.parse_element(depth + 1)?;
                element.children.push(child);
            } else {
                let end = rest.find('<').unwrap_or(rest.len());
                let text = unescape(&rest[..end]).map_err(|m| self.error(m))?;
                element.text.push_str(&text);
                self.pos += end;
            }
        }
    }
}

fn unescape(raw: &str) -> Result<String, String> {
    if !raw.contains('&') {
        return Ok(raw.to_string());
    }

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after
            .find(';')
            .ok_or_else(|| "unterminated character reference".to_string())?;
        let entity = &after[..end];
        let ch = match entity {
            "amp" => '&',
            "lt" => '<',
            "gt" => '>',
            "quot" => '"',
            "apos" => '\'',
            _ => {
                let code = if let Some(hex) = entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse().ok()
                } else {
                    None
                };
                code.and_then(char::from_u32)
                    .ok_or_else(|| format!("unknown character reference &{entity};"))?
            }
        };
        out.push(ch);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_writer_layout() {
        let mut w = XmlWriter::new();
        w.start_tag("users").attribute("nextSerialNumber", "3");
        w.start_tag("user").attribute("id", "0").end_tag();
        w.start_tag("user").attribute("id", "10").end_tag();
        w.end_tag();

        assert_eq!(
            w.finish(),
            "<?xml version='1.0' encoding='utf-8' standalone='yes' ?>\n\
             <users nextSerialNumber=\"3\">\n  <user id=\"0\" />\n  <user id=\"10\" />\n</users>\n"
        );
    }

    #[test]
    fn test_writer_text_element() {
        let mut w = XmlWriter::new();
        w.start_tag("user").attribute("id", "0");
        w.start_tag("name").text("Primary").end_tag();
        let doc = w.finish();
        assert!(doc.ends_with("<user id=\"0\">\n  <name>Primary</name>\n</user>\n"));
    }

    #[test]
    fn test_escaping_survives_parse() {
        let name = "Tom & \"Jerry\" <admin> 'x'";
        let mut w = XmlWriter::new();
        w.start_tag("user").attribute("icon", name);
        w.start_tag("name").text(name).end_tag();
        let doc = w.finish();

        let root = parse_document(&doc).expect("parse");
        assert_eq!(root.attr("icon"), Some(name));
        assert_eq!(root.child("name").map(|n| n.text.as_str()), Some(name));
    }

    #[test]
    fn test_parse_tolerates_comments_and_single_quotes() {
        let doc = "<?xml version='1.0'?>\n<!-- saved by hand -->\n\
                   <users nextSerialNumber='5'><!-- a --><user id='0'/><user id=\"12\"></user></users>";
        let root = parse_document(doc).expect("parse");
        assert_eq!(root.name, "users");
        assert_eq!(root.attr("nextSerialNumber"), Some("5"));
        let ids: Vec<_> = root.children_named("user").filter_map(|u| u.attr("id")).collect();
        assert_eq!(ids, vec!["0", "12"]);
    }

    #[test]
    fn test_parse_character_references() {
        let root = parse_document("<name>caf&#233; &#x41;&amp;B</name>").expect("parse");
        assert_eq!(root.text, "café A&B");
    }

    #[test]
    fn test_parse_cdata() {
        let root = parse_document("<name><![CDATA[<raw & text>]]></name>").expect("parse");
        assert_eq!(root.text, "<raw & text>");
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_document("").is_err());
        assert!(parse_document("   <!-- only a comment -->").is_err());
        assert!(parse_document("<users>").is_err());
        assert!(parse_document("<users></user>").is_err());
        assert!(parse_document("<user id=0 />").is_err());
        assert!(parse_document("<name>&bogus;</name>").is_err());
        assert!(parse_document("garbage").is_err());
    }

    #[test]
    fn test_parse_nesting_limit() {
        let nested = |depth: usize| format!("{}{}", "<a>".repeat(depth), "</a>".repeat(depth));
        assert!(parse_document(&nested(MAX_DEPTH)).is_ok());

        let err = parse_document(&nested(MAX_DEPTH + 1)).expect_err("too deep");
        assert!(err.message.contains("nested deeper"));

        // Unterminated nesting far past the limit fails without exhausting the stack.
        assert!(parse_document(&format!("<users>{}", "<a>".repeat(200_000))).is_err());
    }
}
