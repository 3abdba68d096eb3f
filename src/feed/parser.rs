use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, UTF_8};
use feed_rs::model::Entry;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::borrow::Cow;
use thiserror::Error;
use url::Url;

/// Declarations are expected near the start of the document
const DECLARATION_SCAN_LIMIT: usize = 1024;

/// Errors produced while turning a feed body into entries.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The document is not well-formed XML
    #[error("Malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),
    /// The document ended while elements were still open
    #[error("Malformed XML: document ended inside <{0}>")]
    Truncated(String),
    /// The document contains no root element at all
    #[error("Document has no root element")]
    NoRoot,
    /// The root element is not one of the supported feed flavors
    #[error("Unsupported root element <{0}> (expected <rss>, <feed> or <rdf:RDF>)")]
    UnexpectedRoot(String),
    /// The feed structure could not be interpreted
    #[error("Invalid feed structure: {0}")]
    Feed(#[from] feed_rs::parser::ParseFeedError),
}

/// Structural flavor of a feed document, taken from its root element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFlavor {
    /// `<rss>`, RSS 0.9x/2.0
    Rss,
    /// `<feed>`, Atom 1.0
    Atom,
    /// `<rdf:RDF>`, RSS 1.0
    Rdf,
}

impl FeedFlavor {
    fn from_root(local_name: &[u8]) -> Option<Self> {
        match local_name {
            b"rss" => Some(FeedFlavor::Rss),
            b"feed" => Some(FeedFlavor::Atom),
            b"RDF" => Some(FeedFlavor::Rdf),
            _ => None,
        }
    }
}

/// A single item of a feed, normalized across flavors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEntry {
    /// Plain text title with HTML entities decoded
    pub title: String,
    /// Canonical link of the item; `None` if the feed gave none
    pub link: Option<String>,
    /// Plain text description with HTML entities decoded
    pub description: Option<String>,
    /// Unix seconds. `None` means the date was missing or could not be
    /// parsed; it is never replaced with the current time.
    pub published: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub flavor: FeedFlavor,
    pub title: Option<String>,
    pub entries: Vec<ParsedEntry>,
}

/// Parse a raw feed body.
///
/// The bytes are decoded using, in order: a byte order mark, the encoding
/// named in the XML declaration, the `charset` of `content_type`, UTF-8.
/// Undecodable sequences become U+FFFD.
///
/// Relative item links are resolved against `feed_url`, so the same path
/// published by two hosts yields two distinct post URLs. Without a usable
/// `feed_url` they are kept as written.
///
/// Bare `&` characters that do not start a character or entity reference
/// are escaped before parsing, and HTML-only entities such as `&nbsp;` are
/// passed through to the entity decoder, so irregular text is kept rather
/// than dropped.
///
/// A well-formed feed with no items yields an empty `entries` list.
///
/// # Errors
///
/// - [`ParseError::Xml`] / [`ParseError::Truncated`] for malformed XML
/// - [`ParseError::NoRoot`] / [`ParseError::UnexpectedRoot`] when the root
///   element is not `<rss>`, `<feed>` or `<rdf:RDF>`
/// - [`ParseError::Feed`] when the structure under the root is unusable
pub fn parse_feed(
    bytes: &[u8],
    content_type: Option<&str>,
    feed_url: Option<&str>,
) -> Result<ParsedFeed, ParseError> {
    let text = decode_document(bytes, content_type);
    let body = escape_bare_ampersands(strip_xml_declaration(&text));

    let flavor = check_well_formed(&body)?;

    let base = feed_url.and_then(|u| match Url::parse(u) {
        Ok(url) => Some(url),
        Err(e) => {
            tracing::debug!(url = %u, error = %e, "Feed URL unusable as link base");
            None
        }
    });

    let feed = feed_rs::parser::parse(body.as_bytes())?;
    let title = feed
        .title
        .map(|t| decode_entities(&t.content))
        .filter(|t| !t.is_empty());
    let entries = feed
        .entries
        .into_iter()
        .map(|entry| entry_from_model(entry, base.as_ref()))
        .collect();

    Ok(ParsedFeed {
        flavor,
        title,
        entries,
    })
}

fn entry_from_model(entry: Entry, base: Option<&Url>) -> ParsedEntry {
    let link = entry
        .links
        .iter()
        .find(|l| l.rel.as_deref().map_or(true, |rel| rel == "alternate"))
        .or_else(|| entry.links.first())
        .map(|l| l.href.trim())
        .filter(|href| !href.is_empty())
        .map(|href| resolve_link(href, base));

    let title = entry
        .title
        .map(|t| decode_entities(&t.content))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "Untitled".to_string());

    let description = entry
        .summary
        .map(|s| s.content)
        .or_else(|| entry.content.and_then(|c| c.body))
        .map(|d| decode_entities(&d))
        .filter(|d| !d.is_empty());

    let published = entry.published.or(entry.updated).map(|dt| dt.timestamp());

    ParsedEntry {
        title,
        link,
        description,
        published,
    }
}

/// Absolute form of `href`. Already-absolute links come back as written.
fn resolve_link(href: &str, base: Option<&Url>) -> String {
    match Url::parse(href) {
        Ok(_) => href.to_string(),
        Err(url::ParseError::RelativeUrlWithoutBase) => base
            .and_then(|b| b.join(href).ok())
            .map(|url| url.to_string())
            .unwrap_or_else(|| href.to_string()),
        Err(_) => href.to_string(),
    }
}

/// Decode HTML character references left in feed text after XML unescaping,
/// e.g. `&amp;#39;` in the source arrives here as `&#39;` and leaves as `'`.
fn decode_entities(text: &str) -> String {
    html_escape::decode_html_entities(text.trim()).into_owned()
}

// ============================================================================
// Character Encoding
// ============================================================================

fn decode_document<'a>(bytes: &'a [u8], content_type: Option<&str>) -> Cow<'a, str> {
    let label = declared_encoding(bytes).or_else(|| content_type.and_then(charset_param));
    let encoding = label
        .and_then(|l| Encoding::for_label(l.trim().as_bytes()))
        .map(|enc| {
            // A declaration we could read as ASCII cannot really be UTF-16
            if enc == UTF_16LE || enc == UTF_16BE {
                UTF_8
            } else {
                enc
            }
        })
        .unwrap_or(UTF_8);

    // decode() still honors a byte order mark over the chosen encoding
    let (text, used, had_errors) = encoding.decode(bytes);
    if had_errors {
        tracing::debug!(
            encoding = used.name(),
            "Feed contained invalid byte sequences, replaced with U+FFFD"
        );
    }
    text
}

/// Extract `encoding="..."` from a leading `<?xml ...?>` declaration.
fn declared_encoding(bytes: &[u8]) -> Option<String> {
    let head = &bytes[..bytes.len().min(DECLARATION_SCAN_LIMIT)];
    let head = head.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(head);
    let start = head.iter().position(|b| !b.is_ascii_whitespace())?;
    let head = &head[start..];
    if !head.starts_with(b"<?xml") {
        return None;
    }
    let end = find(head, b"?>")?;
    let decl = std::str::from_utf8(&head[..end]).ok()?;

    let after = &decl[decl.find("encoding")? + "encoding".len()..];
    let after = after.trim_start().strip_prefix('=')?.trim_start();
    let quote = after.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let value = &after[1..];
    let close = value.find(quote)?;
    Some(value[..close].to_string())
}

/// `charset` parameter of a Content-Type header value
fn charset_param(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

fn strip_xml_declaration(text: &str) -> &str {
    let trimmed = text.trim_start_matches('\u{FEFF}').trim_start();
    if trimmed.starts_with("<?xml") {
        if let Some(end) = trimmed.find("?>") {
            return &trimmed[end + 2..];
        }
    }
    trimmed
}

/// Escape `&` that does not begin a reference XML understands.
///
/// `&amp;`, `&lt;`, `&gt;`, `&quot;`, `&apos;` and numeric references are
/// kept. Any other `&`, including the start of an HTML-only entity like
/// `&nbsp;`, becomes `&amp;` so it reaches [`decode_entities`] as text.
/// CDATA sections and comments are copied untouched.
fn escape_bare_ampersands(body: &str) -> Cow<'_, str> {
    if !body.contains('&') {
        return Cow::Borrowed(body);
    }

    let mut out = String::with_capacity(body.len() + 16);
    let mut escaped = 0usize;
    let mut rest = body;

    while let Some(pos) = rest.find(|c: char| c == '&' || c == '<') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];

        if rest.starts_with('<') {
            let skip = [("<![CDATA[", "]]>"), ("<!--", "-->")]
                .iter()
                .find(|(open, _)| rest.starts_with(*open))
                .map(|&(open, close)| {
                    rest[open.len()..]
                        .find(close)
                        .map_or(rest.len(), |end| open.len() + end + close.len())
                })
                .unwrap_or(1);
            out.push_str(&rest[..skip]);
            rest = &rest[skip..];
        } else {
            if !starts_with_xml_reference(rest) {
                out.push_str("&amp;");
                escaped += 1;
            } else {
                out.push('&');
            }
            rest = &rest[1..];
        }
    }
    out.push_str(rest);

    if escaped == 0 {
        return Cow::Borrowed(body);
    }
    tracing::debug!(count = escaped, "Escaped bare ampersands in feed");
    Cow::Owned(out)
}

fn starts_with_xml_reference(s: &str) -> bool {
    let Some(end) = s[1..].find(';').map(|i| i + 1) else {
        return false;
    };
    let name = &s[1..end];
    if let Some(num) = name.strip_prefix('#') {
        return match num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
            Some(hex) => !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()),
            None => !num.is_empty() && num.chars().all(|c| c.is_ascii_digit()),
        };
    }
    matches!(name, "amp" | "lt" | "gt" | "quot" | "apos")
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ============================================================================
// Structure
// ============================================================================

/// Walk the whole document once, returning the flavor of its root element.
///
/// quick-xml checks that end tags match their start tags; the depth counter
/// catches documents cut off before their closing tags.
fn check_well_formed(body: &str) -> Result<FeedFlavor, ParseError> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut flavor = None;
    let mut open: Vec<String> = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if open.is_empty() && flavor.is_none() {
                    flavor = Some(root_flavor(e.local_name().as_ref())?);
                }
                open.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
            }
            Event::Empty(e) => {
                if open.is_empty() && flavor.is_none() {
                    flavor = Some(root_flavor(e.local_name().as_ref())?);
                }
            }
            Event::End(_) => {
                open.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(unclosed) = open.pop() {
        return Err(ParseError::Truncated(unclosed));
    }
    flavor.ok_or(ParseError::NoRoot)
}

fn root_flavor(local_name: &[u8]) -> Result<FeedFlavor, ParseError> {
    FeedFlavor::from_root(local_name)
        .ok_or_else(|| ParseError::UnexpectedRoot(String::from_utf8_lossy(local_name).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel>
    <title>Example Blog</title>
    <link>https://example.com/</link>
    <description>Posts</description>
    <item>
        <title>First post</title>
        <link>https://example.com/first</link>
        <description>Hello world</description>
        <pubDate>Mon, 01 Jan 2024 00:00:00 +0000</pubDate>
    </item>
    <item>
        <title>Second post</title>
        <link>https://example.com/second</link>
    </item>
</channel></rss>"#;

    #[test]
    fn test_parse_rss_entries_in_order() {
        let feed = parse_feed(RSS.as_bytes(), None, None).unwrap();
        assert_eq!(feed.flavor, FeedFlavor::Rss);
        assert_eq!(feed.title.as_deref(), Some("Example Blog"));
        assert_eq!(
            feed.entries,
            vec![
                ParsedEntry {
                    title: "First post".to_string(),
                    link: Some("https://example.com/first".to_string()),
                    description: Some("Hello world".to_string()),
                    published: Some(1_704_067_200),
                },
                ParsedEntry {
                    title: "Second post".to_string(),
                    link: Some("https://example.com/second".to_string()),
                    description: None,
                    published: None,
                },
            ]
        );
    }

    #[test]
    fn test_unparseable_date_is_unknown() {
        let rss = r#"<rss version="2.0"><channel>
            <item><title>T</title><link>https://example.com/t</link>
            <pubDate>sometime last week</pubDate></item>
        </channel></rss>"#;
        let feed = parse_feed(rss.as_bytes(), None, None).unwrap();
        assert_eq!(feed.entries[0].published, None);
    }

    #[test]
    fn test_html_entities_decoded() {
        let rss = r#"<rss version="2.0"><channel>
            <item>
                <title>Rust &amp;amp; Go: Tom&amp;#39;s take</title>
                <link>https://example.com/a</link>
                <description>5 &amp;lt; 6 &amp;quot;quoted&amp;quot;</description>
            </item>
        </channel></rss>"#;
        let feed = parse_feed(rss.as_bytes(), None, None).unwrap();
        assert_eq!(feed.entries[0].title, "Rust & Go: Tom's take");
        assert_eq!(
            feed.entries[0].description.as_deref(),
            Some("5 < 6 \"quoted\"")
        );
    }

    #[test]
    fn test_single_escaped_entities_decoded() {
        let rss = r#"<rss version="2.0"><channel>
            <item><title>Fish &amp; Chips &#39;24</title><link>https://example.com/f</link></item>
        </channel></rss>"#;
        let feed = parse_feed(rss.as_bytes(), None, None).unwrap();
        assert_eq!(feed.entries[0].title, "Fish & Chips '24");
    }

    #[test]
    fn test_bare_ampersand_kept_in_text() {
        let rss = r#"<rss version="2.0"><channel>
            <item>
                <title>Fish & Chips</title>
                <link>https://example.com/fish?a=1&b=2</link>
                <description>Tea&nbsp;time &amp; more</description>
            </item>
        </channel></rss>"#;
        let feed = parse_feed(rss.as_bytes(), None, None).unwrap();
        let entry = &feed.entries[0];
        assert_eq!(entry.title, "Fish & Chips");
        assert_eq!(entry.link.as_deref(), Some("https://example.com/fish?a=1&b=2"));
        assert_eq!(entry.description.as_deref(), Some("Tea\u{a0}time & more"));
    }

    #[test]
    fn test_escape_bare_ampersands() {
        assert_eq!(escape_bare_ampersands("<a>x &amp; y</a>"), "<a>x &amp; y</a>");
        assert_eq!(escape_bare_ampersands("<a>x & y</a>"), "<a>x &amp; y</a>");
        assert_eq!(escape_bare_ampersands("<a>&#39;&#x27;&lt;</a>"), "<a>&#39;&#x27;&lt;</a>");
        assert_eq!(escape_bare_ampersands("<a>&nbsp;</a>"), "<a>&amp;nbsp;</a>");
        assert_eq!(
            escape_bare_ampersands("<a><![CDATA[x & y]]><!-- & --> &</a>"),
            "<a><![CDATA[x & y]]><!-- & --> &amp;</a>"
        );
    }

    #[test]
    fn test_cdata_ampersand_untouched() {
        let rss = r#"<rss version="2.0"><channel>
            <item><title><![CDATA[Salt & Pepper]]></title><link>https://example.com/s</link></item>
        </channel></rss>"#;
        let feed = parse_feed(rss.as_bytes(), None, None).unwrap();
        assert_eq!(feed.entries[0].title, "Salt & Pepper");
    }

    #[test]
    fn test_relative_links_resolved_against_feed_url() {
        let rss = r#"<rss version="2.0"><channel>
            <item><title>Rel</title><link>/posts/1</link></item>
            <item><title>Abs</title><link>https://other.example.org/x</link></item>
        </channel></rss>"#;
        let feed = parse_feed(rss.as_bytes(), None, Some("https://blog.example.com/feed.xml")).unwrap();
        assert_eq!(
            feed.entries[0].link.as_deref(),
            Some("https://blog.example.com/posts/1")
        );
        assert_eq!(
            feed.entries[1].link.as_deref(),
            Some("https://other.example.org/x")
        );

        let atom = r#"<feed xmlns="http://www.w3.org/2005/Atom">
            <title>A</title><id>urn:a</id><updated>2024-01-02T00:00:00Z</updated>
            <entry><title>E</title><id>urn:a:1</id><updated>2024-01-02T00:00:00Z</updated>
                <link rel="alternate" href="entries/2"/></entry>
        </feed>"#;
        let feed = parse_feed(atom.as_bytes(), None, Some("https://atom.example.net/blog/atom.xml")).unwrap();
        assert_eq!(
            feed.entries[0].link.as_deref(),
            Some("https://atom.example.net/blog/entries/2")
        );
    }

    #[test]
    fn test_relative_link_kept_without_feed_url() {
        let rss = r#"<rss version="2.0"><channel>
            <item><title>Rel</title><link>/posts/1</link></item>
        </channel></rss>"#;
        let feed = parse_feed(rss.as_bytes(), None, None).unwrap();
        assert_eq!(feed.entries[0].link.as_deref(), Some("/posts/1"));
    }

    #[test]
    fn test_declared_latin1_encoding_honored() {
        let mut bytes = br#"<?xml version="1.0" encoding="ISO-8859-1"?>
<rss version="2.0"><channel><item><title>Caf"#
            .to_vec();
        bytes.push(0xE9); // 'é' in Latin-1
        bytes.extend_from_slice(b"</title><link>https://example.com/cafe</link></item></channel></rss>");

        let feed = parse_feed(&bytes, None, None).unwrap();
        assert_eq!(feed.entries[0].title, "Café");
    }

    #[test]
    fn test_content_type_charset_used_without_declaration() {
        let mut bytes = br#"<rss version="2.0"><channel><item><title>Na"#.to_vec();
        bytes.push(0xEF); // 'ï' in windows-1252
        bytes.extend_from_slice(b"ve</title><link>https://example.com/n</link></item></channel></rss>");

        let feed = parse_feed(&bytes, Some("application/rss+xml; charset=windows-1252"), None).unwrap();
        assert_eq!(feed.entries[0].title, "Naïve");
    }

    #[test]
    fn test_utf8_bom_accepted() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice(RSS.as_bytes());
        let feed = parse_feed(&bytes, None, None).unwrap();
        assert_eq!(feed.entries.len(), 2);
    }

    #[test]
    fn test_parse_atom() {
        let atom = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
    <title>Atom Example</title>
    <id>urn:example</id>
    <updated>2024-01-02T00:00:00Z</updated>
    <entry>
        <title>Atom entry</title>
        <id>urn:example:1</id>
        <link rel="alternate" href="https://example.com/atom-1"/>
        <updated>2024-01-02T00:00:00Z</updated>
        <summary>Summary text</summary>
    </entry>
</feed>"#;
        let feed = parse_feed(atom.as_bytes(), None, None).unwrap();
        assert_eq!(feed.flavor, FeedFlavor::Atom);
        assert_eq!(feed.entries.len(), 1);
        assert_eq!(
            feed.entries[0].link.as_deref(),
            Some("https://example.com/atom-1")
        );
        assert_eq!(feed.entries[0].published, Some(1_704_153_600));
    }

    #[test]
    fn test_empty_channel_is_valid() {
        let rss = r#"<?xml version="1.0"?><rss version="2.0"><channel></channel></rss>"#;
        let feed = parse_feed(rss.as_bytes(), None, None).unwrap();
        assert!(feed.entries.is_empty());
    }

    #[test]
    fn test_malformed_xml_rejected() {
        assert!(parse_feed(b"<not valid xml", None, None).is_err());
        let err = parse_feed(b"<rss><channel></rss>", None, None).unwrap_err();
        assert!(matches!(err, ParseError::Xml(_)), "got {:?}", err);
    }

    #[test]
    fn test_truncated_document_rejected() {
        let err = parse_feed(b"<rss version=\"2.0\"><channel><item>", None, None).unwrap_err();
        assert!(
            matches!(err, ParseError::Truncated(_) | ParseError::Xml(_)),
            "got {:?}",
            err
        );
    }

    #[test]
    fn test_wrong_root_rejected() {
        let err = parse_feed(b"<html><body>Not a feed</body></html>", None, None).unwrap_err();
        match err {
            ParseError::UnexpectedRoot(name) => assert_eq!(name, "html"),
            e => panic!("Expected UnexpectedRoot, got {:?}", e),
        }
    }

    #[test]
    fn test_empty_document_has_no_root() {
        let err = parse_feed(b"   ", None, None).unwrap_err();
        assert!(matches!(err, ParseError::NoRoot), "got {:?}", err);
    }

    #[test]
    fn test_declared_encoding_extraction() {
        assert_eq!(
            declared_encoding(br#"<?xml version="1.0" encoding="windows-1251"?><rss/>"#),
            Some("windows-1251".to_string())
        );
        assert_eq!(
            declared_encoding(b"<?xml version='1.0' encoding = 'koi8-r' ?><rss/>"),
            Some("koi8-r".to_string())
        );
        assert_eq!(declared_encoding(br#"<?xml version="1.0"?><rss/>"#), None);
        assert_eq!(declared_encoding(b"<rss/>"), None);
    }

    #[test]
    fn test_charset_param() {
        assert_eq!(
            charset_param("text/xml; charset=\"ISO-8859-1\""),
            Some("ISO-8859-1".to_string())
        );
        assert_eq!(charset_param("application/rss+xml"), None);
    }

    fn xml_escape(s: &str) -> String {
        s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
    }

    proptest! {
        #[test]
        fn prop_double_escaped_titles_come_back_plain(
            title in "[A-Za-z0-9&<>'\"]([A-Za-z0-9&<>'\" ]{0,30}[A-Za-z0-9&<>'\"])?"
        ) {
            let encoded = xml_escape(&html_escape::encode_text(&title));
            let rss = format!(
                r#"<rss version="2.0"><channel><item><title>{}</title><link>https://example.com/p</link></item></channel></rss>"#,
                encoded
            );
            let feed = parse_feed(rss.as_bytes(), None, None).unwrap();
            prop_assert_eq!(&feed.entries[0].title, &title);
        }
    }
}
