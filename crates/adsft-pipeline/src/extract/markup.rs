//! XML and HTML full-text extraction

use quick_xml::events::Event;
use quick_xml::Reader;
use scraper::{Html, Selector};

use super::{ExtractedField, FieldMap};

/// Element names of the JATS template
const JATS_TAGS: &[(ExtractedField, &str)] = &[
    (ExtractedField::Title, "article-title"),
    (ExtractedField::Abstract, "abstract"),
    (ExtractedField::FullText, "body"),
    (ExtractedField::Acknowledgements, "ack"),
];

/// Element names of the Elsevier template
const ELSEVIER_TAGS: &[(ExtractedField, &str)] = &[
    (ExtractedField::Title, "ce:title"),
    (ExtractedField::Abstract, "ce:abstract"),
    (ExtractedField::FullText, "ce:sections"),
    (ExtractedField::Acknowledgements, "ce:acknowledgment"),
];

fn xml_tags(provider: &str) -> &'static [(ExtractedField, &'static str)] {
    if provider.trim().eq_ignore_ascii_case("elsevier") {
        ELSEVIER_TAGS
    } else {
        JATS_TAGS
    }
}

/// Text collected for one field; only the first matching element counts
struct Capture {
    field: ExtractedField,
    tag: &'static str,
    depth: usize,
    done: bool,
    text: String,
}

/// Extract the XML template fields for a provider.
///
/// Text of nested elements is concatenated; only the first element matching
/// each field is used (reference lists repeat `article-title`).
pub fn extract_xml(content: &str, provider: &str) -> Result<FieldMap, quick_xml::Error> {
    let mut captures: Vec<Capture> = xml_tags(provider)
        .iter()
        .map(|&(field, tag)| Capture {
            field,
            tag,
            depth: 0,
            done: false,
            text: String::new(),
        })
        .collect();

    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = e.name();
                for capture in captures.iter_mut().filter(|c| !c.done) {
                    if name.as_ref() == capture.tag.as_bytes() {
                        capture.depth += 1;
                    }
                }
            }
            Event::End(e) => {
                let name = e.name();
                for capture in captures.iter_mut().filter(|c| c.depth > 0) {
                    if name.as_ref() == capture.tag.as_bytes() {
                        capture.depth -= 1;
                        capture.done = capture.depth == 0;
                    }
                }
            }
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map(|s| s.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&t).into_owned());
                append(&mut captures, &text);
            }
            Event::CData(c) => {
                let text = String::from_utf8_lossy(&c).into_owned();
                append(&mut captures, &text);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(captures.into_iter().map(|c| (c.field, c.text)).collect())
}

fn append(captures: &mut [Capture], text: &str) {
    for capture in captures.iter_mut().filter(|c| c.depth > 0) {
        capture.text.push(' ');
        capture.text.push_str(text);
    }
}

/// Extract the HTML template fields: document title and body text
pub fn extract_html(content: &str) -> FieldMap {
    let document = Html::parse_document(content);

    let mut fields = FieldMap::new();
    fields.insert(ExtractedField::Title, select_text(&document, "title"));
    fields.insert(ExtractedField::FullText, select_text(&document, "body"));
    fields
}

fn select_text(document: &Html, selector: &str) -> String {
    let Ok(selector) = Selector::parse(selector) else {
        return String::new();
    };

    document
        .select(&selector)
        .next()
        .map(|element| element.text().collect::<Vec<_>>().join(" "))
        .unwrap_or_default()
}
