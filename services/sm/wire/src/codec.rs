//! Encoding and decoding of stream management elements.
//!
//! Decoding works on a single, already framed, top-level element (see
//! [`crate::framing`]). Elements outside the XEP-0198 namespaces decode to
//! `Ok(None)` so the caller can pass them through as ordinary stanzas.

use crate::element::{FailureCondition, Namespace, SmElement, NS_STANZAS, NS_STREAMS};
use crate::error::WireError;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::fmt::Write as _;

/// Collected attributes of the root element
struct Attrs {
    element: &'static str,
    values: Vec<(String, String)>,
}

impl Attrs {
    fn read(element: &'static str, start: &BytesStart<'_>) -> Result<Self, WireError> {
        let mut values = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| WireError::Xml(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value()?.into_owned();
            values.push((key, value));
        }
        Ok(Self { element, values })
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn require(&self, name: &'static str) -> Result<&str, WireError> {
        self.get(name).ok_or(WireError::MissingAttribute {
            element: self.element,
            attribute: name,
        })
    }

    fn u32_attr(&self, name: &'static str) -> Result<Option<u32>, WireError> {
        match self.get(name) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .map(Some)
                .map_err(|_| WireError::InvalidAttribute {
                    element: self.element,
                    attribute: name,
                    value: raw.to_string(),
                }),
        }
    }

    fn required_u32(&self, name: &'static str) -> Result<u32, WireError> {
        self.require(name)?;
        self.u32_attr(name)
            .map(|v| v.unwrap_or_default())
    }

    fn flag(&self, name: &str) -> bool {
        self.get(name).map(parse_xml_bool).unwrap_or(false)
    }
}

/// Interpret an XML boolean, also accepting the `yes` spelling some clients send
pub fn parse_xml_bool(value: &str) -> bool {
    let value = value.trim();
    value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes")
}

/// Namespace declared for the root element, honouring a prefix if one is used
fn declared_namespace(start: &BytesStart<'_>) -> Option<String> {
    let prefix = start
        .name()
        .prefix()
        .map(|p| String::from_utf8_lossy(p.as_ref()).into_owned());
    let wanted = match &prefix {
        Some(p) => format!("xmlns:{}", p),
        None => "xmlns".to_string(),
    };
    start.attributes().flatten().find_map(|attr| {
        if attr.key.as_ref() == wanted.as_bytes() {
            attr.unescape_value().ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

/// Decode a top-level element.
///
/// Returns `Ok(None)` when the element is not a stream management element.
pub fn parse_element(xml: &str) -> Result<Option<SmElement>, WireError> {
    let mut reader = Reader::from_str(xml.trim());
    reader.config_mut().check_end_names = false;

    let (start, has_children) = loop {
        match reader.read_event()? {
            Event::Start(e) => break (e.into_owned(), true),
            Event::Empty(e) => break (e.into_owned(), false),
            Event::Eof => return Err(WireError::Incomplete),
            _ => continue,
        }
    };

    let ns = match declared_namespace(&start).as_deref().and_then(Namespace::from_uri) {
        Some(ns) => ns,
        None => return Ok(None),
    };

    let local = String::from_utf8_lossy(start.name().local_name().as_ref()).into_owned();
    let element = match local.as_str() {
        "enable" => {
            let attrs = Attrs::read("enable", &start)?;
            SmElement::Enable {
                ns,
                resume: attrs.flag("resume"),
                max: attrs.u32_attr("max")?,
            }
        }
        "enabled" => {
            let attrs = Attrs::read("enabled", &start)?;
            SmElement::Enabled {
                ns,
                id: attrs.get("id").map(str::to_string),
                resume: attrs.flag("resume"),
                max: attrs.u32_attr("max")?,
                location: attrs.get("location").map(str::to_string),
            }
        }
        "r" => SmElement::Request { ns },
        "a" => {
            let attrs = Attrs::read("a", &start)?;
            SmElement::Ack {
                ns,
                h: attrs.required_u32("h")?,
            }
        }
        "resume" => {
            let attrs = Attrs::read("resume", &start)?;
            SmElement::Resume {
                ns,
                previd: attrs.require("previd")?.to_string(),
                h: attrs.required_u32("h")?,
            }
        }
        "resumed" => {
            let attrs = Attrs::read("resumed", &start)?;
            SmElement::Resumed {
                ns,
                previd: attrs.require("previd")?.to_string(),
                h: attrs.required_u32("h")?,
            }
        }
        "failed" => {
            let attrs = Attrs::read("failed", &start)?;
            let (condition, text) = if has_children {
                read_failure_children(&mut reader)?
            } else {
                (None, None)
            };
            SmElement::Failed {
                ns,
                condition,
                h: attrs.u32_attr("h")?,
                text,
            }
        }
        other => return Err(WireError::UnknownElement(other.to_string())),
    };

    Ok(Some(element))
}

/// Read the condition and optional text children of `<failed/>`
fn read_failure_children(
    reader: &mut Reader<&[u8]>,
) -> Result<(Option<FailureCondition>, Option<String>), WireError> {
    let mut condition = None;
    let mut text = None;
    let mut in_text = false;
    let mut depth: u32 = 1;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                depth += 1;
                let name = e.name();
                let local = name.local_name();
                if local.as_ref() == b"text" {
                    in_text = true;
                } else if condition.is_none() {
                    condition = FailureCondition::from_name(&String::from_utf8_lossy(local.as_ref()));
                }
            }
            Event::Empty(e) => {
                let name = e.name();
                let local = name.local_name();
                if condition.is_none() && local.as_ref() != b"text" {
                    condition = FailureCondition::from_name(&String::from_utf8_lossy(local.as_ref()));
                }
            }
            Event::Text(t) if in_text => {
                text = Some(t.unescape()?.into_owned());
            }
            Event::End(_) => {
                in_text = false;
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            Event::Eof => return Err(WireError::Incomplete),
            _ => {}
        }
    }

    Ok((condition, text))
}

impl SmElement {
    /// Serialize to XML using single-quoted attributes
    pub fn to_xml(&self) -> String {
        let mut out = String::with_capacity(64);
        match self {
            SmElement::Enable { ns, resume, max } => {
                let _ = write!(out, "<enable xmlns='{}'", ns.uri());
                if *resume {
                    out.push_str(" resume='true'");
                }
                if let Some(max) = max {
                    let _ = write!(out, " max='{}'", max);
                }
                out.push_str("/>");
            }
            SmElement::Enabled {
                ns,
                id,
                resume,
                max,
                location,
            } => {
                let _ = write!(out, "<enabled xmlns='{}'", ns.uri());
                if let Some(id) = id {
                    let _ = write!(out, " id='{}'", escape(id.as_str()));
                }
                if *resume {
                    out.push_str(" resume='true'");
                }
                if let Some(max) = max {
                    let _ = write!(out, " max='{}'", max);
                }
                if let Some(location) = location {
                    let _ = write!(out, " location='{}'", escape(location.as_str()));
                }
                out.push_str("/>");
            }
            SmElement::Request { ns } => {
                let _ = write!(out, "<r xmlns='{}'/>", ns.uri());
            }
            SmElement::Ack { ns, h } => {
                let _ = write!(out, "<a xmlns='{}' h='{}'/>", ns.uri(), h);
            }
            SmElement::Resume { ns, previd, h } => {
                let _ = write!(
                    out,
                    "<resume xmlns='{}' previd='{}' h='{}'/>",
                    ns.uri(),
                    escape(previd.as_str()),
                    h
                );
            }
            SmElement::Resumed { ns, previd, h } => {
                let _ = write!(
                    out,
                    "<resumed xmlns='{}' previd='{}' h='{}'/>",
                    ns.uri(),
                    escape(previd.as_str()),
                    h
                );
            }
            SmElement::Failed {
                ns,
                condition,
                h,
                text,
            } => {
                let _ = write!(out, "<failed xmlns='{}'", ns.uri());
                if let Some(h) = h {
                    let _ = write!(out, " h='{}'", h);
                }
                if condition.is_none() && text.is_none() {
                    out.push_str("/>");
                    return out;
                }
                out.push('>');
                if let Some(condition) = condition {
                    let _ = write!(out, "<{} xmlns='{}'/>", condition.as_str(), NS_STANZAS);
                }
                if let Some(text) = text {
                    let _ = write!(
                        out,
                        "<text xmlns='{}'>{}</text>",
                        NS_STANZAS,
                        escape(text.as_str())
                    );
                }
                out.push_str("</failed>");
            }
        }
        out
    }
}

/// Build a `<stream:error/>` with the given stream error condition and text
pub fn stream_error(condition: &str, text: &str) -> String {
    format!(
        "<stream:error><{cond} xmlns='{ns}'/><text xmlns='{ns}'>{text}</text></stream:error>",
        cond = condition,
        ns = NS_STREAMS,
        text = escape(text)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_enable_resume_spellings() {
        for (raw, expected) in [
            ("true", true),
            ("TRUE", true),
            ("1", true),
            ("yes", true),
            ("false", false),
            ("0", false),
        ] {
            let xml = format!("<enable xmlns='urn:xmpp:sm:3' resume='{}'/>", raw);
            let el = parse_element(&xml).unwrap().unwrap();
            assert_eq!(
                el,
                SmElement::Enable {
                    ns: Namespace::V3,
                    resume: expected,
                    max: None
                },
                "resume='{}'",
                raw
            );
        }
    }

    #[test]
    fn test_parse_ack_and_request() {
        let ack = parse_element("<a xmlns=\"urn:xmpp:sm:2\" h=\"4294967295\"/>")
            .unwrap()
            .unwrap();
        assert_eq!(
            ack,
            SmElement::Ack {
                ns: Namespace::V2,
                h: u32::MAX
            }
        );

        let r = parse_element("<r xmlns='urn:xmpp:sm:3'/>").unwrap().unwrap();
        assert_eq!(r, SmElement::Request { ns: Namespace::V3 });
    }

    #[test]
    fn test_parse_ack_rejects_out_of_range_h() {
        let err = parse_element("<a xmlns='urn:xmpp:sm:3' h='4294967296'/>").unwrap_err();
        assert!(matches!(
            err,
            WireError::InvalidAttribute { attribute: "h", .. }
        ));

        let err = parse_element("<a xmlns='urn:xmpp:sm:3'/>").unwrap_err();
        assert_eq!(
            err,
            WireError::MissingAttribute {
                element: "a",
                attribute: "h"
            }
        );
    }

    #[test]
    fn test_parse_resume() {
        let el = parse_element("<resume xmlns='urn:xmpp:sm:3' previd='abc&amp;1' h='7'/>")
            .unwrap()
            .unwrap();
        assert_eq!(
            el,
            SmElement::Resume {
                ns: Namespace::V3,
                previd: "abc&1".to_string(),
                h: 7
            }
        );
    }

    #[test]
    fn test_non_sm_elements_pass_through() {
        assert_eq!(
            parse_element("<message to='a@b'><body>hi</body></message>").unwrap(),
            None
        );
        assert_eq!(
            parse_element("<iq xmlns='jabber:client' type='get' id='1'/>").unwrap(),
            None
        );
    }

    #[test]
    fn test_unknown_sm_element() {
        let err = parse_element("<bogus xmlns='urn:xmpp:sm:3'/>").unwrap_err();
        assert_eq!(err, WireError::UnknownElement("bogus".to_string()));
    }

    #[test]
    fn test_prefixed_element() {
        let el = parse_element("<sm:a xmlns:sm='urn:xmpp:sm:3' h='2'/>")
            .unwrap()
            .unwrap();
        assert_eq!(
            el,
            SmElement::Ack {
                ns: Namespace::V3,
                h: 2
            }
        );
    }

    #[test]
    fn test_encode_enabled() {
        let el = SmElement::Enabled {
            ns: Namespace::V3,
            id: Some("some-id".to_string()),
            resume: true,
            max: Some(300),
            location: Some("xmpp.example.org".to_string()),
        };
        assert_eq!(
            el.to_xml(),
            "<enabled xmlns='urn:xmpp:sm:3' id='some-id' resume='true' max='300' location='xmpp.example.org'/>"
        );
    }

    #[test]
    fn test_encode_ack_and_resumed() {
        assert_eq!(
            SmElement::Ack {
                ns: Namespace::V3,
                h: 0
            }
            .to_xml(),
            "<a xmlns='urn:xmpp:sm:3' h='0'/>"
        );
        assert_eq!(
            SmElement::Resumed {
                ns: Namespace::V2,
                previd: "x".to_string(),
                h: 12
            }
            .to_xml(),
            "<resumed xmlns='urn:xmpp:sm:2' previd='x' h='12'/>"
        );
    }

    #[test]
    fn test_failed_with_condition_and_text() {
        let el = SmElement::Failed {
            ns: Namespace::V3,
            condition: Some(FailureCondition::ItemNotFound),
            h: None,
            text: Some("session expired".to_string()),
        };
        let xml = el.to_xml();
        assert_eq!(
            xml,
            "<failed xmlns='urn:xmpp:sm:3'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/><text xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'>session expired</text></failed>"
        );
        assert_eq!(parse_element(&xml).unwrap().unwrap(), el);

        let bare = SmElement::Failed {
            ns: Namespace::V3,
            condition: None,
            h: Some(3),
            text: None,
        };
        assert_eq!(bare.to_xml(), "<failed xmlns='urn:xmpp:sm:3' h='3'/>");
    }

    #[test]
    fn test_stream_error_escapes_text() {
        let xml = stream_error("undefined-condition", "h=5 > 3");
        assert!(xml.starts_with("<stream:error><undefined-condition"));
        assert!(xml.contains("h=5 &gt; 3"));
    }
}
