//! Turning index-backed XML streams into SAX-style events, and serializing
//! those events back into UTF-8 XML text.

use std::io::Write;

use quick_xml::{
    events::{BytesCData, BytesDecl, BytesEnd, BytesPI, BytesStart, BytesText, Event},
    Writer,
};

use crate::{
    broker::{Attribute, QName, StreamEvent, XmlStreamReader},
    error::ExportResult,
};

/// [`RenderErrorKind`] describes the errors that can occur while rendering XML
#[derive(thiserror::Error, Debug, displaydoc::Display)]
#[non_exhaustive]
pub enum RenderErrorKind {
    /// writing serialized XML failed: `{0:?}`
    WritingXmlFailed(std::io::Error),
    /// flushing serialized XML failed: `{0:?}`
    FlushingXmlFailed(std::io::Error),
}

pub(crate) type RenderResult<T> = Result<T, RenderErrorKind>;

/// SAX-style event sink fed by the [`XmlStreamRenderer`].
pub trait Receiver {
    /// Document start. Called once by the document framer, not per child.
    fn start_document(&mut self) -> RenderResult<()>;
    /// Document end.
    fn end_document(&mut self) -> RenderResult<()>;
    /// A namespace prefix comes into scope. The default namespace uses the
    /// empty prefix.
    fn start_prefix_mapping(&mut self, prefix: &str, uri: &str) -> RenderResult<()>;
    /// A namespace prefix goes out of scope.
    fn end_prefix_mapping(&mut self, prefix: &str) -> RenderResult<()>;
    /// Element start with its gathered attribute list.
    fn start_element(&mut self, name: &QName, attributes: &[Attribute]) -> RenderResult<()>;
    /// Element end.
    fn end_element(&mut self, name: &QName) -> RenderResult<()>;
    /// Character data.
    fn characters(&mut self, text: &str) -> RenderResult<()>;
    /// A CDATA section.
    fn cdata_section(&mut self, text: &str) -> RenderResult<()>;
    /// A comment.
    fn comment(&mut self, text: &str) -> RenderResult<()>;
    /// A processing instruction.
    fn processing_instruction(&mut self, target: &str, data: &str) -> RenderResult<()>;
}

/// Drives the broker's pull events into a [`Receiver`].
///
/// Document framing events coming from the stream are suppressed; the caller
/// frames the document around all top-level children. Prefix mappings are
/// tracked per element so that `end_prefix_mapping` calls pair with their
/// `start_prefix_mapping` counterparts in reverse order.
#[derive(Debug, Default)]
pub struct XmlStreamRenderer {
    prefixes: Vec<Vec<String>>,
}

impl XmlStreamRenderer {
    /// Create a new renderer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Render one top-level child stream into `receiver`.
    ///
    /// The namespace stack is reset at the start of every child. A top-level
    /// comment or processing instruction is a single-event stream: exactly
    /// one event is emitted and the stream is not pulled further.
    ///
    /// # Errors
    ///
    /// * If pulling from the reader or emitting into the receiver fails.
    pub fn render_child(
        &mut self,
        reader: &mut dyn XmlStreamReader,
        receiver: &mut dyn Receiver,
    ) -> ExportResult<()> {
        self.prefixes.clear();
        let mut first = true;
        while let Some(event) = reader.next_event()? {
            match event {
                StreamEvent::StartDocument | StreamEvent::EndDocument => {}
                StreamEvent::StartElement {
                    name,
                    attributes,
                    namespaces,
                } => {
                    let mut declared = Vec::with_capacity(namespaces.len());
                    for mapping in &namespaces {
                        receiver.start_prefix_mapping(&mapping.prefix, &mapping.uri)?;
                        declared.push(mapping.prefix.clone());
                    }
                    self.prefixes.push(declared);
                    receiver.start_element(&name, &attributes)?;
                }
                StreamEvent::EndElement { name } => {
                    receiver.end_element(&name)?;
                    if let Some(declared) = self.prefixes.pop() {
                        for prefix in declared.iter().rev() {
                            receiver.end_prefix_mapping(prefix)?;
                        }
                    }
                }
                StreamEvent::Characters(text) => receiver.characters(&text)?,
                StreamEvent::CData(text) => receiver.cdata_section(&text)?,
                StreamEvent::Comment(text) => {
                    receiver.comment(&text)?;
                    if first {
                        return Ok(());
                    }
                }
                StreamEvent::ProcessingInstruction { target, data } => {
                    receiver.processing_instruction(&target, &data)?;
                    if first {
                        return Ok(());
                    }
                }
            }
            first = false;
        }
        Ok(())
    }
}

/// A [`Receiver`] writing UTF-8 XML text without indentation.
///
/// Pending prefix mappings are turned into `xmlns`/`xmlns:p` attributes of
/// the next element start; empty elements are collapsed into the short
/// `<name/>` form.
pub struct XmlSerializer<W: Write> {
    writer: Writer<W>,
    pending_mappings: Vec<(String, String)>,
    pending_start: Option<BytesStart<'static>>,
}

impl<W: Write> XmlSerializer<W> {
    /// Create a serializer over the given output.
    pub fn new(inner: W) -> Self {
        Self {
            writer: Writer::new(inner),
            pending_mappings: Vec::new(),
            pending_start: None,
        }
    }

    /// Hand back the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }

    fn write(&mut self, event: Event<'_>) -> RenderResult<()> {
        self.writer
            .write_event(event)
            .map_err(|err| RenderErrorKind::WritingXmlFailed(std::io::Error::other(err)))
    }

    fn flush_pending_start(&mut self) -> RenderResult<()> {
        if let Some(start) = self.pending_start.take() {
            self.write(Event::Start(start))?;
        }
        Ok(())
    }
}

impl<W: Write> Receiver for XmlSerializer<W> {
    fn start_document(&mut self) -> RenderResult<()> {
        self.write(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
    }

    fn end_document(&mut self) -> RenderResult<()> {
        self.flush_pending_start()
    }

    fn start_prefix_mapping(&mut self, prefix: &str, uri: &str) -> RenderResult<()> {
        self.pending_mappings
            .push((prefix.to_string(), uri.to_string()));
        Ok(())
    }

    fn end_prefix_mapping(&mut self, _prefix: &str) -> RenderResult<()> {
        Ok(())
    }

    fn start_element(&mut self, name: &QName, attributes: &[Attribute]) -> RenderResult<()> {
        self.flush_pending_start()?;
        let mut elem = BytesStart::new(name.qualified());
        for (prefix, uri) in self.pending_mappings.drain(..) {
            if prefix.is_empty() {
                elem.push_attribute(("xmlns", uri.as_str()));
            } else {
                elem.push_attribute((format!("xmlns:{prefix}").as_str(), uri.as_str()));
            }
        }
        for attribute in attributes {
            elem.push_attribute((
                attribute.name.qualified().as_str(),
                attribute.value.as_str(),
            ));
        }
        self.pending_start = Some(elem.into_owned());
        Ok(())
    }

    fn end_element(&mut self, name: &QName) -> RenderResult<()> {
        if let Some(start) = self.pending_start.take() {
            return self.write(Event::Empty(start));
        }
        self.write(Event::End(BytesEnd::new(name.qualified())))
    }

    fn characters(&mut self, text: &str) -> RenderResult<()> {
        self.flush_pending_start()?;
        self.write(Event::Text(BytesText::new(text)))
    }

    fn cdata_section(&mut self, text: &str) -> RenderResult<()> {
        self.flush_pending_start()?;
        self.write(Event::CData(BytesCData::new(text)))
    }

    fn comment(&mut self, text: &str) -> RenderResult<()> {
        self.flush_pending_start()?;
        self.write(Event::Comment(BytesText::from_escaped(text)))
    }

    fn processing_instruction(&mut self, target: &str, data: &str) -> RenderResult<()> {
        self.flush_pending_start()?;
        let content = if data.is_empty() {
            target.to_string()
        } else {
            format!("{target} {data}")
        };
        self.write(Event::PI(BytesPI::new(content)))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::broker::{BrokerResult, PrefixMapping};

    use super::*;

    struct VecReader {
        events: std::vec::IntoIter<StreamEvent>,
    }

    impl VecReader {
        fn new(events: Vec<StreamEvent>) -> Self {
            Self {
                events: events.into_iter(),
            }
        }
    }

    impl XmlStreamReader for VecReader {
        fn next_event(&mut self) -> BrokerResult<Option<StreamEvent>> {
            Ok(self.events.next())
        }
    }

    fn render(children: Vec<Vec<StreamEvent>>) -> String {
        let mut serializer = XmlSerializer::new(Vec::new());
        serializer.start_document().unwrap();
        let mut renderer = XmlStreamRenderer::new();
        for events in children {
            let mut reader = VecReader::new(events);
            renderer.render_child(&mut reader, &mut serializer).unwrap();
        }
        serializer.end_document().unwrap();
        String::from_utf8(serializer.into_inner()).unwrap()
    }

    #[test]
    fn test_empty_element_is_collapsed() {
        let out = render(vec![vec![
            StreamEvent::StartElement {
                name: QName::new("r"),
                attributes: vec![],
                namespaces: vec![],
            },
            StreamEvent::EndElement {
                name: QName::new("r"),
            },
        ]]);
        assert_eq!(out, r#"<?xml version="1.0" encoding="UTF-8"?><r/>"#);
    }

    #[test]
    fn test_text_and_attributes_are_escaped() {
        let out = render(vec![vec![
            StreamEvent::StartElement {
                name: QName::new("p"),
                attributes: vec![Attribute {
                    name: QName::new("title"),
                    value: "a \"quote\" & more".to_string(),
                }],
                namespaces: vec![],
            },
            StreamEvent::Characters("1 < 2 & 3".to_string()),
            StreamEvent::EndElement {
                name: QName::new("p"),
            },
        ]]);
        assert_eq!(
            out,
            r#"<?xml version="1.0" encoding="UTF-8"?><p title="a &quot;quote&quot; &amp; more">1 &lt; 2 &amp; 3</p>"#
        );
    }

    #[test]
    fn test_namespace_declarations() {
        let out = render(vec![vec![
            StreamEvent::StartElement {
                name: QName::with_prefix("x", "root", "urn:x"),
                attributes: vec![],
                namespaces: vec![
                    PrefixMapping {
                        prefix: "x".to_string(),
                        uri: "urn:x".to_string(),
                    },
                    PrefixMapping {
                        prefix: String::new(),
                        uri: "urn:default".to_string(),
                    },
                ],
            },
            StreamEvent::StartElement {
                name: QName::new("child"),
                attributes: vec![],
                namespaces: vec![],
            },
            StreamEvent::EndElement {
                name: QName::new("child"),
            },
            StreamEvent::EndElement {
                name: QName::with_prefix("x", "root", "urn:x"),
            },
        ]]);
        assert_eq!(
            out,
            r#"<?xml version="1.0" encoding="UTF-8"?><x:root xmlns:x="urn:x" xmlns="urn:default"><child/></x:root>"#
        );
    }

    #[test]
    fn test_document_events_are_suppressed() {
        let out = render(vec![vec![
            StreamEvent::StartDocument,
            StreamEvent::StartElement {
                name: QName::new("r"),
                attributes: vec![],
                namespaces: vec![],
            },
            StreamEvent::EndElement {
                name: QName::new("r"),
            },
            StreamEvent::EndDocument,
        ]]);
        assert_eq!(out, r#"<?xml version="1.0" encoding="UTF-8"?><r/>"#);
    }

    #[test]
    fn test_top_level_comment_and_pi() {
        let out = render(vec![
            vec![StreamEvent::Comment(" header ".to_string())],
            vec![StreamEvent::ProcessingInstruction {
                target: "xml-stylesheet".to_string(),
                data: r#"href="style.css""#.to_string(),
            }],
            vec![
                StreamEvent::StartElement {
                    name: QName::new("r"),
                    attributes: vec![],
                    namespaces: vec![],
                },
                StreamEvent::EndElement {
                    name: QName::new("r"),
                },
            ],
        ]);
        assert_eq!(
            out,
            r#"<?xml version="1.0" encoding="UTF-8"?><!-- header --><?xml-stylesheet href="style.css"?><r/>"#
        );
    }

    #[test]
    fn test_cdata_and_mixed_content() {
        let out = render(vec![vec![
            StreamEvent::StartElement {
                name: QName::new("s"),
                attributes: vec![],
                namespaces: vec![],
            },
            StreamEvent::CData("if (a < b) {}".to_string()),
            StreamEvent::Comment("done".to_string()),
            StreamEvent::EndElement {
                name: QName::new("s"),
            },
        ]]);
        assert_eq!(
            out,
            r#"<?xml version="1.0" encoding="UTF-8"?><s><![CDATA[if (a < b) {}]]><!--done--></s>"#
        );
    }

    /// Receiver recording prefix-mapping calls to check pairing order.
    #[derive(Default)]
    struct MappingRecorder {
        calls: Vec<String>,
    }

    impl Receiver for MappingRecorder {
        fn start_document(&mut self) -> RenderResult<()> {
            Ok(())
        }
        fn end_document(&mut self) -> RenderResult<()> {
            Ok(())
        }
        fn start_prefix_mapping(&mut self, prefix: &str, _uri: &str) -> RenderResult<()> {
            self.calls.push(format!("start {prefix}"));
            Ok(())
        }
        fn end_prefix_mapping(&mut self, prefix: &str) -> RenderResult<()> {
            self.calls.push(format!("end {prefix}"));
            Ok(())
        }
        fn start_element(&mut self, _name: &QName, _attributes: &[Attribute]) -> RenderResult<()> {
            Ok(())
        }
        fn end_element(&mut self, _name: &QName) -> RenderResult<()> {
            Ok(())
        }
        fn characters(&mut self, _text: &str) -> RenderResult<()> {
            Ok(())
        }
        fn cdata_section(&mut self, _text: &str) -> RenderResult<()> {
            Ok(())
        }
        fn comment(&mut self, _text: &str) -> RenderResult<()> {
            Ok(())
        }
        fn processing_instruction(&mut self, _target: &str, _data: &str) -> RenderResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_prefix_mappings_pair_in_reverse_order() {
        let mut recorder = MappingRecorder::default();
        let mut renderer = XmlStreamRenderer::new();
        let mut reader = VecReader::new(vec![
            StreamEvent::StartElement {
                name: QName::new("r"),
                attributes: vec![],
                namespaces: vec![
                    PrefixMapping {
                        prefix: "a".to_string(),
                        uri: "urn:a".to_string(),
                    },
                    PrefixMapping {
                        prefix: "b".to_string(),
                        uri: "urn:b".to_string(),
                    },
                ],
            },
            StreamEvent::EndElement {
                name: QName::new("r"),
            },
        ]);
        renderer.render_child(&mut reader, &mut recorder).unwrap();
        assert_eq!(recorder.calls, vec!["start a", "start b", "end b", "end a"]);
    }
}
