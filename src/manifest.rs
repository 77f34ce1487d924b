//! Writing and reading the per-collection manifest `__contents__.xml`.

use std::{collections::BTreeMap, io::Write};

use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::{
    events::{BytesDecl, BytesEnd, BytesStart, Event},
    Reader, Writer,
};

use crate::db::{collection::Collection, document::Document};

/// The reserved namespace of backup manifests, bound to the empty prefix.
pub const BACKUP_NAMESPACE: &str = "https://xylo-db.org/ns/backup";

/// Schema version written into every manifest.
pub const MANIFEST_VERSION: u32 = 1;

/// [`ManifestErrorKind`] describes the errors that can occur around manifests
#[derive(thiserror::Error, Debug, displaydoc::Display)]
#[non_exhaustive]
pub enum ManifestErrorKind {
    /// writing manifest failed: `{0}`
    Writing(String),
    /// parsing manifest failed: `{0:?}`
    Parsing(#[from] quick_xml::Error),
    /// malformed manifest attribute: `{0}`
    MalformedAttribute(String),
    /// manifest entry is missing attribute `{0}`
    MissingAttribute(&'static str),
}

pub(crate) type ManifestResult<T> = Result<T, ManifestErrorKind>;

fn write_err(err: impl std::fmt::Display) -> ManifestErrorKind {
    ManifestErrorKind::Writing(err.to_string())
}

fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Attributes of the manifest's root `collection` element.
#[derive(Clone, Debug)]
pub struct CollectionAttributes {
    /// Full database path of the collection.
    pub name: String,
    /// Owning user.
    pub owner: String,
    /// Owning group.
    pub group: String,
    /// Permission bits.
    pub mode: u32,
    /// Creation timestamp.
    pub created: DateTime<Utc>,
}

impl CollectionAttributes {
    pub(crate) fn from_collection(collection: &Collection) -> Self {
        Self {
            name: collection.uri.as_str().to_string(),
            owner: collection.permission.owner.clone(),
            group: collection.permission.group.clone(),
            mode: collection.permission.mode,
            created: collection.created,
        }
    }

    /// The synthetic manifest attributes of the lost-and-found collection.
    pub(crate) fn lost_and_found() -> Self {
        let permission = crate::db::Permission::dba();
        Self {
            name: crate::uri::LOST_AND_FOUND.to_string(),
            owner: permission.owner,
            group: permission.group,
            mode: permission.mode,
            created: Utc::now(),
        }
    }
}

/// Attributes of one `resource` manifest entry.
#[derive(Clone, Debug)]
pub struct ResourceAttributes {
    /// `XMLResource` or `BinaryResource`.
    pub kind: &'static str,
    /// Original file name.
    pub name: String,
    /// Safe-encoded file name, equal to the archive entry name.
    pub filename: String,
    /// Whether the payload entry was omitted under the incremental rule.
    pub skip: bool,
    /// Owning user.
    pub owner: String,
    /// Owning group.
    pub group: String,
    /// Permission bits.
    pub mode: u32,
    /// Creation timestamp.
    pub created: DateTime<Utc>,
    /// Last-modified timestamp.
    pub modified: DateTime<Utc>,
    /// Mime type.
    pub mimetype: String,
    /// DOCTYPE triple, present only for XML documents declaring one.
    pub doctype: Option<crate::db::document::Doctype>,
}

impl ResourceAttributes {
    pub(crate) fn from_document(doc: &Document, skip: bool) -> Self {
        let meta = doc.meta();
        let doctype = match doc {
            Document::Xml(xml) => xml.doctype.clone(),
            Document::Binary(_) => None,
        };
        Self {
            kind: doc.type_name(),
            name: meta.name.clone(),
            filename: crate::uri::safe_encode(&meta.name),
            skip,
            owner: meta.permission.owner.clone(),
            group: meta.permission.group.clone(),
            mode: meta.permission.mode,
            created: meta.created,
            modified: meta.modified,
            mimetype: meta.mime_type.clone(),
            doctype,
        }
    }
}

/// Kind discriminator of a `deleted` manifest entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeletedKind {
    /// A subcollection that disappeared since the predecessor backup.
    Collection,
    /// A resource that disappeared since the predecessor backup.
    Resource,
}

impl DeletedKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Collection => "collection",
            Self::Resource => "resource",
        }
    }
}

/// Streaming writer for one collection manifest.
///
/// The manifest is indented; resource payloads are not (they go through the
/// serializer, not through this writer).
pub struct ManifestWriter<W: Write> {
    writer: Writer<W>,
}

impl<W: Write> ManifestWriter<W> {
    /// Create a manifest writer over the given output.
    pub fn new(inner: W) -> Self {
        Self {
            writer: Writer::new_with_indent(inner, b' ', 4),
        }
    }

    /// Write the XML declaration and the opening `collection` element.
    pub fn start_collection(&mut self, attrs: &CollectionAttributes) -> ManifestResult<()> {
        self.writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(write_err)?;
        let version = MANIFEST_VERSION.to_string();
        let mode = format!("{:o}", attrs.mode);
        let created = format_date(&attrs.created);
        let mut elem = BytesStart::new("collection");
        elem.push_attribute(("xmlns", BACKUP_NAMESPACE));
        elem.push_attribute(("name", attrs.name.as_str()));
        elem.push_attribute(("version", version.as_str()));
        elem.push_attribute(("owner", attrs.owner.as_str()));
        elem.push_attribute(("group", attrs.group.as_str()));
        elem.push_attribute(("mode", mode.as_str()));
        elem.push_attribute(("created", created.as_str()));
        self.writer
            .write_event(Event::Start(elem))
            .map_err(write_err)
    }

    /// Write one `subcollection` entry.
    pub fn subcollection(&mut self, name: &str, filename: &str) -> ManifestResult<()> {
        let mut elem = BytesStart::new("subcollection");
        elem.push_attribute(("name", name));
        elem.push_attribute(("filename", filename));
        self.writer
            .write_event(Event::Empty(elem))
            .map_err(write_err)
    }

    /// Write one `resource` entry.
    pub fn resource(&mut self, attrs: &ResourceAttributes) -> ManifestResult<()> {
        let mode = format!("{:o}", attrs.mode);
        let created = format_date(&attrs.created);
        let modified = format_date(&attrs.modified);
        let mut elem = BytesStart::new("resource");
        elem.push_attribute(("type", attrs.kind));
        elem.push_attribute(("name", attrs.name.as_str()));
        elem.push_attribute(("filename", attrs.filename.as_str()));
        elem.push_attribute(("skip", if attrs.skip { "yes" } else { "no" }));
        elem.push_attribute(("owner", attrs.owner.as_str()));
        elem.push_attribute(("group", attrs.group.as_str()));
        elem.push_attribute(("mode", mode.as_str()));
        elem.push_attribute(("created", created.as_str()));
        elem.push_attribute(("modified", modified.as_str()));
        elem.push_attribute(("mimetype", attrs.mimetype.as_str()));
        if let Some(doctype) = &attrs.doctype {
            elem.push_attribute(("namedoctype", doctype.name.as_str()));
            if let Some(public_id) = &doctype.public_id {
                elem.push_attribute(("publicid", public_id.as_str()));
            }
            if let Some(system_id) = &doctype.system_id {
                elem.push_attribute(("systemid", system_id.as_str()));
            }
        }
        self.writer
            .write_event(Event::Empty(elem))
            .map_err(write_err)
    }

    /// Write one `deleted` entry.
    pub fn deleted(&mut self, name: &str, kind: DeletedKind) -> ManifestResult<()> {
        let mut elem = BytesStart::new("deleted");
        elem.push_attribute(("name", name));
        elem.push_attribute(("type", kind.as_str()));
        self.writer
            .write_event(Event::Empty(elem))
            .map_err(write_err)
    }

    /// Close the `collection` element and hand back the output.
    pub fn finish(mut self) -> ManifestResult<W> {
        self.writer
            .write_event(Event::End(BytesEnd::new("collection")))
            .map_err(write_err)?;
        Ok(self.writer.into_inner())
    }
}

/// One parsed manifest entry.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ManifestEntry {
    /// A `subcollection` entry.
    Subcollection {
        /// Original collection name.
        name: String,
        /// Safe-encoded name.
        filename: String,
    },
    /// A `resource` entry.
    Resource {
        /// Original file name.
        name: String,
        /// Safe-encoded name.
        filename: String,
        /// `XMLResource` or `BinaryResource`.
        kind: String,
        /// Whether the payload entry was omitted.
        skip: bool,
        /// All attributes of the entry, by name.
        attributes: BTreeMap<String, String>,
    },
    /// A `deleted` entry.
    Deleted {
        /// Name of the vanished item.
        name: String,
        /// `collection` or `resource`.
        kind: String,
    },
}

impl ManifestEntry {
    /// The `name` attribute of any entry kind.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Subcollection { name, .. }
            | Self::Resource { name, .. }
            | Self::Deleted { name, .. } => name,
        }
    }
}

/// A parsed collection manifest.
#[derive(Clone, Debug, Default)]
pub struct Manifest {
    /// Attributes of the `collection` element, by name.
    pub attributes: BTreeMap<String, String>,
    /// Child entries in document order.
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Iterate the resource entries.
    pub fn resources(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries
            .iter()
            .filter(|entry| matches!(entry, ManifestEntry::Resource { .. }))
    }

    /// Find a resource entry by its original name.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&ManifestEntry> {
        self.resources().find(|entry| entry.name() == name)
    }
}

fn attr_map(elem: &BytesStart<'_>) -> ManifestResult<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for attr in elem.attributes() {
        let attr = attr.map_err(|err| ManifestErrorKind::MalformedAttribute(err.to_string()))?;
        let key = String::from_utf8(attr.key.as_ref().to_vec())
            .map_err(|err| ManifestErrorKind::MalformedAttribute(err.to_string()))?;
        if key.starts_with("xmlns") {
            continue;
        }
        let raw = std::str::from_utf8(&attr.value)
            .map_err(|err| ManifestErrorKind::MalformedAttribute(err.to_string()))?;
        let value = quick_xml::escape::unescape(raw)
            .map_err(|err| ManifestErrorKind::MalformedAttribute(err.to_string()))?;
        let _ = map.insert(key, value.into_owned());
    }
    Ok(map)
}

fn take(map: &mut BTreeMap<String, String>, key: &'static str) -> ManifestResult<String> {
    map.remove(key).ok_or(ManifestErrorKind::MissingAttribute(key))
}

/// Parse a manifest produced by [`ManifestWriter`].
///
/// # Errors
///
/// * [`ManifestErrorKind::Parsing`] - If the XML is not well-formed.
/// * [`ManifestErrorKind::MissingAttribute`] - If a required attribute is absent.
pub fn read_manifest(bytes: &[u8]) -> ManifestResult<Manifest> {
    let mut reader = Reader::from_reader(bytes);
    let mut manifest = Manifest::default();
    loop {
        match reader.read_event()? {
            Event::Start(elem) | Event::Empty(elem) => {
                let mut attrs = attr_map(&elem)?;
                match elem.name().as_ref() {
                    b"collection" => manifest.attributes = attrs,
                    b"subcollection" => manifest.entries.push(ManifestEntry::Subcollection {
                        name: take(&mut attrs, "name")?,
                        filename: take(&mut attrs, "filename")?,
                    }),
                    b"resource" => {
                        let name = take(&mut attrs, "name")?;
                        let filename = take(&mut attrs, "filename")?;
                        let kind = take(&mut attrs, "type")?;
                        let skip = attrs.remove("skip").as_deref() == Some("yes");
                        manifest.entries.push(ManifestEntry::Resource {
                            name,
                            filename,
                            kind,
                            skip,
                            attributes: attrs,
                        });
                    }
                    b"deleted" => manifest.entries.push(ManifestEntry::Deleted {
                        name: take(&mut attrs, "name")?,
                        kind: take(&mut attrs, "type")?,
                    }),
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample_attrs() -> CollectionAttributes {
        CollectionAttributes {
            name: "/db/shelf".to_string(),
            owner: "admin".to_string(),
            group: "dba".to_string(),
            mode: 0o755,
            created: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_manifest_roundtrips() {
        let mut writer = ManifestWriter::new(Vec::new());
        writer.start_collection(&sample_attrs()).unwrap();
        writer.subcollection("my coll", "my%20coll").unwrap();
        writer
            .resource(&ResourceAttributes {
                kind: "XMLResource",
                name: "a.xml".to_string(),
                filename: "a.xml".to_string(),
                skip: false,
                owner: "admin".to_string(),
                group: "dba".to_string(),
                mode: 0o644,
                created: Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).unwrap(),
                modified: Utc.with_ymd_and_hms(2023, 1, 3, 0, 0, 0).unwrap(),
                mimetype: "application/xml".to_string(),
                doctype: None,
            })
            .unwrap();
        writer.deleted("c.xml", DeletedKind::Resource).unwrap();
        let bytes = writer.finish().unwrap();

        let manifest = read_manifest(&bytes).unwrap();
        assert_eq!(
            manifest.attributes.get("name").map(String::as_str),
            Some("/db/shelf")
        );
        assert_eq!(
            manifest.attributes.get("version").map(String::as_str),
            Some("1")
        );
        assert_eq!(
            manifest.attributes.get("mode").map(String::as_str),
            Some("755")
        );
        assert_eq!(manifest.entries.len(), 3);
        assert_eq!(
            manifest.entries[0],
            ManifestEntry::Subcollection {
                name: "my coll".to_string(),
                filename: "my%20coll".to_string(),
            }
        );
        match &manifest.entries[1] {
            ManifestEntry::Resource {
                name,
                kind,
                skip,
                attributes,
                ..
            } => {
                assert_eq!(name, "a.xml");
                assert_eq!(kind, "XMLResource");
                assert!(!skip);
                assert_eq!(
                    attributes.get("mimetype").map(String::as_str),
                    Some("application/xml")
                );
            }
            other => panic!("unexpected entry {other:?}"),
        }
        assert_eq!(
            manifest.entries[2],
            ManifestEntry::Deleted {
                name: "c.xml".to_string(),
                kind: "resource".to_string(),
            }
        );
    }

    #[test]
    fn test_doctype_attributes_are_optional() {
        let mut writer = ManifestWriter::new(Vec::new());
        writer.start_collection(&sample_attrs()).unwrap();
        writer
            .resource(&ResourceAttributes {
                kind: "XMLResource",
                name: "page.html".to_string(),
                filename: "page.html".to_string(),
                skip: true,
                owner: "admin".to_string(),
                group: "dba".to_string(),
                mode: 0o644,
                created: Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).unwrap(),
                modified: Utc.with_ymd_and_hms(2023, 1, 3, 0, 0, 0).unwrap(),
                mimetype: "text/html".to_string(),
                doctype: Some(crate::db::document::Doctype {
                    name: "html".to_string(),
                    public_id: None,
                    system_id: Some("about:legacy-compat".to_string()),
                }),
            })
            .unwrap();
        let bytes = writer.finish().unwrap();

        let manifest = read_manifest(&bytes).unwrap();
        match &manifest.entries[0] {
            ManifestEntry::Resource {
                skip, attributes, ..
            } => {
                assert!(skip);
                assert_eq!(
                    attributes.get("namedoctype").map(String::as_str),
                    Some("html")
                );
                assert_eq!(
                    attributes.get("systemid").map(String::as_str),
                    Some("about:legacy-compat")
                );
                assert_eq!(attributes.get("publicid"), None);
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn test_attribute_values_are_escaped() {
        let mut writer = ManifestWriter::new(Vec::new());
        let mut attrs = sample_attrs();
        attrs.name = "/db/a<b&c".to_string();
        writer.start_collection(&attrs).unwrap();
        let bytes = writer.finish().unwrap();

        let manifest = read_manifest(&bytes).unwrap();
        assert_eq!(
            manifest.attributes.get("name").map(String::as_str),
            Some("/db/a<b&c")
        );
    }
}
