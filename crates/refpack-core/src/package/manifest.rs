//! XML documents stored alongside the payload of a package archive.

use super::PackageMetadata;
use crate::error::{Error, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::collections::BTreeSet;
use std::io::Cursor;

const NUSPEC_NAMESPACE: &str = "http://schemas.microsoft.com/packaging/2013/05/nuspec.xsd";
const CONTENT_TYPES_NAMESPACE: &str =
    "http://schemas.openxmlformats.org/package/2006/content-types";
const RELATIONSHIPS_NAMESPACE: &str =
    "http://schemas.openxmlformats.org/package/2006/relationships";
const MANIFEST_RELATIONSHIP: &str = "http://schemas.microsoft.com/packaging/2010/07/manifest";
const RELATIONSHIPS_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-package.relationships+xml";
const OCTET: &str = "application/octet";

struct XmlDocument {
    writer: Writer<Cursor<Vec<u8>>>,
}

impl XmlDocument {
    fn new() -> Result<Self> {
        let mut doc = Self {
            writer: Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2),
        };
        doc.emit(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
        Ok(doc)
    }

    fn emit(&mut self, event: Event<'_>) -> Result<()> {
        self.writer
            .write_event(event)
            .map_err(|e| Error::internal(format!("xml serialization failed: {e}")))
    }

    fn open(&mut self, element: BytesStart<'_>) -> Result<()> {
        self.emit(Event::Start(element))
    }

    fn close(&mut self, name: &str) -> Result<()> {
        self.emit(Event::End(BytesEnd::new(name)))
    }

    fn empty(&mut self, element: BytesStart<'_>) -> Result<()> {
        self.emit(Event::Empty(element))
    }

    fn text_element(&mut self, name: &str, text: &str) -> Result<()> {
        self.open(BytesStart::new(name))?;
        self.emit(Event::Text(BytesText::new(text)))?;
        self.close(name)
    }

    fn finish(self) -> Vec<u8> {
        self.writer.into_inner().into_inner()
    }
}

/// `<id>.nuspec`
pub(crate) fn nuspec(metadata: &PackageMetadata) -> Result<Vec<u8>> {
    let mut doc = XmlDocument::new()?;
    doc.open(BytesStart::new("package").with_attributes([("xmlns", NUSPEC_NAMESPACE)]))?;
    doc.open(BytesStart::new("metadata"))?;

    doc.text_element("id", &metadata.id)?;
    doc.text_element("version", &metadata.version)?;
    if !metadata.title.is_empty() {
        doc.text_element("title", &metadata.title)?;
    }
    let authors = if metadata.authors.is_empty() {
        metadata.id.clone()
    } else {
        metadata.authors.join(",")
    };
    doc.text_element("authors", &authors)?;
    doc.text_element("description", &metadata.description)?;
    if let Some(url) = &metadata.project_url {
        doc.text_element("projectUrl", url)?;
    }
    if let Some(icon) = &metadata.icon {
        doc.text_element("icon", icon)?;
    }
    if let Some(url) = &metadata.icon_url {
        doc.text_element("iconUrl", url)?;
    }
    if let Some(readme) = &metadata.readme {
        doc.text_element("readme", readme)?;
    }
    if !metadata.tags.is_empty() {
        doc.text_element("tags", &metadata.tags.join(" "))?;
    }
    if let Some(repository) = &metadata.repository {
        let mut element = BytesStart::new("repository");
        if !repository.kind.is_empty() {
            element.push_attribute(("type", repository.kind.as_str()));
        }
        element.push_attribute(("url", repository.url.as_str()));
        doc.empty(element)?;
    }

    doc.close("metadata")?;
    doc.close("package")?;
    Ok(doc.finish())
}

/// `[Content_Types].xml` covering every payload extension
pub(crate) fn content_types<'a>(payload: impl IntoIterator<Item = &'a str>) -> Result<Vec<u8>> {
    let extensions: BTreeSet<String> = payload
        .into_iter()
        .filter_map(|path| {
            let name = path.rsplit('/').next().unwrap_or(path);
            name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase())
        })
        .filter(|ext| ext != "rels" && ext != "nuspec")
        .collect();

    let mut doc = XmlDocument::new()?;
    doc.open(BytesStart::new("Types").with_attributes([("xmlns", CONTENT_TYPES_NAMESPACE)]))?;
    doc.empty(BytesStart::new("Default").with_attributes([
        ("Extension", "rels"),
        ("ContentType", RELATIONSHIPS_CONTENT_TYPE),
    ]))?;
    doc.empty(
        BytesStart::new("Default").with_attributes([("Extension", "nuspec"), ("ContentType", OCTET)]),
    )?;
    for ext in &extensions {
        doc.empty(
            BytesStart::new("Default")
                .with_attributes([("Extension", ext.as_str()), ("ContentType", OCTET)]),
        )?;
    }
    doc.close("Types")?;
    Ok(doc.finish())
}

/// `_rels/.rels` pointing at the manifest
pub(crate) fn relationships(nuspec_name: &str) -> Result<Vec<u8>> {
    let target = format!("/{nuspec_name}");
    let mut doc = XmlDocument::new()?;
    doc.open(
        BytesStart::new("Relationships").with_attributes([("xmlns", RELATIONSHIPS_NAMESPACE)]),
    )?;
    doc.empty(BytesStart::new("Relationship").with_attributes([
        ("Type", MANIFEST_RELATIONSHIP),
        ("Target", target.as_str()),
        ("Id", "R0"),
    ]))?;
    doc.close("Relationships")?;
    Ok(doc.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::Repository;

    fn metadata() -> PackageMetadata {
        PackageMetadata {
            id: "Ref.Lib".into(),
            version: "1.5.0.0".into(),
            title: "Stripped Lib Reference".into(),
            description: "Stripped reference package for Lib.dll.".into(),
            authors: vec!["Ann".into(), "Bo".into()],
            tags: vec!["modding".into(), "reference".into()],
            repository: Some(Repository::from_url("https://example.org/lib.git")),
            readme: Some("README.md".into()),
            ..PackageMetadata::default()
        }
    }

    #[test]
    fn test_nuspec_contents() {
        let xml = String::from_utf8(nuspec(&metadata()).unwrap()).unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?>"));
        assert!(xml.contains("<id>Ref.Lib</id>"));
        assert!(xml.contains("<version>1.5.0.0</version>"));
        assert!(xml.contains("<authors>Ann,Bo</authors>"));
        assert!(xml.contains("<tags>modding reference</tags>"));
        assert!(xml.contains("<readme>README.md</readme>"));
        assert!(xml.contains(r#"<repository type="git" url="https://example.org/lib.git"/>"#));
        assert!(!xml.contains("<projectUrl>"));
    }

    #[test]
    fn test_nuspec_escapes_text() {
        let mut metadata = metadata();
        metadata.description = "Types <T> & more".into();
        let xml = String::from_utf8(nuspec(&metadata).unwrap()).unwrap();
        assert!(xml.contains("Types &lt;T&gt; &amp; more"));
    }

    #[test]
    fn test_content_types_lists_payload_extensions() {
        let xml = String::from_utf8(
            content_types(["ref/net472/Lib.dll", "ref/net472/Lib.XML", "icon.png"]).unwrap(),
        )
        .unwrap();
        assert!(xml.contains(r#"Extension="dll""#));
        assert!(xml.contains(r#"Extension="xml""#));
        assert!(xml.contains(r#"Extension="png""#));
        assert_eq!(xml.matches(r#"Extension="xml""#).count(), 1);
    }

    #[test]
    fn test_relationships_target_manifest() {
        let xml = String::from_utf8(relationships("Ref.Lib.nuspec").unwrap()).unwrap();
        assert!(xml.contains(r#"Target="/Ref.Lib.nuspec""#));
    }
}
