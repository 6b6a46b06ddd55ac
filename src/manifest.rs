use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::ManifestError;

pub const MANIFEST_FILE: &str = "cmi5.xml";

/// One element of a parsed manifest document.
///
/// Names are namespace-stripped local names. Text holds the concatenated,
/// trimmed character data directly inside the element.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocNode {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<DocNode>,
}

impl DocNode {
    pub fn new(name: impl Into<String>) -> Self {
        DocNode { name: name.into(), ..Default::default() }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&DocNode> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a DocNode> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Text of a child element, looking through `<langstring>` wrappers.
    pub fn text_of(&self, name: &str) -> Option<String> {
        let node = self.child(name)?;
        if !node.text.is_empty() {
            return Some(node.text.clone());
        }
        node.children_named("langstring")
            .map(|l| l.text.as_str())
            .find(|t| !t.is_empty())
            .map(str::to_string)
    }
}

/// Unpack a zip archive into `out_dir`, returning the number of files written.
pub fn extract_zip_to_dir(bytes: &[u8], out_dir: &Path) -> Result<usize, ManifestError> {
    std::fs::create_dir_all(out_dir)?;
    let reader = std::io::Cursor::new(bytes);
    let mut zip = zip::ZipArchive::new(reader).map_err(|_| ManifestError::UnsupportedFormat)?;
    let mut written = 0;
    for i in 0..zip.len() {
        let mut file = zip.by_index(i).map_err(|_| ManifestError::UnsupportedFormat)?;
        // entries escaping the extraction root are skipped
        let Some(rel) = file.enclosed_name().map(Path::to_path_buf) else {
            tracing::warn!(entry = file.name(), "skipping unsafe archive entry");
            continue;
        };
        let outpath = out_dir.join(rel);
        if file.is_dir() {
            std::fs::create_dir_all(&outpath)?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut outfile = std::fs::File::create(&outpath)?;
        std::io::copy(&mut file, &mut outfile)?;
        written += 1;
    }
    Ok(written)
}

/// Locate the shallowest `cmi5.xml` below `dir`.
pub fn find_manifest(dir: &Path) -> Result<PathBuf, ManifestError> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && e.file_name() == MANIFEST_FILE)
        .min_by_key(|e| e.depth())
        .map(|e| e.path().to_path_buf())
        .ok_or(ManifestError::Missing)
}

/// Read and parse a manifest found by [`find_manifest`]. Read failures stay
/// I/O errors and bytes that are not UTF-8 are a parse error.
pub fn parse_manifest_file(path: &Path) -> Result<DocNode, ManifestError> {
    let bytes = std::fs::read(path)?;
    let xml = String::from_utf8(bytes)
        .map_err(|e| ManifestError::Parse(format!("manifest is not UTF-8: {}", e.utf8_error())))?;
    parse_document(&xml)
}

/// Tokenize an XML document into a [`DocNode`] tree.
pub fn parse_document(xml: &str) -> Result<DocNode, ManifestError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut buf = Vec::new();
    // open elements, innermost last
    let mut stack: Vec<DocNode> = Vec::new();
    let mut root: Option<DocNode> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => stack.push(open_node(&e)?),
            Ok(Event::Empty(e)) => {
                let node = open_node(&e)?;
                attach(&mut stack, &mut root, node)?;
            }
            Ok(Event::Text(t)) => {
                if let Some(top) = stack.last_mut() {
                    let text = t.unescape().map_err(|e| ManifestError::Parse(e.to_string()))?;
                    append_text(&mut top.text, text.trim());
                }
            }
            Ok(Event::CData(c)) => {
                if let Some(top) = stack.last_mut() {
                    append_text(&mut top.text, String::from_utf8_lossy(&c.into_inner()).trim());
                }
            }
            Ok(Event::End(_)) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| ManifestError::Parse("unbalanced closing tag".into()))?;
                attach(&mut stack, &mut root, node)?;
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ManifestError::Parse(format!(
                    "at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(ManifestError::Parse("unclosed element at end of document".into()));
    }
    root.ok_or_else(|| ManifestError::Parse("empty document".into()))
}

// ------------- helpers -------------

fn open_node(e: &BytesStart<'_>) -> Result<DocNode, ManifestError> {
    let mut node = DocNode::new(local_name(e));
    for a in e.attributes() {
        let a = a.map_err(|err| ManifestError::Parse(err.to_string()))?;
        let key = String::from_utf8_lossy(a.key.local_name().as_ref()).to_string();
        let value = a
            .unescape_value()
            .map_err(|err| ManifestError::Parse(err.to_string()))?
            .into_owned();
        node.attrs.push((key, value));
    }
    Ok(node)
}

fn attach(stack: &mut [DocNode], root: &mut Option<DocNode>, node: DocNode) -> Result<(), ManifestError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None if root.is_none() => *root = Some(node),
        None => return Err(ManifestError::Parse("multiple root elements".into())),
    }
    Ok(())
}

fn append_text(into: &mut String, text: &str) {
    if text.is_empty() {
        return;
    }
    if !into.is_empty() {
        into.push(' ');
    }
    into.push_str(text);
}

fn local_name(tag: &BytesStart<'_>) -> String {
    let full = String::from_utf8_lossy(tag.name().as_ref()).to_string();
    full.split(':').last().unwrap_or(&full).to_string()
}
