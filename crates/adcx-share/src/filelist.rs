//! File list and share cache documents.
//!
//! Three XML shapes leave this module: the (partial or full) file listing
//! served to peers, the TTH-only listing, and the per-root share cache
//! written to disk so startup can skip the full disk walk. All three are
//! streamed into a buffer by hand; the cache comes back in through a
//! minimal pull parser for exactly the subset written here.

use crate::dual_string::DualString;
use crate::error::ShareError;
use crate::profile::{GeneratedList, ProfileToken, ShareRoot};
use crate::tree::{DirPtr, Directory, ShareTree};
use adcx_proto::{Cid, TthValue};
use bzip2::write::BzEncoder;
use bzip2::Compression;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// Version attribute of generated file listings.
pub const FILELIST_VERSION: &str = "1";

/// Version attribute of the share cache format.
pub const CACHE_VERSION: &str = "3";

const XML_HEADER: &str = "<?xml version=\"1.0\" encoding=\"utf-8\" standalone=\"yes\"?>\r\n";

/// Escape a value for an XML attribute.
#[must_use]
pub fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

/// Reverse of [`xml_escape`].
#[must_use]
pub fn xml_unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn generator() -> String {
    format!("adcx {}", env!("CARGO_PKG_VERSION"))
}

fn write_file_entries(out: &mut String, dir: &DirPtr, indent: &str) {
    for file in dir.file_list() {
        out.push_str(indent);
        out.push_str(&format!(
            "<File Name=\"{}\" Size=\"{}\" TTH=\"{}\"/>\r\n",
            xml_escape(file.name.original()),
            file.size,
            file.tth.to_base32()
        ));
    }
}

fn write_directory(out: &mut String, dir: &DirPtr, indent: &str, recursive: bool) {
    for child in dir.directories() {
        out.push_str(indent);
        if recursive {
            out.push_str(&format!(
                "<Directory Name=\"{}\" Date=\"{}\">\r\n",
                xml_escape(child.name.original()),
                child.last_write()
            ));
            let deeper = format!("{indent}\t");
            write_directory(out, &child, &deeper, true);
            write_file_entries(out, &child, &deeper);
            out.push_str(indent);
            out.push_str("</Directory>\r\n");
        } else {
            let (size, _, _) = child.totals();
            out.push_str(&format!(
                "<Directory Name=\"{}\" Date=\"{}\" Incomplete=\"1\" Size=\"{}\"/>\r\n",
                xml_escape(child.name.original()),
                child.last_write(),
                size
            ));
        }
    }
}

/// Generate a partial file list for one virtual path.
///
/// Without `recursive`, child directories are emitted as incomplete stubs
/// carrying their aggregated size.
///
/// # Errors
///
/// `FileNotAvailable` when the path is malformed or invisible to the
/// profile.
pub fn generate_partial_list(
    tree: &ShareTree,
    adc_path: &str,
    recursive: bool,
    profile: ProfileToken,
    cid: &Cid,
) -> Result<Vec<u8>, ShareError> {
    if !adc_path.starts_with('/') || !adc_path.ends_with('/') {
        return Err(ShareError::FileNotAvailable(adc_path.to_string()));
    }

    let mut out = String::from(XML_HEADER);
    out.push_str(&format!(
        "<FileListing Version=\"{}\" CID=\"{}\" Base=\"{}\" Generator=\"{}\">\r\n",
        FILELIST_VERSION,
        cid.to_base32(),
        xml_escape(adc_path),
        xml_escape(&generator())
    ));

    if adc_path == "/" {
        for root in tree.roots_for_profile(profile) {
            if recursive {
                out.push_str(&format!(
                    "\t<Directory Name=\"{}\" Date=\"{}\">\r\n",
                    xml_escape(root.name.original()),
                    root.last_write()
                ));
                write_directory(&mut out, &root, "\t\t", true);
                write_file_entries(&mut out, &root, "\t\t");
                out.push_str("\t</Directory>\r\n");
            } else {
                let (size, _, _) = root.totals();
                out.push_str(&format!(
                    "\t<Directory Name=\"{}\" Date=\"{}\" Incomplete=\"1\" Size=\"{}\"/>\r\n",
                    xml_escape(root.name.original()),
                    root.last_write(),
                    size
                ));
            }
        }
    } else {
        let dir = tree.resolve_virtual(adc_path, profile)?;
        write_directory(&mut out, &dir, "\t", recursive);
        write_file_entries(&mut out, &dir, "\t");
    }

    out.push_str("</FileListing>\r\n");
    Ok(out.into_bytes())
}

/// Generate the full file list for a profile, plus its bzip2 form.
#[must_use]
pub fn generate_full_list(tree: &ShareTree, profile: ProfileToken, cid: &Cid) -> GeneratedList {
    let revision = tree.revision();
    let xml = generate_partial_list(tree, "/", true, profile, cid)
        .unwrap_or_else(|_| Vec::new());

    let mut encoder = BzEncoder::new(Vec::new(), Compression::default());
    let bz2 = encoder
        .write_all(&xml)
        .and_then(|()| encoder.finish())
        .unwrap_or_default();

    GeneratedList { xml, bz2, revision }
}

/// Generate the TTH-only listing for a virtual path.
///
/// # Errors
///
/// Resolution failures from [`ShareTree::resolve_virtual`].
pub fn generate_tth_list(
    tree: &ShareTree,
    adc_path: &str,
    recursive: bool,
    profile: ProfileToken,
) -> Result<Vec<u8>, ShareError> {
    let dir = tree.resolve_virtual(adc_path, profile)?;
    let mut out = String::new();
    tth_entries(&mut out, &dir, recursive);
    if out.is_empty() {
        return Err(ShareError::FileNotAvailable(adc_path.to_string()));
    }
    Ok(out.into_bytes())
}

fn tth_entries(out: &mut String, dir: &DirPtr, recursive: bool) {
    for file in dir.file_list() {
        out.push_str(&format!("<File TTH=\"{}\"/>\r\n", file.tth.to_base32()));
    }
    if recursive {
        for child in dir.directories() {
            tth_entries(out, &child, true);
        }
    }
}

/// File name of the cache document for one root.
#[must_use]
pub fn cache_file_name(root_path: &Path) -> String {
    // Stable FNV-1a of the lower-cased path keeps one file per root.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in root_path.to_string_lossy().to_lowercase().as_bytes() {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x1000_0000_01b3);
    }
    format!("ShareCache_{hash:016x}.xml")
}

/// Write one root's cache document into `cache_dir`.
///
/// # Errors
///
/// Filesystem errors while writing; the write goes through a temp file and
/// a rename.
pub fn save_root_cache(root_dir: &DirPtr, cache_dir: &Path) -> Result<PathBuf, ShareError> {
    let root = root_dir.root().ok_or_else(|| ShareError::InvalidRoot {
        path: root_dir.real_path(),
        message: "not a root node".into(),
    })?;

    let mut out = String::from(XML_HEADER);
    out.push_str(&format!(
        "<Share Version=\"{}\" Path=\"{}\" Date=\"{}\">\r\n",
        CACHE_VERSION,
        xml_escape(&root.path.to_string_lossy()),
        root_dir.last_write()
    ));
    write_directory(&mut out, root_dir, "\t", true);
    write_file_entries(&mut out, root_dir, "\t");
    out.push_str("</Share>\r\n");

    let target = cache_dir.join(cache_file_name(&root.path));
    let tmp = target.with_extension("xml.tmp");
    std::fs::write(&tmp, out.as_bytes())?;
    std::fs::rename(&tmp, &target)?;
    Ok(target)
}

/// Rebuild a root subtree from its cache document.
///
/// # Errors
///
/// Read or parse failures; a partial document yields an error rather than
/// a half-filled tree.
pub fn load_root_cache(
    cache_file: &Path,
    root: Arc<ShareRoot>,
) -> Result<DirPtr, ShareError> {
    let text = std::fs::read_to_string(cache_file)?;
    let mut parser = CacheParser::new(&text);

    let share = parser
        .next_tag()?
        .filter(|t| t.name == "Share")
        .ok_or_else(|| parse_error(cache_file, "missing Share element"))?;
    let date = share.attr("Date").and_then(|d| d.parse().ok()).unwrap_or(0);

    let dir = Directory::new_root(root, date);
    parse_children(&mut parser, &dir, cache_file)?;
    Ok(dir)
}

fn parse_error(file: &Path, message: &str) -> ShareError {
    ShareError::RefreshRejected(format!("share cache {}: {message}", file.display()))
}

fn parse_children(
    parser: &mut CacheParser<'_>,
    parent: &DirPtr,
    file: &Path,
) -> Result<(), ShareError> {
    while let Some(tag) = parser.next_tag()? {
        match (tag.name.as_str(), tag.closing, tag.self_closing) {
            ("Directory", false, self_closing) => {
                let name = tag
                    .attr("Name")
                    .ok_or_else(|| parse_error(file, "Directory without Name"))?;
                let date = tag.attr("Date").and_then(|d| d.parse().ok()).unwrap_or(0);
                let child = Directory::new_child(parent, DualString::new(name), date);
                if !self_closing {
                    parse_children(parser, &child, file)?;
                }
            }
            ("File", false, _) => {
                let name = tag
                    .attr("Name")
                    .ok_or_else(|| parse_error(file, "File without Name"))?;
                let size = tag
                    .attr("Size")
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| parse_error(file, "File without Size"))?;
                let tth = tag
                    .attr("TTH")
                    .and_then(|t| TthValue::from_str(&t).ok())
                    .ok_or_else(|| parse_error(file, "File without TTH"))?;
                let date = tag.attr("Date").and_then(|d| d.parse().ok()).unwrap_or(0);
                let _ = Directory::add_file(parent, DualString::new(name), size, date, tth);
            }
            (_, true, _) => return Ok(()),
            _ => {}
        }
    }
    Ok(())
}

struct ParsedTag {
    name: String,
    closing: bool,
    self_closing: bool,
    attrs: Vec<(String, String)>,
}

impl ParsedTag {
    fn attr(&self, key: &str) -> Option<String> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| xml_unescape(v))
    }
}

/// Pull parser for the attribute-only XML subset written above.
struct CacheParser<'a> {
    rest: &'a str,
}

impl<'a> CacheParser<'a> {
    fn new(text: &'a str) -> Self {
        CacheParser { rest: text }
    }

    fn next_tag(&mut self) -> Result<Option<ParsedTag>, ShareError> {
        loop {
            let Some(start) = self.rest.find('<') else {
                return Ok(None);
            };
            self.rest = &self.rest[start + 1..];
            if self.rest.starts_with('?') || self.rest.starts_with('!') {
                // Prolog or comment; skip to the closing angle.
                match self.rest.find('>') {
                    Some(end) => {
                        self.rest = &self.rest[end + 1..];
                        continue;
                    }
                    None => return Ok(None),
                }
            }

            let end = self
                .rest
                .find('>')
                .ok_or_else(|| ShareError::RefreshRejected("unterminated tag".into()))?;
            let mut body = &self.rest[..end];
            self.rest = &self.rest[end + 1..];

            let closing = body.starts_with('/');
            if closing {
                body = &body[1..];
            }
            let self_closing = body.ends_with('/');
            if self_closing {
                body = &body[..body.len() - 1];
            }

            let mut parts = body.splitn(2, char::is_whitespace);
            let name = parts.next().unwrap_or("").trim().to_string();
            let mut attrs = Vec::new();
            if let Some(attr_text) = parts.next() {
                let mut rest = attr_text.trim();
                while let Some(eq) = rest.find('=') {
                    let key = rest[..eq].trim().to_string();
                    let after = rest[eq + 1..].trim_start();
                    if !after.starts_with('"') {
                        break;
                    }
                    let Some(close) = after[1..].find('"') else { break };
                    attrs.push((key, after[1..=close].to_string()));
                    rest = &after[close + 2..];
                }
            }

            return Ok(Some(ParsedTag {
                name,
                closing,
                self_closing,
                attrs,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adcx_proto::tth::hash_buffer;
    use adcx_proto::Pid;
    use std::collections::BTreeSet;

    fn sample_tree() -> (ShareTree, Cid) {
        let tree = ShareTree::new();
        let root = Arc::new(ShareRoot::new(
            PathBuf::from("/mnt/stuff"),
            "Stuff",
            [0].into_iter().collect::<BTreeSet<_>>(),
            false,
        ));
        let dir = Directory::new_root(root, 500);
        let sub = Directory::new_child(&dir, DualString::new("Docs & Notes"), 600);
        let _ = Directory::add_file(
            &sub,
            DualString::new("readme <1>.txt"),
            42,
            700,
            hash_buffer(b"readme").root,
        );
        let _ = Directory::add_file(
            &dir,
            DualString::new("top.bin"),
            100,
            800,
            hash_buffer(b"top").root,
        );
        tree.replace_root_subtree(dir).unwrap();
        (tree, Pid::from_bytes([3u8; 24]).derive_cid())
    }

    #[test]
    fn partial_list_escapes_and_nests() {
        let (tree, cid) = sample_tree();
        let xml = generate_partial_list(&tree, "/Stuff/", true, 0, &cid).unwrap();
        let text = String::from_utf8(xml).unwrap();
        assert!(text.contains("Base=\"/Stuff/\""));
        assert!(text.contains("Docs &amp; Notes"));
        assert!(text.contains("readme &lt;1&gt;.txt"));
        assert!(text.contains("Size=\"42\""));
    }

    #[test]
    fn non_recursive_list_emits_stubs() {
        let (tree, cid) = sample_tree();
        let xml = generate_partial_list(&tree, "/Stuff/", false, 0, &cid).unwrap();
        let text = String::from_utf8(xml).unwrap();
        assert!(text.contains("Incomplete=\"1\""));
        assert!(!text.contains("readme"));
        // Files of the listed directory itself are present.
        assert!(text.contains("top.bin"));
    }

    #[test]
    fn bad_paths_rejected() {
        let (tree, cid) = sample_tree();
        assert!(generate_partial_list(&tree, "Stuff/", true, 0, &cid).is_err());
        assert!(generate_partial_list(&tree, "/Missing/", true, 0, &cid).is_err());
        // Wrong profile sees nothing.
        assert!(generate_partial_list(&tree, "/Stuff/", true, 5, &cid).is_err());
    }

    #[test]
    fn full_list_compresses() {
        let (tree, cid) = sample_tree();
        let list = generate_full_list(&tree, 0, &cid);
        assert!(!list.xml.is_empty());
        assert!(!list.bz2.is_empty());
        assert_eq!(list.revision, tree.revision());

        // The bz2 form decodes back to the xml form.
        let mut decoder = bzip2::read::BzDecoder::new(&list.bz2[..]);
        let mut decoded = Vec::new();
        std::io::Read::read_to_end(&mut decoder, &mut decoded).unwrap();
        assert_eq!(decoded, list.xml);
    }

    #[test]
    fn tth_list_entries() {
        let (tree, _cid) = sample_tree();
        let out = generate_tth_list(&tree, "/Stuff/", true, 0).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches("<File TTH=").count(), 2);
    }

    #[test]
    fn cache_roundtrip() {
        let (tree, _cid) = sample_tree();
        let tmp = tempfile::tempdir().unwrap();
        let roots = tree.roots();
        let saved = save_root_cache(&roots[0], tmp.path()).unwrap();

        let fresh_root = Arc::new(ShareRoot::new(
            PathBuf::from("/mnt/stuff"),
            "Stuff",
            [0].into_iter().collect::<BTreeSet<_>>(),
            false,
        ));
        let loaded = load_root_cache(&saved, fresh_root).unwrap();
        let (bytes, files, dirs) = loaded.totals();
        assert_eq!((bytes, files, dirs), (142, 2, 1));

        let sub = loaded.child_lower("docs & notes").unwrap();
        let file = sub.file_lower("readme <1>.txt").unwrap();
        assert_eq!(file.size, 42);
        assert_eq!(file.tth, hash_buffer(b"readme").root);
    }
}
