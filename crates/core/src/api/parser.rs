//! Decoders for the build service's XML listings.
//!
//! The service returns flat documents (`<directory>` with `<entry/>` and
//! `<linkinfo/>` children, `<status>` on errors), so a small attribute
//! scanner is enough; the result is always one of the model types.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{CommitReply, ManifestEntry};
use crate::errors::ApiError;
use crate::models::{tree_hash, FileEntry, Linkinfo, RevisionMeta, SourceTree};

/// Decode a `<directory>` revision listing.
pub fn parse_directory(xml: &str) -> Result<SourceTree, ApiError> {
    debug!("parsing directory listing ({} bytes)", xml.len());
    let root = element_attrs(xml, "directory")
        .next()
        .ok_or_else(|| ApiError::Parse("missing <directory> element".into()))?;

    let mut files = Vec::new();
    for attrs in element_attrs(xml, "entry") {
        let Some(name) = attr(attrs, "name") else {
            warn!("skipping directory entry without a name");
            continue;
        };
        let md5 = attr(attrs, "md5")
            .ok_or_else(|| ApiError::Parse(format!("entry '{name}' has no md5")))?;
        let size = attr(attrs, "size")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        let mtime = attr(attrs, "mtime")
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or_default();
        files.push(FileEntry {
            name,
            md5,
            size,
            mtime,
            skipped: false,
        });
    }

    let linkinfo = element_attrs(xml, "linkinfo").next().map(|attrs| Linkinfo {
        project: attr(attrs, "project").unwrap_or_default(),
        package: attr(attrs, "package").unwrap_or_default(),
        tree_hash: attr(attrs, "srcmd5").unwrap_or_default(),
        expanded_hash: attr(attrs, "xsrcmd5"),
        unexpanded_hash: attr(attrs, "lsrcmd5"),
        error: attr(attrs, "error"),
        revision: attr(attrs, "rev"),
        base_revision: attr(attrs, "baserev"),
        last_working: attr(attrs, "lastworking"),
    });

    let tree_hash = attr(root, "srcmd5").unwrap_or_else(|| tree_hash(&files));
    let revision = attr(root, "rev").unwrap_or_else(|| tree_hash.clone());

    Ok(SourceTree {
        meta: RevisionMeta {
            revision,
            tree_hash,
            linkinfo,
        },
        files,
    })
}

/// Decode the answer to a `commitfilelist` request.
pub fn parse_commit_reply(xml: &str) -> Result<CommitReply, ApiError> {
    let root = element_attrs(xml, "directory")
        .next()
        .ok_or_else(|| ApiError::Parse("missing <directory> element".into()))?;
    if attr(root, "error").as_deref() == Some("missing") {
        let missing: Vec<String> = element_attrs(xml, "entry")
            .filter_map(|a| attr(a, "name"))
            .collect();
        debug!(count = missing.len(), "server requests missing files");
        return Ok(CommitReply::Missing(missing));
    }
    parse_directory(xml).map(CommitReply::Committed)
}

/// Decode a project's package list.
pub fn parse_package_list(xml: &str) -> Result<Vec<String>, ApiError> {
    if element_attrs(xml, "directory").next().is_none() {
        return Err(ApiError::Parse("missing <directory> element".into()));
    }
    Ok(element_attrs(xml, "entry")
        .filter_map(|a| attr(a, "name"))
        .collect())
}

/// Pull the human-readable summary out of a `<status>` error body.
pub fn parse_status_summary(xml: &str) -> Option<String> {
    extract_tag_content(xml, "summary")
}

/// Encode a commit manifest as a `<directory>` document.
pub fn manifest_to_xml(manifest: &[ManifestEntry]) -> String {
    let mut out = String::from("<directory>\n");
    for entry in manifest {
        out.push_str(&format!(
            "  <entry name=\"{}\" md5=\"{}\"",
            xml_escape(&entry.name),
            entry.md5
        ));
        if let Some(sha) = &entry.sha256 {
            out.push_str(&format!(" hash=\"sha256:{sha}\""));
        }
        out.push_str("/>\n");
    }
    out.push_str("</directory>\n");
    out
}

/// Encode the `_meta` document used when creating a package.
pub fn package_meta_xml(project: &str, package: &str, title: &str) -> String {
    format!(
        "<package name=\"{}\" project=\"{}\">\n  <title>{}</title>\n  <description/>\n</package>\n",
        xml_escape(package),
        xml_escape(project),
        xml_escape(title)
    )
}

/// Iterate over the attribute text of every `<tag ...>` start element.
fn element_attrs<'a>(xml: &'a str, tag: &str) -> impl Iterator<Item = &'a str> + 'a {
    let open = format!("<{tag}");
    let mut search_from = 0;
    std::iter::from_fn(move || {
        while let Some(rel) = xml[search_from..].find(&open) {
            let start = search_from + rel + open.len();
            search_from = start;
            let rest = &xml[start..];
            // Reject prefix matches such as <entryx> when looking for <entry>.
            match rest.chars().next() {
                Some(c) if c == '>' || c == '/' || c.is_ascii_whitespace() => {}
                _ => continue,
            }
            let end = rest.find('>')?;
            search_from = start + end;
            return Some(rest[..end].trim_end_matches('/'));
        }
        None
    })
}

fn attr(attrs: &str, name: &str) -> Option<String> {
    for quote in ['"', '\''] {
        let pattern = format!("{name}={quote}");
        let mut from = 0;
        while let Some(rel) = attrs[from..].find(&pattern) {
            let pos = from + rel;
            // Must start at an attribute boundary (rev= vs baserev=).
            if pos > 0 && !attrs[..pos].ends_with(|c: char| c.is_ascii_whitespace()) {
                from = pos + pattern.len();
                continue;
            }
            let after = &attrs[pos + pattern.len()..];
            let end = after.find(quote)?;
            return Some(xml_unescape(&after[..end]));
        }
    }
    None
}

fn extract_tag_content(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml_unescape(xml[start..start + end].trim()))
}

/// Unescape standard XML entities.
fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
