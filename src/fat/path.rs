//! Path normalization and component-wise resolution.
//!
//! Relative paths are canonicalized against the printable working
//! directory before descending, so `.` and `..` are handled structurally
//! and the unreliable on-disk `..` entries are never followed.

use heapless::{String, Vec};

use super::dir::FileInfo;
use super::names::short_name_to_display;
use super::Volume;
use crate::config::{MAX_NAME, MAX_PATH};
use crate::error::Error;
use crate::link::Link;

/// Deepest path the resolver will walk.
const MAX_COMPONENTS: usize = 64;

/// Outcome of resolving a path: the terminal component's first cluster,
/// the location of its 32-byte entry, and the decoded info record.
pub(super) struct Resolved {
    pub cluster: u32,
    pub info: FileInfo,
}

/// Collapse a possibly-relative path into a canonical absolute one:
/// join with `cwd`, squeeze slash runs, apply `.` and `..`.
pub(super) fn normalize(cwd: &str, path: &str) -> Result<String<MAX_PATH>, Error> {
    let mut joined: String<MAX_PATH> = String::new();
    if !path.starts_with('/') {
        joined.push_str(cwd).map_err(|_| Error::PathTooLong)?;
        joined.push('/').map_err(|_| Error::PathTooLong)?;
    }
    joined.push_str(path).map_err(|_| Error::PathTooLong)?;

    let mut components: Vec<&str, MAX_COMPONENTS> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            _ => {
                if segment.len() > MAX_NAME {
                    return Err(Error::InvalidName);
                }
                components.push(segment).map_err(|_| Error::PathTooLong)?;
            }
        }
    }

    let mut out: String<MAX_PATH> = String::new();
    if components.is_empty() {
        out.push('/').map_err(|_| Error::PathTooLong)?;
    } else {
        for component in components {
            out.push('/').map_err(|_| Error::PathTooLong)?;
            out.push_str(component).map_err(|_| Error::PathTooLong)?;
        }
    }
    Ok(out)
}

/// Split a canonical path into its parent and basename. The root has
/// itself as parent and an empty basename.
pub(super) fn split_parent(canonical: &str) -> (&str, &str) {
    match canonical.rfind('/') {
        Some(0) if canonical.len() == 1 => ("/", ""),
        Some(0) => ("/", &canonical[1..]),
        Some(idx) => (&canonical[..idx], &canonical[idx + 1..]),
        None => ("/", canonical),
    }
}

fn eq_ignore_ascii_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.eq_ignore_ascii_case(y))
}

impl<L: Link> Volume<L> {
    /// Walk `path` to its terminal component. Matching is ASCII
    /// case-insensitive against both the assembled long name and the
    /// 8.3 short name of every entry.
    pub(super) fn resolve(&mut self, path: &str) -> Result<Resolved, Error> {
        if path.is_empty() {
            return self.resolve_canonical("/");
        }
        let canonical = normalize(self.cwd_path.as_str(), path)?;
        self.resolve_canonical(canonical.as_str())
    }

    pub(super) fn resolve_canonical(&mut self, canonical: &str) -> Result<Resolved, Error> {
        let root = self.root_dir_cluster();
        if canonical == "/" {
            return Ok(Resolved {
                cluster: root,
                info: FileInfo::root(root),
            });
        }

        let mut dir_cluster = root;
        let mut segments = canonical.split('/').filter(|s| !s.is_empty()).peekable();
        loop {
            let segment = match segments.next() {
                Some(s) => s,
                None => return Err(Error::Internal),
            };
            let last = segments.peek().is_none();

            let info = self.find_in_dir(dir_cluster, segment)?;
            if last {
                return Ok(Resolved {
                    cluster: info.first_cluster,
                    info,
                });
            }
            if !info.is_dir() {
                return Err(Error::NotDir);
            }
            dir_cluster = if info.first_cluster >= 2 {
                info.first_cluster
            } else {
                root
            };
        }
    }

    /// Scan one directory for a component name.
    fn find_in_dir(&mut self, dir_cluster: u32, segment: &str) -> Result<FileInfo, Error> {
        let mut dir = self.open_dir_cluster(dir_cluster)?;
        loop {
            let info = match self.readdir(&mut dir) {
                Ok(info) => info,
                Err(Error::Eof) => return Err(Error::NotFound),
                Err(e) => return Err(e),
            };

            if eq_ignore_ascii_case(segment.as_bytes(), info.name().as_bytes()) {
                return Ok(info);
            }
            let mut short = [0u8; 12];
            let short_len = short_name_to_display(&info.short_name, &mut short);
            if eq_ignore_ascii_case(segment.as_bytes(), &short[..short_len]) {
                return Ok(info);
            }
        }
    }
}
