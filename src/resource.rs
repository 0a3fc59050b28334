use std::borrow::Cow;
use std::collections::HashMap;

use regex::RegexSet;

/// Identifies a cached artifact: the logical upstream, the path beneath
/// it, and the final path segment.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub(crate) struct ObjectKey {
    pub(crate) vhost: String,
    pub(crate) uri: String,
    pub(crate) basename: String,
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.vhost, self.uri)
    }
}

/// How an artifact is cached.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum FileKind {
    /// Immutable package artifact, cached by name indefinitely.
    Static,
    /// Mutable repository metadata, subject to revalidation.
    Index,
}

#[derive(Debug, Eq, PartialEq)]
pub(crate) enum ClassifyReject {
    /// Undecodable percent-encoding.
    BadEncoding,
    /// Structurally unusable path (empty, traversal, bad characters).
    Malformed(&'static str),
    /// The first path segment does not name a configured upstream.
    UnknownVhost(String),
    /// Basename matched by neither pattern set; refused so the server
    /// cannot be used as an open relay.
    ForbiddenBasename(String),
}

/// Immutable artifacts. Extended at startup by the `static_files`
/// configuration patterns.
const STATIC_FILE_PATTERNS: &[&str] = &[
    r"\.deb$",
    r"\.udeb$",
    r"\.ddeb$",
    r"\.rpm$",
    r"\.drpm$",
    r"\.srpm$",
    r"\.dsc$",
    r"\.tar\.(?:gz|bz2|xz|zst)$",
    r"\.diff\.gz$",
    r"\.jigdo$",
    r"\.template$",
    /* by-hash objects are content addressed and never change */
    r"^[0-9a-fA-F]{40,128}$",
];

/// Mutable repository metadata. Extended at startup by the
/// `index_files` configuration patterns.
const INDEX_FILE_PATTERNS: &[&str] = &[
    r"^(?:In)?Release$",
    r"^Release\.gpg$",
    r"^Packages(?:\.(?:gz|bz2|xz|zst))?$",
    r"^Sources(?:\.(?:gz|bz2|xz|zst))?$",
    r"^Contents-[A-Za-z0-9_.-]+(?:\.(?:gz|xz))?$",
    r"^Translation-[A-Za-z0-9_.-]+(?:\.(?:gz|bz2|xz))?$",
    r"^repomd\.xml(?:\.asc|\.key)?$",
    r"(?:^|-)(?:primary|filelists|other|comps|updateinfo|prestodelta)\.(?:xml|sqlite)(?:\.(?:gz|bz2|xz|zst))?$",
    r"^pkglist(?:\.[A-Za-z0-9_.-]+)?$",
    r"^release(?:\.[A-Za-z0-9_.-]+)?$",
];

/// Basename pattern sets, compiled once at startup.
#[derive(Debug)]
pub(crate) struct Classifier {
    static_files: RegexSet,
    index_files: RegexSet,
}

impl Classifier {
    pub(crate) fn new(extra_static: &[String], extra_index: &[String]) -> anyhow::Result<Self> {
        let static_files = RegexSet::new(
            STATIC_FILE_PATTERNS
                .iter()
                .map(|p| (*p).to_owned())
                .chain(extra_static.iter().cloned()),
        )?;
        let index_files = RegexSet::new(
            INDEX_FILE_PATTERNS
                .iter()
                .map(|p| (*p).to_owned())
                .chain(extra_index.iter().cloned()),
        )?;

        Ok(Self {
            static_files,
            index_files,
        })
    }

    #[must_use]
    pub(crate) fn kind_of(&self, basename: &str) -> Option<FileKind> {
        /* Index wins: `Release` should never be mistaken for a static
         * artifact by a user-supplied pattern. */
        if self.index_files.is_match(basename) {
            Some(FileKind::Index)
        } else if self.static_files.is_match(basename) {
            Some(FileKind::Static)
        } else {
            None
        }
    }

    /// Resolves a decoded request path to an object key.
    ///
    /// The path must already be stripped of the authority and of the
    /// optional `/pkg-cacher` prefix.
    pub(crate) fn classify(
        &self,
        path: &str,
        path_map: &HashMap<String, Vec<String>>,
    ) -> Result<(ObjectKey, FileKind), ClassifyReject> {
        let decoded: Cow<'_, str> = match urlencoding::decode(path) {
            Ok(d) => d,
            Err(_) => return Err(ClassifyReject::BadEncoding),
        };

        let trimmed = decoded.trim_start_matches('/');
        let trimmed = trimmed.strip_prefix("pkg-cacher/").unwrap_or(trimmed);

        let Some((vhost, uri)) = trimmed.split_once('/') else {
            return Err(ClassifyReject::Malformed("missing path below vhost"));
        };

        if !crate::config::valid_vhost(vhost) {
            return Err(ClassifyReject::Malformed("invalid vhost segment"));
        }

        if uri.is_empty() {
            return Err(ClassifyReject::Malformed("empty uri"));
        }

        for segment in uri.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(ClassifyReject::Malformed("path traversal segment"));
            }
            if segment
                .chars()
                .any(|c| !c.is_ascii() || c.is_ascii_control() || c == '\\')
            {
                return Err(ClassifyReject::Malformed("unsupported path characters"));
            }
        }

        if !path_map.contains_key(vhost) {
            return Err(ClassifyReject::UnknownVhost(vhost.to_owned()));
        }

        let basename = uri
            .rsplit('/')
            .next()
            .expect("split of non-empty string yields at least one part");

        let Some(kind) = self.kind_of(basename) else {
            return Err(ClassifyReject::ForbiddenBasename(basename.to_owned()));
        };

        Ok((
            ObjectKey {
                vhost: vhost.to_owned(),
                uri: uri.to_owned(),
                basename: basename.to_owned(),
            },
            kind,
        ))
    }
}
