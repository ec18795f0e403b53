use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use compact_str::CompactString;

use crate::stage::{Stage, StepContext};
use crate::Verdict;


/// The filesystem location a request maps to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PhysicalPath {
    /// The document root of the matched virtual host.
    pub doc_root: PathBuf,
    /// The request path relative to `doc_root`, usually with a leading `/`.
    pub rel_path: String,
}

impl PhysicalPath {
    /// Creates a new [`PhysicalPath`].
    #[inline]
    #[must_use]
    pub fn new(doc_root: impl Into<PathBuf>, rel_path: impl Into<String>) -> Self {
        Self { doc_root: doc_root.into(), rel_path: rel_path.into() }
    }

    /// Returns the full path, which is `doc_root` and `rel_path`
    /// concatenated as-is.
    #[must_use]
    pub fn full_path(&self) -> PathBuf {
        let mut p = OsString::from(self.doc_root.as_os_str());
        p.push(&self.rel_path);
        p.into()
    }
}


/// Connection state that can be content-negotiated.
pub trait Physical {
    /// Returns the physical path of the request.
    fn physical(&mut self) -> &mut PhysicalPath;

    /// Returns the extensions to try for this request, overriding the
    /// stage's defaults. Useful for per-host configuration.
    #[inline]
    fn negotiation_exts(&self) -> Option<&[CompactString]> {
        None
    }
}

impl Physical for PhysicalPath {
    #[inline]
    fn physical(&mut self) -> &mut PhysicalPath {
        self
    }
}


/// Looks for a file to serve in place of a missing `path`.
///
/// If `path` exists, or probing it fails for a reason other than
/// [`io::ErrorKind::NotFound`], there is nothing to negotiate and [`None`]
/// is returned. Otherwise, each extension in `exts` is appended to `path` in
/// order and the first one naming an existing file is returned. Probing stops
/// early on any error other than [`io::ErrorKind::NotFound`].
#[must_use]
pub fn probe<'e, S: AsRef<str>>(path: &Path, exts: &'e [S]) -> Option<&'e str> {
    fn missing(p: &Path) -> Result<bool, io::Error> {
        match fs::metadata(p) {
            Ok(_) => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e),
        }
    }

    match missing(path) {
        Ok(true) => {},
        Ok(false) => return None,
        Err(e) => {
            let error: &dyn std::error::Error = &e;
            tracing::debug!(error, ?path, "cannot probe path, skipping negotiation");
            return None;
        },
    }

    for ext in exts {
        let ext = ext.as_ref();
        let mut candidate = OsString::from(path.as_os_str());
        candidate.push(ext);
        match missing(Path::new(&candidate)) {
            Ok(true) => continue,
            Ok(false) => return Some(ext),
            Err(e) => {
                let error: &dyn std::error::Error = &e;
                tracing::debug!(error, ?candidate, "cannot probe candidate, stopping negotiation");
                return None;
            },
        }
    }
    None
}


/// A docroot stage that maps requests for missing files onto existing files
/// with one of a list of extensions appended.
///
/// For example, with extensions `[".html", ".php"]` a request for `/about`
/// is served from `/about.html` if `/about` does not exist. The stage never
/// fails: if nothing matches, the path is left alone for later stages to
/// produce a `404 Not Found`.
#[derive(Debug, Clone, Default)]
pub struct Negotiation {
    exts: Vec<CompactString>,
}

impl Negotiation {
    /// Creates a [`Negotiation`] stage trying `exts` in order.
    #[must_use]
    pub fn new<I>(exts: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<CompactString>,
    {
        Self { exts: exts.into_iter().map(Into::into).collect() }
    }

    /// Returns the default extensions of this stage.
    #[inline]
    #[must_use]
    pub fn exts(&self) -> &[CompactString] {
        &self.exts
    }
}

impl<C: Physical> Stage<C> for Negotiation {
    #[inline]
    fn name(&self) -> &str {
        "negotiation"
    }

    fn step(&mut self, cx: &mut StepContext<'_, C>) -> Verdict {
        let conn = cx.data_mut();
        let exts = conn.negotiation_exts().unwrap_or(&self.exts).to_vec();
        let physical = conn.physical();
        if physical.rel_path.is_empty() {
            return Verdict::Advance;
        }

        let path = physical.full_path();
        if let Some(ext) = probe(&path, &exts) {
            tracing::debug!(
                rel_path = %physical.rel_path, doc_root = ?physical.doc_root, ext,
                "negotiated request path",
            );
            physical.rel_path.push_str(ext);
        }
        Verdict::Advance
    }
}
