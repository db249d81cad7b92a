//! Served-process configuration rendering
//!
//! Two template bodies are loaded once at startup: one for sites without a
//! certificate (plain HTTP) and one for sites with a certificate (HTTPS).
//! Placeholders are written as `{{ name }}`; the set of names is fixed by
//! [`Placeholder`], so a typo in a template surfaces as a [`RenderError`]
//! instead of silently producing broken configuration.

use crate::error::{ConfigError, RenderError};
use crate::site::Site;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Template used for sites without certificate material
pub const HTTP_TEMPLATE: &str = "http.conf.tmpl";
/// Template used for sites with both `key.pem` and `fullchain.pem`
pub const HTTPS_TEMPLATE: &str = "https.conf.tmpl";

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Substitution keys a template may reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// All domains of the site, joined by a single space
    Domains,
    /// Upstream address
    Target,
    /// Document root that serves challenge files
    DocumentRoot,
    /// Site name
    SiteName,
    /// Absolute path of the site's full chain certificate
    Certificate,
    /// Absolute path of the site's private key
    PrivateKey,
}

impl Placeholder {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "domains" => Some(Self::Domains),
            "target" => Some(Self::Target),
            "document_root" => Some(Self::DocumentRoot),
            "site_name" => Some(Self::SiteName),
            "certificate" => Some(Self::Certificate),
            "private_key" => Some(Self::PrivateKey),
            _ => None,
        }
    }

    fn value(self, site: &Site, document_root: &Path) -> String {
        match self {
            Self::Domains => site.domains().join(" "),
            Self::Target => site.target().to_string(),
            Self::DocumentRoot => document_root.display().to_string(),
            Self::SiteName => site.name().to_string(),
            Self::Certificate => site.certificate_file().display().to_string(),
            Self::PrivateKey => site.private_key_file().display().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Slot(Placeholder),
}

/// A parsed template body
#[derive(Debug, Clone)]
pub struct Template {
    name: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(name: impl Into<String>, body: &str) -> Result<Self, RenderError> {
        let name = name.into();
        let mut segments = Vec::new();
        let mut rest = body;
        let mut offset = 0;

        while let Some(start) = rest.find(OPEN) {
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            let after_open = &rest[start + OPEN.len()..];
            let end = after_open.find(CLOSE).ok_or_else(|| RenderError::Unterminated {
                template: name.clone(),
                offset: offset + start,
            })?;
            let key = after_open[..end].trim();
            let placeholder = Placeholder::from_name(key).ok_or_else(|| RenderError::UnknownPlaceholder {
                template: name.clone(),
                name: key.to_string(),
            })?;
            segments.push(Segment::Slot(placeholder));

            let consumed = start + OPEN.len() + end + CLOSE.len();
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Self { name, segments })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn render(&self, site: &Site, document_root: &Path) -> String {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Text(text) => text.clone(),
                Segment::Slot(placeholder) => placeholder.value(site, document_root),
            })
            .collect()
    }
}

/// Renders a site into served-process configuration text
#[derive(Debug, Clone)]
pub struct Renderer {
    http: Template,
    https: Template,
    document_root: PathBuf,
}

impl Renderer {
    pub fn new(http: Template, https: Template, document_root: impl Into<PathBuf>) -> Self {
        Self {
            http,
            https,
            document_root: document_root.into(),
        }
    }

    /// Load both template bodies from `template_dir`
    pub fn load(template_dir: impl AsRef<Path>, document_root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let template_dir = template_dir.as_ref();
        info!(path = %template_dir.display(), "Initializing templates");
        let http = read_template(template_dir, HTTP_TEMPLATE)?;
        let https = read_template(template_dir, HTTPS_TEMPLATE)?;
        Ok(Self::new(http, https, document_root))
    }

    /// Render `site` with the template matching its certificate state.
    ///
    /// Templates are validated when parsed, so a [`Renderer`] built from
    /// [`Template::parse`] never fails here; the `Result` keeps the contract
    /// explicit for callers.
    pub fn render(&self, site: &Site, has_certificate: bool) -> Result<String, RenderError> {
        let template = if has_certificate { &self.https } else { &self.http };
        debug!(site = %site, template = template.name(), "Rendering site config");
        Ok(template.render(site, &self.document_root))
    }
}

fn read_template(dir: &Path, file: &str) -> Result<Template, ConfigError> {
    let path = dir.join(file);
    let body = std::fs::read_to_string(&path).map_err(|source| ConfigError::Template {
        path: path.clone(),
        source,
    })?;
    Ok(Template::parse(file, &body)?)
}
