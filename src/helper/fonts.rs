//! Font lookups answered on behalf of confined workers.

use crate::config::settings::ZygoteSettings;
use crate::ipc::protocol::{FontMatch, FontQuery};
use log::{debug, warn};
use std::fs::File;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const FONT_EXTENSIONS: &[&str] = &["ttf", "otf", "ttc", "pfa", "pfb"];

/// Source of fonts the helper can hand out
pub trait FontCatalog {
    /// Best match for `query`, or `None`
    fn match_family(&self, query: &FontQuery) -> Option<FontMatch>;

    /// Open the file behind `fileid` read-only
    fn open(&self, fileid: u32) -> Option<File>;

    /// Family that can render every code point, empty when there is none
    fn family_for_chars(&self, chars: &[u32]) -> String;
}

/// One font file found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FontFile {
    pub path: PathBuf,
    pub family: String,
    pub bold: bool,
    pub italic: bool,
}

impl FontFile {
    /// Derive family and style from a `Family-Style.ext` file name
    fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        if !FONT_EXTENSIONS.contains(&extension.as_str()) {
            return None;
        }

        let stem = path.file_stem()?.to_str()?;
        let (family, style) = match stem.split_once('-') {
            Some((family, style)) => (family, style.to_ascii_lowercase()),
            None => (stem, String::new()),
        };
        if family.is_empty() {
            return None;
        }

        Some(Self {
            path: path.to_path_buf(),
            family: family.to_string(),
            bold: style.contains("bold"),
            italic: style.contains("italic") || style.contains("oblique"),
        })
    }

    fn style_distance(&self, query: &FontQuery) -> u8 {
        u8::from(self.bold != query.is_bold) + u8::from(self.italic != query.is_italic)
    }
}

/// Case- and spacing-insensitive family key
fn family_key(family: &str) -> String {
    family
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Catalog built by scanning font directories once.
///
/// A file's id is its index in path order, so ids are stable for as long
/// as the directories do not change.
#[derive(Debug, Clone, Default)]
pub struct DirectoryFontCatalog {
    fonts: Vec<FontFile>,
    default_family: String,
}

impl DirectoryFontCatalog {
    pub fn scan<P: AsRef<Path>>(directories: &[P], default_family: &str) -> Self {
        let mut fonts: Vec<FontFile> = directories
            .iter()
            .flat_map(|dir| {
                let dir = dir.as_ref();
                if !dir.is_dir() {
                    debug!("Font directory {} not present", dir.display());
                }
                WalkDir::new(dir)
                    .follow_links(true)
                    .into_iter()
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_type().is_file())
                    .filter_map(|e| FontFile::from_path(e.path()))
            })
            .collect();

        fonts.sort_by(|a, b| a.path.cmp(&b.path));
        fonts.dedup_by(|a, b| a.path == b.path);
        debug!("Font catalog holds {} files", fonts.len());

        Self {
            fonts,
            default_family: default_family.to_string(),
        }
    }

    pub fn from_settings(settings: &ZygoteSettings) -> Self {
        Self::scan(settings.font_directories.as_slice(), &settings.default_font_family)
    }

    pub fn fonts(&self) -> &[FontFile] {
        &self.fonts
    }

    fn best_in_family(&self, family: &str, query: &FontQuery) -> Option<(u32, &FontFile)> {
        let key = family_key(family);
        self.fonts
            .iter()
            .enumerate()
            .filter(|(_, font)| family_key(&font.family) == key)
            .min_by_key(|(index, font)| (font.style_distance(query), *index))
            .map(|(index, font)| (index as u32, font))
    }
}

impl FontCatalog for DirectoryFontCatalog {
    fn match_family(&self, query: &FontQuery) -> Option<FontMatch> {
        // Keep the worker on its current file while it still fits the request.
        if let Some(font) = query.fileid.and_then(|id| self.fonts.get(id as usize)) {
            if family_key(&font.family) == family_key(&query.family)
                && font.style_distance(query) == 0
            {
                return query.fileid.map(|fileid| FontMatch {
                    fileid,
                    family: font.family.clone(),
                });
            }
        }

        let (fileid, font) = self
            .best_in_family(&query.family, query)
            .or_else(|| self.best_in_family(&self.default_family, query))?;

        Some(FontMatch {
            fileid,
            family: font.family.clone(),
        })
    }

    fn open(&self, fileid: u32) -> Option<File> {
        let font = self.fonts.get(fileid as usize)?;
        match File::open(&font.path) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!("Cannot open font {}: {}", font.path.display(), e);
                None
            }
        }
    }

    /// The catalog keeps no glyph coverage data, so any valid input gets
    /// the default family (or the first font when that family is absent).
    fn family_for_chars(&self, chars: &[u32]) -> String {
        if chars.is_empty() || chars.iter().any(|c| char::from_u32(*c).is_none()) {
            return String::new();
        }

        let key = family_key(&self.default_family);
        self.fonts
            .iter()
            .find(|font| family_key(&font.family) == key)
            .or_else(|| self.fonts.first())
            .map(|font| font.family.clone())
            .unwrap_or_default()
    }
}
