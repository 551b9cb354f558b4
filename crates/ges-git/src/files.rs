//! Files the dumb HTTP protocol may serve.

/// A repository file a dumb client can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// `HEAD`.
    Head,
    /// `info/refs`.
    InfoRefs,
    /// `objects/info/packs`.
    InfoPacks,
    /// `objects/info/alternates`.
    Alternates,
    /// `objects/info/http-alternates`.
    HttpAlternates,
    /// `packed-refs`.
    PackedRefs,
    /// `objects/xx/<38 hex>`.
    LooseObject,
    /// `objects/pack/pack-<40 hex>.pack`.
    Pack,
    /// `objects/pack/pack-<40 hex>.idx`.
    PackIndex,
}

fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit())
}

impl FileKind {
    /// Classifies a path relative to the repository directory. Anything
    /// outside the known set returns `None`.
    pub fn classify(relative: &str) -> Option<Self> {
        match relative {
            "HEAD" => return Some(Self::Head),
            "info/refs" => return Some(Self::InfoRefs),
            "objects/info/packs" => return Some(Self::InfoPacks),
            "objects/info/alternates" => return Some(Self::Alternates),
            "objects/info/http-alternates" => return Some(Self::HttpAlternates),
            "packed-refs" => return Some(Self::PackedRefs),
            _ => {}
        }

        let rest = relative.strip_prefix("objects/")?;
        if let Some(name) = rest.strip_prefix("pack/pack-") {
            if let Some(hash) = name.strip_suffix(".pack") {
                return is_hex(hash, 40).then_some(Self::Pack);
            }
            if let Some(hash) = name.strip_suffix(".idx") {
                return is_hex(hash, 40).then_some(Self::PackIndex);
            }
            return None;
        }

        let (dir, file) = rest.split_once('/')?;
        (is_hex(dir, 2) && is_hex(file, 38)).then_some(Self::LooseObject)
    }

    /// Content type served for this file.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::LooseObject => "application/x-git-loose-object",
            Self::Pack => "application/x-git-packed-objects",
            Self::PackIndex => "application/x-git-packed-objects-toc",
            _ => "text/plain; charset=utf-8",
        }
    }

    /// Object files never change once written; everything else does.
    pub fn is_immutable(&self) -> bool {
        matches!(self, Self::LooseObject | Self::Pack | Self::PackIndex)
    }
}
